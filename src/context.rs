//! Process-wide options shared by every image opened during one trace:
//! where to look for separate debug info, how chatty to be, and an optional
//! debuginfod client for fetching debug info over the network.
use crate::elf::{ElfFile, Reader, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A client that can fetch debug info for a build id, in the shape of
/// elfutils' debuginfod. Injected so the network stack stays out of the
/// object model.
pub trait DebuginfodClient {
    /// Returns a local path holding the debug info for `build_id`, typically
    /// a download cache entry.
    fn find_debuginfo(&self, build_id: &[u8]) -> Option<PathBuf>;
}

#[derive(Default)]
pub struct Options {
    /// Never go looking for separate debug images.
    pub no_ext_debug: bool,
}

pub struct Context {
    pub options: Options,

    /// 0 is quiet; 1 narrates companion discovery; 2 adds per-miss detail.
    pub verbose: u32,

    /// Searched in order for separate debug images.
    pub debug_dirs: Vec<PathBuf>,

    pub debuginfod: Option<Box<dyn DebuginfodClient>>,
}

impl Default for Context {
    fn default() -> Self {
        Context {
            options: Options::default(),
            verbose: 0,
            debug_dirs: vec![PathBuf::from("/usr/lib/debug")],
            debuginfod: None,
        }
    }
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }

    pub fn debug_directories(&self) -> &[PathBuf] {
        &self.debug_dirs
    }

    /// Open the image at `path` as a primary (non-debug) object.
    pub fn open(self: &Arc<Self>, path: &Path) -> Result<ElfFile> {
        ElfFile::open(Arc::clone(self), path)
    }

    /// Search the debug directories for a relative path (such as
    /// `.build-id/ab/cdef....debug`) and open the first hit as a debug
    /// image. Unreadable or malformed candidates are skipped.
    pub fn debug_image(self: &Arc<Self>, relpath: &Path) -> Option<ElfFile> {
        for dir in self.debug_directories() {
            let path = dir.join(relpath);
            if !path.is_file() {
                continue;
            }
            match Reader::open(&path) {
                Ok(reader) => match ElfFile::new(Arc::clone(self), reader, true) {
                    Ok(file) => return Some(file),
                    Err(err) => {
                        if self.verbose > 0 {
                            debug!("failed to load debug image {}: {err}", path.display());
                        }
                    }
                },
                Err(err) => {
                    if self.verbose > 0 {
                        debug!("failed to read debug image {}: {err}", path.display());
                    }
                }
            }
        }
        None
    }
}
