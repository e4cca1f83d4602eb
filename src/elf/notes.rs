//! The notes in an ELF file. For cores these describe the process; for exes
//! they describe the build, most importantly the GNU build id used to locate
//! separate debug info. Notes live in PT_NOTE segments as a packed sequence
//! of (name, type, descriptor) records with 4-byte alignment between fields.
use super::{ProgramHeader, Reader};
use tracing::warn;

pub const NT_GNU_BUILD_ID: u32 = 3;

/// One note, with the descriptor left as a view so large descriptors are
/// only read if the caller wants them.
pub struct NoteDesc {
    pub name: String,
    pub ntype: u32,
    data: Reader,
}

impl NoteDesc {
    pub fn data(&self) -> &Reader {
        &self.data
    }

    /// The descriptor bytes, materialized.
    pub fn bytes(&self) -> Vec<u8> {
        self.data
            .slice(0, self.data.size() as usize)
            .map(|b| b.to_vec())
            .unwrap_or_default()
    }
}

fn align_to_word(n: u32) -> u64 {
    ((n as u64) + 3) & !3
}

/// Iterates the notes of every PT_NOTE segment in turn. The iterator holds
/// its own view over the current segment, so it stays valid however long the
/// caller keeps it.
pub struct NotesIter<'a> {
    phdrs: &'a [ProgramHeader],
    file_io: Reader,
    segment: usize,
    io: Option<Reader>,
    offset: u64,
}

impl<'a> NotesIter<'a> {
    pub(crate) fn new(phdrs: &'a [ProgramHeader], file_io: &Reader) -> Self {
        NotesIter {
            phdrs,
            file_io: file_io.clone(),
            segment: 0,
            io: None,
            offset: 0,
        }
    }
}

impl Iterator for NotesIter<'_> {
    type Item = NoteDesc;

    fn next(&mut self) -> Option<NoteDesc> {
        loop {
            let ph = self.phdrs.get(self.segment)?;
            if self.io.is_none() {
                self.offset = 0;
                self.io = Some(self.file_io.view("note segment", ph.offset, ph.file_size));
            }
            let io = self.io.as_ref()?;

            if self.offset + 12 <= io.size() {
                let note = read_note(io, self.offset);
                if let Some((note, next_offset)) = note {
                    self.offset = next_offset;
                    return Some(note);
                }
                warn!("failed to read note at offset {} of {}", self.offset, io.tag());
            }
            self.segment += 1;
            self.io = None;
        }
    }
}

fn read_note(io: &Reader, offset: u64) -> Option<(NoteDesc, u64)> {
    let n_namesz = io.read_word(offset).ok()?;
    let n_descsz = io.read_word(offset + 4).ok()?;
    let n_type = io.read_word(offset + 8).ok()?;

    let name = if n_namesz > 0 {
        let bytes = io.slice(offset + 12, n_namesz as usize - 1).ok()?;
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        String::new()
    };

    let desc_offset = offset + 12 + align_to_word(n_namesz);
    let data = io.view("note descriptor", desc_offset, n_descsz as u64);
    let next = desc_offset + align_to_word(n_descsz);
    Some((
        NoteDesc {
            name,
            ntype: n_type,
            data,
        },
        next,
    ))
}
