//! Generic ELF file support: everything a symbolic unwinder needs to ask of
//! an executable, shared object, core file, or separate debug image.
//! Quick ELF reference: https://gist.github.com/x0nu11byt3/bcb35c3de461e5fb66173071a2379779
//!
//! ELF files start with an ELF header which includes:
//! * A magic number to identify the file as an ELF file.
//! * The architecture, e.g. Linux AMD x86-64.
//! * The offset to and number of program headers.
//! * The offset to and number of section headers.
//!
//! Program headers identify segments. Segments are used by the OS to load an
//! exe into memory; PT_LOAD segments partition the virtual address space, so
//! they answer "which region contains this address". PT_NOTE segments carry
//! metadata such as the GNU build id.
//!
//! Section headers identify sections: symbol tables, string tables, the
//! dynamic table, hash tables, version tables, debug info. Section bodies
//! may be zlib-compressed; the `.gnu_debugdata` section embeds an entire
//! LZMA-compressed secondary ELF image. Symbol and hash tables are parsed
//! lazily, because a stack trace usually touches only a handful of them.
pub mod elf_file;
pub mod hash;
pub mod header;
pub mod io;
pub mod notes;
pub mod sections;
pub mod segments;
pub mod symbols;
pub mod versions;

pub use elf_file::*;
pub use hash::*;
pub use header::*;
pub use io::*;
pub use notes::*;
pub use sections::*;
pub use segments::*;
pub use symbols::*;
pub use versions::*;

#[cfg(test)]
pub(crate) mod testdata;
