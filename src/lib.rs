//! The ELF object model behind a symbolic stack tracer. A [`context::Context`]
//! opens images as [`elf::ElfFile`]s; the unwinder then asks which segment
//! contains an address, what symbol covers it, what a dynamic name resolves
//! to, and where the separate debug info lives.
pub mod context;
pub mod elf;

pub use context::Context;
pub use elf::{ElfError, ElfFile, Reader};
