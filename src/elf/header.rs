//! The ELF header proper. The identification bytes (magic, class, data,
//! version) are validated when the `Reader` is created; this parses the rest.
use super::{Reader, Result, Stream};

pub const SHN_UNDEF: u16 = 0;
pub const SHN_XINDEX: u16 = 0xffff;

pub struct ElfHeader {
    /// Relocatable, executable, shared object, or core.
    pub etype: u16,

    /// Target architecture, e.g. x86-64 or aarch64.
    pub machine: u16,

    /// Entry point virtual address. Zero if the image has none.
    pub entry: u64,

    pub ph_offset: u64,
    pub ph_entry_size: u16,
    pub num_ph_entries: u16,

    pub section_offset: u64,
    pub section_entry_size: u16,

    /// Zero with a nonzero entry size means the real count lives in section
    /// zero's sh_size.
    pub num_section_entries: u16,

    /// Index of the section name string table; SHN_XINDEX means the real
    /// index lives in section zero's sh_link.
    pub string_table_index: u16,

    abi: u8,
}

impl ElfHeader {
    pub fn new(reader: &Reader) -> Result<Self> {
        let abi = reader.read_byte(7)?;
        let mut s = Stream::new(reader, 16);
        let etype = s.read_half()?;
        let machine = s.read_half()?;
        let _version = s.read_word()?;
        let entry = s.read_addr()?;
        let ph_offset = s.read_offset()?;
        let section_offset = s.read_offset()?;
        let _flags = s.read_word()?;
        let _ehsize = s.read_half()?;
        let ph_entry_size = s.read_half()?;
        let num_ph_entries = s.read_half()?;
        let section_entry_size = s.read_half()?;
        let num_section_entries = s.read_half()?;
        let string_table_index = s.read_half()?;
        Ok(ElfHeader {
            etype,
            machine,
            entry,
            ph_offset,
            ph_entry_size,
            num_ph_entries,
            section_offset,
            section_entry_size,
            num_section_entries,
            string_table_index,
            abi,
        })
    }

    pub fn stype(&self) -> &'static str {
        match self.etype {
            1 => "relocatable",
            2 => "executable",
            3 => "shared object",
            4 => "core",
            _ => "unknown",
        }
    }

    pub fn machine(&self) -> &'static str {
        // see https://llvm.org/doxygen/BinaryFormat_2ELF_8h_source.html
        match self.machine {
            0x03 => "x86",
            0x08 => "MIPS",
            0x28 => "ARM",
            0x32 => "IA-64",
            0x3e => "x86-64",
            0xb7 => "AArch64",
            0xf3 => "RISC-V",
            _ => "unknown machine",
        }
    }

    pub fn abi(&self) -> &'static str {
        match self.abi {
            0x00 => "System V",
            0x03 => "Linux",
            0x09 => "FreeBSD",
            0x0c => "OpenBSD",
            _ => "unknown ABI",
        }
    }
}
