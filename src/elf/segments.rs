//! Program headers describe segments, the regions the run-time loader cares
//! about. Also see sections. The object groups them by type and keeps each
//! group sorted by virtual address so address lookups can binary search.
use super::{Reader, Result, Stream};

pub const EXECUTE_FLAG: u32 = 0x1;
pub const WRITE_FLAG: u32 = 0x2;
pub const READ_FLAG: u32 = 0x4;

/// Describes one segment.
#[derive(Clone)]
pub struct ProgramHeader {
    pub stype: SegmentType,

    /// Offset to the first byte of the segment within the file.
    pub offset: u64,

    /// Virtual address of the first byte in the segment.
    pub vaddr: u64,

    /// Physical address of the first byte in the segment.
    pub paddr: u64,

    /// Number of bytes the segment occupies in the file.
    pub file_size: u64,

    /// Number of bytes the segment occupies in memory.
    pub mem_size: u64,

    /// Read/Write/Execute flags.
    pub flags: u32,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SegmentType {
    /// Not to be used.
    Null,

    /// A loadable segment, described by p_filesz and p_memsz. These
    /// partition the loaded virtual address space.
    Load,

    /// Dynamic linking information.
    Dynamic,

    /// Location of a null-terminated path name to invoke as an interpreter.
    Interpreter,

    /// Auxiliary information: build ids, core process state, etc.
    Note,

    /// Reserved but has unspecified semantics.
    Shlib,

    /// The location and size of the program header table itself.
    Phdr,

    /// The thread-local storage template.
    Tls,

    /// OS- and processor-specific types, kept distinct so grouping by type
    /// doesn't merge them.
    Unknown(u32),
}

impl SegmentType {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => SegmentType::Null,
            1 => SegmentType::Load,
            2 => SegmentType::Dynamic,
            3 => SegmentType::Interpreter,
            4 => SegmentType::Note,
            5 => SegmentType::Shlib,
            6 => SegmentType::Phdr,
            7 => SegmentType::Tls,
            _ => SegmentType::Unknown(value),
        }
    }
}

impl ProgramHeader {
    pub fn new(reader: &Reader, offset: u64) -> Result<Self> {
        // Field sizes and order differ between 32-bit and 64-bit ELF files,
        // see https://llvm.org/doxygen/BinaryFormat_2ELF_8h_source.html.
        let mut s = Stream::new(reader, offset);
        if reader.sixty_four_bit {
            let p_type = SegmentType::from_u32(s.read_word()?);
            let p_flags = s.read_word()?;
            let p_offset = s.read_offset()?;
            let p_vaddr = s.read_addr()?;
            let p_paddr = s.read_addr()?;
            let p_filesz = s.read_xword()?;
            let p_memsz = s.read_xword()?;
            let _p_align = s.read_xword()?;
            Ok(ProgramHeader {
                stype: p_type,
                flags: p_flags,
                offset: p_offset,
                vaddr: p_vaddr,
                paddr: p_paddr,
                file_size: p_filesz,
                mem_size: p_memsz,
            })
        } else {
            let p_type = SegmentType::from_u32(s.read_word()?);
            let p_offset = s.read_offset()?;
            let p_vaddr = s.read_addr()?;
            let p_paddr = s.read_addr()?;
            let p_filesz = s.read_word()? as u64;
            let p_memsz = s.read_word()? as u64;
            let p_flags = s.read_word()?;
            let _p_align = s.read_word()? as u64;
            Ok(ProgramHeader {
                stype: p_type,
                flags: p_flags,
                offset: p_offset,
                vaddr: p_vaddr,
                paddr: p_paddr,
                file_size: p_filesz,
                mem_size: p_memsz,
            })
        }
    }

    pub fn contains(&self, vaddr: u64) -> bool {
        self.vaddr <= vaddr && vaddr < self.vaddr.saturating_add(self.mem_size)
    }

    /// Translate a virtual address within this segment to a file offset.
    pub fn to_offset(&self, vaddr: u64) -> Option<u64> {
        if self.contains(vaddr) {
            Some(self.offset + (vaddr - self.vaddr))
        } else {
            None
        }
    }

    pub fn executable(&self) -> bool {
        self.flags & EXECUTE_FLAG != 0
    }

    pub fn writeable(&self) -> bool {
        self.flags & WRITE_FLAG != 0
    }

    pub fn readable(&self) -> bool {
        self.flags & READ_FLAG != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_64_bit_header() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        bytes.extend_from_slice(&(EXECUTE_FLAG | READ_FLAG).to_le_bytes());
        bytes.extend_from_slice(&0x1000u64.to_le_bytes()); // offset
        bytes.extend_from_slice(&0x401000u64.to_le_bytes()); // vaddr
        bytes.extend_from_slice(&0x401000u64.to_le_bytes()); // paddr
        bytes.extend_from_slice(&0x200u64.to_le_bytes()); // filesz
        bytes.extend_from_slice(&0x300u64.to_le_bytes()); // memsz
        bytes.extend_from_slice(&0x1000u64.to_le_bytes()); // align
        let reader = Reader::owned(bytes, "phdr bytes", &Reader::empty());

        let ph = ProgramHeader::new(&reader, 0).unwrap();
        assert_eq!(ph.stype, SegmentType::Load);
        assert!(ph.executable() && ph.readable() && !ph.writeable());
        assert!(ph.contains(0x4012ff));
        assert!(!ph.contains(0x401300));
        assert_eq!(ph.to_offset(0x401080), Some(0x1080));
    }

    #[test]
    fn unknown_types_stay_distinct() {
        let a = SegmentType::from_u32(0x6474e550);
        let b = SegmentType::from_u32(0x6474e551);
        assert_ne!(a, b);
        assert_eq!(a, SegmentType::Unknown(0x6474e550));
    }
}
