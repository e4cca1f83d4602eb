//! Sections describe the link-time view of an image: symbol tables, string
//! tables, code, data, debug info. Also see segments. A `Section` pairs the
//! parsed header with a lazily-built reader over the section's logical bytes,
//! decompressing `SHF_COMPRESSED` and legacy `.zdebug_*` bodies on first use.
use super::{Reader, Result, Stream};
use std::cell::OnceCell;
use tracing::warn;

/// Section occupies memory during execution.
pub const ALLOC_FLAG: u64 = 1 << 1;

/// Section holds compressed data, with a Chdr in front.
pub const COMPRESSED_FLAG: u64 = 1 << 11;

#[cfg(feature = "zlib")]
const ELFCOMPRESS_ZLIB: u32 = 1;

/// Describes a section.
#[derive(Clone)]
pub struct SectionHeader {
    /// Index into the section name string table. Zero means no name.
    pub name: u32,

    /// Type of the section.
    pub stype: SectionType,

    /// Write, alloc, exec, compressed, etc.
    pub flags: u64,

    /// Virtual address of the section in the loaded image, or zero.
    pub addr: u64,

    /// Offset to the section's bytes within the file.
    pub offset: u64,

    /// Size of the section in the file (compressed size for compressed
    /// sections, zero for SHT_NOBITS).
    pub size: u64,

    /// Link to another section with related information, usually a string
    /// or symbol table.
    pub link: u32,

    /// Additional section info.
    pub info: u32,

    /// Section alignment.
    pub align: u64,

    /// Set if the section holds a table of fixed-size entries.
    pub entry_size: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SectionType {
    /// Not to be used. Section zero always has this type.
    Null,

    /// CPU instructions or constant data.
    ProgBits,

    /// Debugging symbols.
    SymbolTable,

    /// Strings for use by the linker and debugger.
    StringTable,

    /// Relocation entries with addends.
    RelocationsWith,

    /// SysV symbol hash table.
    SymbolHashTable,

    /// Dynamic linking information.
    Dynamic,

    /// Arbitrary metadata.
    Note,

    /// Uninitialized data: occupies no file bytes.
    NoBits,

    /// Relocation entries without addends.
    RelocationsWithout,

    /// Dynamic linker symbol table.
    DynamicSymbolTable,

    /// Array of pointers to initialization functions.
    InitArray,

    /// Array of pointers to termination functions.
    FiniArray,

    /// Array of pointers to functions called before the regular
    /// initialization functions.
    PreinitArray,

    /// GNU style hash table with a Bloom prefilter.
    GnuHash,

    /// GNU symbol versions that are provided.
    VerDef,

    /// GNU symbol versions that are required.
    VerNeed,

    /// GNU symbol version table.
    VerSym,

    /// OS- and processor-specific types, preserved as-is.
    Unknown(u32),
}

impl SectionType {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0x0 => SectionType::Null, // see https://android.googlesource.com/platform/art/+/e34fa1d/runtime/elf.h
            0x1 => SectionType::ProgBits,
            0x2 => SectionType::SymbolTable,
            0x3 => SectionType::StringTable,
            0x4 => SectionType::RelocationsWith,
            0x5 => SectionType::SymbolHashTable,
            0x6 => SectionType::Dynamic,
            0x7 => SectionType::Note,
            0x8 => SectionType::NoBits,
            0x9 => SectionType::RelocationsWithout,
            0xb => SectionType::DynamicSymbolTable,
            0xe => SectionType::InitArray,
            0xf => SectionType::FiniArray,
            0x10 => SectionType::PreinitArray,
            0x6ffffff6 => SectionType::GnuHash,
            0x6ffffffd => SectionType::VerDef,
            0x6ffffffe => SectionType::VerNeed,
            0x6fffffff => SectionType::VerSym,
            _ => SectionType::Unknown(value),
        }
    }
}

impl SectionHeader {
    pub fn new(reader: &Reader, offset: u64) -> Result<Self> {
        let mut s = Stream::new(reader, offset);
        if reader.sixty_four_bit {
            let name = s.read_word()?;
            let stype = SectionType::from_u32(s.read_word()?);
            let flags = s.read_xword()?;
            let addr = s.read_addr()?;
            let offset = s.read_offset()?;
            let size = s.read_xword()?;
            let link = s.read_word()?;
            let info = s.read_word()?;
            let align = s.read_xword()?;
            let entry_size = s.read_xword()?;
            Ok(SectionHeader {
                name,
                stype,
                flags,
                addr,
                offset,
                size,
                link,
                info,
                align,
                entry_size,
            })
        } else {
            let name = s.read_word()?;
            let stype = SectionType::from_u32(s.read_word()?);
            let flags = s.read_word()? as u64;
            let addr = s.read_addr()?;
            let offset = s.read_offset()?;
            let size = s.read_word()? as u64;
            let link = s.read_word()?;
            let info = s.read_word()?;
            let align = s.read_word()? as u64;
            let entry_size = s.read_word()? as u64;
            Ok(SectionHeader {
                name,
                stype,
                flags,
                addr,
                offset,
                size,
                link,
                info,
                align,
                entry_size,
            })
        }
    }

    fn null() -> Self {
        SectionHeader {
            name: 0,
            stype: SectionType::Null,
            flags: 0,
            addr: 0,
            offset: 0,
            size: 0,
            link: 0,
            info: 0,
            align: 0,
            entry_size: 0,
        }
    }
}

/// A section header plus its lazily-built byte view. The view is created on
/// first access and stable for the life of the object.
pub struct Section {
    pub hdr: SectionHeader,

    /// Resolved from the section name string table; empty when the image has
    /// no string table.
    pub name: String,

    file_io: Reader,
    io: OnceCell<Reader>,
}

impl Section {
    pub(crate) fn new(file_io: &Reader, offset: u64) -> Result<Self> {
        Ok(Section {
            hdr: SectionHeader::new(file_io, offset)?,
            name: String::new(),
            file_io: file_io.clone(),
            io: OnceCell::new(),
        })
    }

    /// The always-present section at index zero.
    pub(crate) fn null() -> Self {
        Section {
            hdr: SectionHeader::null(),
            name: String::new(),
            file_io: Reader::empty(),
            io: OnceCell::new(),
        }
    }

    /// True when this section came from the image `io` reads.
    pub(crate) fn is_from(&self, io: &Reader) -> bool {
        self.file_io.same_source(io)
    }

    /// A reader over the section's logical bytes: decompressed if the section
    /// is compressed, empty for SHT_NULL. Idempotent; the first call does the
    /// work.
    pub fn io(&self) -> &Reader {
        self.io.get_or_init(|| {
            if self.hdr.stype == SectionType::Null {
                return Reader::empty();
            }
            let raw = self
                .file_io
                .view(&self.name, self.hdr.offset, self.hdr.size);
            if self.hdr.flags & COMPRESSED_FLAG != 0 {
                self.inflate_chdr(&raw)
            } else if self.name.starts_with(".zdebug_")
                && raw.slice(0, 4).map(|sig| sig == b"ZLIB").unwrap_or(false)
            {
                self.inflate_zdebug(&raw)
            } else {
                raw
            }
        })
    }

    /// The sane compression scheme: a Chdr with type and decompressed size,
    /// then zlib-deflated bytes.
    #[cfg(feature = "zlib")]
    fn inflate_chdr(&self, raw: &Reader) -> Reader {
        let parsed = (|| -> Result<(u32, u64, u64)> {
            let mut s = Stream::new(raw, 0);
            let ch_type = s.read_word()?;
            if raw.sixty_four_bit {
                let _reserved = s.read_word()?;
                let ch_size = s.read_xword()?;
                let _align = s.read_xword()?;
                Ok((ch_type, ch_size, s.offset))
            } else {
                let ch_size = s.read_word()? as u64;
                let _align = s.read_word()?;
                Ok((ch_type, ch_size, s.offset))
            }
        })();
        match parsed {
            Ok((ELFCOMPRESS_ZLIB, ch_size, body)) => {
                self.inflate(raw, body, ch_size, "ZLIB compressed content after chdr")
            }
            Ok((ch_type, ..)) => {
                warn!("unsupported compression type {ch_type} in section {}", self.name);
                Reader::empty()
            }
            Err(err) => {
                warn!("bad compression header in section {}: {err}", self.name);
                Reader::empty()
            }
        }
    }

    /// The hacky legacy scheme: a 12-byte header of "ZLIB" plus the
    /// decompressed size as 8 big-endian bytes.
    #[cfg(feature = "zlib")]
    fn inflate_zdebug(&self, raw: &Reader) -> Reader {
        let mut size = 0u64;
        for i in 4..12 {
            match raw.read_byte(i) {
                Ok(b) => size = size << 8 | b as u64,
                Err(err) => {
                    warn!("bad ZLIB signature in section {}: {err}", self.name);
                    return Reader::empty();
                }
            }
        }
        self.inflate(raw, 12, size, "ZLIB compressed content after magic signature")
    }

    #[cfg(feature = "zlib")]
    fn inflate(&self, raw: &Reader, body: u64, declared: u64, tag: &str) -> Reader {
        use std::io::Read;

        let compressed = match raw.slice(body, (raw.size() - body) as usize) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("can't read compressed section {}: {err}", self.name);
                return Reader::empty();
            }
        };
        let mut inflated = Vec::with_capacity(declared as usize);
        match flate2::read::ZlibDecoder::new(compressed).read_to_end(&mut inflated) {
            Ok(_) => Reader::owned(inflated, tag, raw),
            Err(err) => {
                warn!("can't decompress section {}: {err}", self.name);
                Reader::empty()
            }
        }
    }

    #[cfg(not(feature = "zlib"))]
    fn inflate_chdr(&self, _raw: &Reader) -> Reader {
        self.warn_no_zlib()
    }

    #[cfg(not(feature = "zlib"))]
    fn inflate_zdebug(&self, _raw: &Reader) -> Reader {
        self.warn_no_zlib()
    }

    #[cfg(not(feature = "zlib"))]
    fn warn_no_zlib(&self) -> Reader {
        warn!(
            "no support configured for compressed debug info in section {}",
            self.name
        );
        Reader::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::testdata::{zlib_compress, ImageBuilder, SectionSpec};

    const SHT_PROGBITS: u32 = 1;

    fn image_with(section: SectionSpec) -> crate::elf::ElfFile {
        ImageBuilder::new().section(section).build_file()
    }

    #[test]
    fn raw_sections_read_through() {
        let file = image_with(SectionSpec::new(".rodata", SHT_PROGBITS).data(b"hello".to_vec()));
        let sec = file.find_section(".rodata", SectionType::ProgBits).unwrap();
        assert_eq!(sec.io().slice(0, 5).unwrap(), b"hello");
        // the view is built once and reused
        assert!(std::ptr::eq(sec.io(), sec.io()));
    }

    #[test]
    fn null_section_yields_an_empty_reader() {
        let sec = Section::null();
        assert!(sec.io().is_empty());
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn chdr_compressed_sections_inflate() {
        let body = b"the quick brown fox jumps over the lazy dog".to_vec();
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_le_bytes()); // ELFCOMPRESS_ZLIB
        data.extend_from_slice(&0u32.to_le_bytes()); // reserved
        data.extend_from_slice(&(body.len() as u64).to_le_bytes());
        data.extend_from_slice(&8u64.to_le_bytes()); // alignment
        data.extend_from_slice(&zlib_compress(&body));

        let file = image_with(
            SectionSpec::new(".debug_info", SHT_PROGBITS)
                .flags(COMPRESSED_FLAG)
                .data(data),
        );
        let sec = file.find_section(".debug_info", SectionType::ProgBits).unwrap();
        assert_eq!(sec.io().slice(0, body.len()).unwrap(), &body[..]);
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn zdebug_sections_inflate() {
        let body = b"legacy compressed debug bytes".to_vec();
        let mut data = Vec::new();
        data.extend_from_slice(b"ZLIB");
        data.extend_from_slice(&(body.len() as u64).to_be_bytes());
        data.extend_from_slice(&zlib_compress(&body));

        let file = image_with(SectionSpec::new(".zdebug_line", SHT_PROGBITS).data(data));
        // looking up the uncompressed name finds the .z variant
        let sec = file.find_section(".debug_line", SectionType::ProgBits).unwrap();
        assert_eq!(sec.name, ".zdebug_line");
        assert_eq!(sec.io().size(), body.len() as u64);
        assert_eq!(sec.io().slice(0, body.len()).unwrap(), &body[..]);
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn corrupt_compressed_sections_read_as_empty() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&64u64.to_le_bytes());
        data.extend_from_slice(&8u64.to_le_bytes());
        data.extend_from_slice(b"this is not deflate data");

        let file = image_with(
            SectionSpec::new(".debug_str", SHT_PROGBITS)
                .flags(COMPRESSED_FLAG)
                .data(data),
        );
        let sec = file.find_section(".debug_str", SectionType::ProgBits).unwrap();
        assert!(sec.io().is_empty());
    }
}
