//! Byte-level access to ELF images. A `Reader` is a cheap-to-clone window over
//! a shared byte source (a memory-mapped file, or an owned buffer holding
//! decompressed or nested image bytes) that knows the image's endianness and
//! word size. `Stream` layers a cursor on top for record parsing.
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ElfError {
    /// Bad magic or `EI_VERSION`. Fatal for the image it was raised on.
    #[error("{0}: content is not an ELF image")]
    NotElf(String),

    /// A read fell outside the window it was issued against.
    #[error("read of {size} bytes at offset {offset:#x} is outside {tag} ({len} bytes)")]
    Bounds {
        tag: String,
        offset: u64,
        size: usize,
        len: u64,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ElfError>;

/// Something that owns a contiguous run of image bytes.
pub trait ByteSource {
    fn bytes(&self) -> &[u8];

    /// The file backing the bytes, when there is one.
    fn path(&self) -> Option<&Path> {
        None
    }
}

struct MappedFile {
    // Undefined behavior if the underlying file is modified while the map is
    // in use; the mapping is created in Reader::open with that caveat.
    map: Mmap,
    path: PathBuf,
}

impl ByteSource for MappedFile {
    fn bytes(&self) -> &[u8] {
        &self.map
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

struct OwnedBytes {
    bytes: Vec<u8>,
}

impl ByteSource for OwnedBytes {
    fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A bounds-checked window over an image. Cloning shares the underlying
/// source, so sub-views are cheap enough to hand out per section.
#[derive(Clone)]
pub struct Reader {
    source: Arc<dyn ByteSource>,
    tag: Arc<str>,
    start: u64,
    size: u64,
    pub little_endian: bool,
    pub sixty_four_bit: bool,
}

impl Reader {
    /// Memory-map an ELF image and validate its identification bytes.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let map = unsafe { Mmap::map(&file) }?;
        let tag = path.display().to_string();
        Reader::for_image(
            Arc::new(MappedFile {
                map,
                path: path.to_path_buf(),
            }),
            tag,
        )
    }

    /// Treat an owned buffer (e.g. a decompressed `.gnu_debugdata`) as a
    /// complete ELF image.
    pub fn for_image_bytes(bytes: Vec<u8>, tag: &str) -> Result<Self> {
        Reader::for_image(Arc::new(OwnedBytes { bytes }), tag.to_string())
    }

    fn for_image(source: Arc<dyn ByteSource>, tag: String) -> Result<Self> {
        // see https://en.wikipedia.org/wiki/Executable_and_Linkable_Format
        let ident = source.bytes();
        if ident.len() < 16 || ident[0..4] != [0x7f, 0x45, 0x4c, 0x46] {
            return Err(ElfError::NotElf(tag));
        }
        let ei_class = ident[4];
        let ei_data = ident[5];
        let ei_version = ident[6];
        if ei_version != 1 || !(1..=2).contains(&ei_class) || !(1..=2).contains(&ei_data) {
            return Err(ElfError::NotElf(tag));
        }
        let size = source.bytes().len() as u64;
        Ok(Reader {
            source,
            tag: tag.into(),
            start: 0,
            size,
            sixty_four_bit: ei_class == 2,
            little_endian: ei_data == 1,
        })
    }

    /// A window over bytes that are not themselves an image (a decompressed
    /// section body). Endianness and word size carry over from `like`.
    pub fn owned(bytes: Vec<u8>, tag: &str, like: &Reader) -> Self {
        let size = bytes.len() as u64;
        Reader {
            source: Arc::new(OwnedBytes { bytes }),
            tag: tag.into(),
            start: 0,
            size,
            little_endian: like.little_endian,
            sixty_four_bit: like.sixty_four_bit,
        }
    }

    /// The zero-length reader handed out for null and unreadable sections.
    pub fn empty() -> Self {
        Reader {
            source: Arc::new(OwnedBytes { bytes: Vec::new() }),
            tag: "empty".into(),
            start: 0,
            size: 0,
            little_endian: true,
            sixty_four_bit: true,
        }
    }

    /// A sub-range of this reader. Out-of-range requests are clamped rather
    /// than failed so a truncated image degrades to short reads.
    pub fn view(&self, tag: &str, offset: u64, size: u64) -> Reader {
        let offset = offset.min(self.size);
        let size = size.min(self.size - offset);
        Reader {
            source: Arc::clone(&self.source),
            tag: tag.into(),
            start: self.start + offset,
            size,
            little_endian: self.little_endian,
            sixty_four_bit: self.sixty_four_bit,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The file this window ultimately reads from, if it is file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.source.path()
    }

    /// True if both readers window the same underlying bytes. Used to tell
    /// which image a borrowed section came from.
    pub fn same_source(&self, other: &Reader) -> bool {
        Arc::ptr_eq(&self.source, &other.source)
    }

    pub fn slice(&self, offset: u64, size: usize) -> Result<&[u8]> {
        match offset.checked_add(size as u64) {
            Some(end) if end <= self.size => {
                let at = (self.start + offset) as usize;
                Ok(&self.source.bytes()[at..at + size])
            }
            _ => Err(ElfError::Bounds {
                tag: self.tag.to_string(),
                offset,
                size,
                len: self.size,
            }),
        }
    }

    pub fn read_byte(&self, offset: u64) -> Result<u8> {
        Ok(self.slice(offset, 1)?[0])
    }

    pub fn read_half(&self, offset: u64) -> Result<u16> {
        let s = self.slice(offset, 2)?.try_into().unwrap();
        if self.little_endian {
            Ok(u16::from_le_bytes(s))
        } else {
            Ok(u16::from_be_bytes(s))
        }
    }

    pub fn read_word(&self, offset: u64) -> Result<u32> {
        let s = self.slice(offset, 4)?.try_into().unwrap();
        if self.little_endian {
            Ok(u32::from_le_bytes(s))
        } else {
            Ok(u32::from_be_bytes(s))
        }
    }

    pub fn read_xword(&self, offset: u64) -> Result<u64> {
        let s = self.slice(offset, 8)?.try_into().unwrap();
        if self.little_endian {
            Ok(u64::from_le_bytes(s))
        } else {
            Ok(u64::from_be_bytes(s))
        }
    }

    /// Read a u32 or u64 address depending on the image's word size. For
    /// sanity the result is always 64 bits.
    pub fn read_addr(&self, offset: u64) -> Result<u64> {
        if self.sixty_four_bit {
            self.read_xword(offset)
        } else {
            Ok(self.read_word(offset)? as u64)
        }
    }

    pub fn read_offset(&self, offset: u64) -> Result<u64> {
        self.read_addr(offset)
    }

    /// Read a null-terminated string. A string cut short by the end of the
    /// window is returned as-is; ELF files don't describe string encodings,
    /// so non-UTF-8 bytes are replaced.
    pub fn read_string(&self, offset: u64) -> Result<String> {
        let mut bytes = Vec::new();
        let mut i = offset;
        while i < self.size {
            let b = self.read_byte(i)?;
            if b == 0 {
                break;
            }
            bytes.push(b);
            i += 1;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

pub struct Stream<'a> {
    pub reader: &'a Reader,
    pub offset: u64,
}

impl<'a> Stream<'a> {
    pub fn new(reader: &'a Reader, offset: u64) -> Self {
        Stream { reader, offset }
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        let byte = self.reader.read_byte(self.offset)?;
        self.offset += 1;
        Ok(byte)
    }

    pub fn read_half(&mut self) -> Result<u16> {
        let half = self.reader.read_half(self.offset)?;
        self.offset += 2;
        Ok(half)
    }

    pub fn read_word(&mut self) -> Result<u32> {
        let word = self.reader.read_word(self.offset)?;
        self.offset += 4;
        Ok(word)
    }

    pub fn read_xword(&mut self) -> Result<u64> {
        let xword = self.reader.read_xword(self.offset)?;
        self.offset += 8;
        Ok(xword)
    }

    pub fn read_addr(&mut self) -> Result<u64> {
        if self.reader.sixty_four_bit {
            self.read_xword()
        } else {
            Ok(self.read_word()? as u64)
        }
    }

    pub fn read_offset(&mut self) -> Result<u64> {
        self.read_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(bytes: &[u8]) -> Reader {
        Reader::owned(bytes.to_vec(), "test bytes", &Reader::empty())
    }

    #[test]
    fn typed_reads() {
        let r = reader(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(r.read_half(0).unwrap(), 0x0201);
        assert_eq!(r.read_word(0).unwrap(), 0x04030201);
        assert_eq!(r.read_xword(0).unwrap(), 0x0807060504030201);
        assert!(r.read_xword(4).is_err());
    }

    #[test]
    fn views_clamp_and_nest() {
        let r = reader(b"abcdefgh");
        let v = r.view("middle", 2, 4);
        assert_eq!(v.size(), 4);
        assert_eq!(v.slice(0, 4).unwrap(), b"cdef");
        let vv = v.view("nested", 2, 100);
        assert_eq!(vv.size(), 2);
        assert_eq!(vv.slice(0, 2).unwrap(), b"ef");
        assert!(v.same_source(&r));
    }

    #[test]
    fn strings_stop_at_nul_or_end() {
        let r = reader(b"main\0rest");
        assert_eq!(r.read_string(0).unwrap(), "main");
        assert_eq!(r.read_string(5).unwrap(), "rest");
        assert_eq!(r.read_string(100).unwrap(), "");
    }

    #[test]
    fn image_ident_is_validated() {
        assert!(matches!(
            Reader::for_image_bytes(b"not an elf image".to_vec(), "garbage"),
            Err(ElfError::NotElf(_))
        ));
        let mut image = vec![0x7f, b'E', b'L', b'F', 2, 1, 1, 0];
        image.resize(64, 0);
        let r = Reader::for_image_bytes(image, "minimal").unwrap();
        assert!(r.little_endian);
        assert!(r.sixty_four_bit);
    }
}
