//! Builders for the synthetic ELF images the tests run against: little
//! endian, 64-bit, with whatever sections and segments a test needs. Keeps
//! the tests hermetic instead of depending on binaries from the host.
use super::Reader;
use crate::context::Context;
use crate::elf::ElfFile;
use crate::elf::hash::gnu_hash;
use std::sync::Arc;

fn push16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn pad_to(out: &mut Vec<u8>, offset: u64) {
    assert!(out.len() as u64 <= offset);
    out.resize(offset as usize, 0);
}

/// A string table under construction; offset 0 is always the empty string.
pub struct StringTable {
    bytes: Vec<u8>,
}

impl StringTable {
    pub fn new() -> Self {
        StringTable { bytes: vec![0] }
    }

    pub fn add(&mut self, s: &str) -> u32 {
        let off = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        off
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// One 64-bit symbol table entry.
pub fn sym64(name: u32, info: u8, shndx: u16, value: u64, size: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    push32(&mut out, name);
    out.push(info);
    out.push(0); // st_other
    push16(&mut out, shndx);
    push64(&mut out, value);
    push64(&mut out, size);
    out
}

/// One 64-bit dynamic entry.
pub fn dyn64(tag: i64, val: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    push64(&mut out, tag as u64);
    push64(&mut out, val);
    out
}

/// One note record, with the 4-byte alignment padding the format requires.
pub fn note_bytes(name: &str, ntype: u32, desc: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    push32(&mut out, name.len() as u32 + 1);
    push32(&mut out, desc.len() as u32);
    push32(&mut out, ntype);
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out.extend_from_slice(desc);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out
}

/// A `.hash` section over a dynsym holding the given names at indices 1..=n.
/// One bucket, so every symbol hangs off a single chain.
pub fn build_sysv_hash(names: &[&str]) -> Vec<u8> {
    let n = names.len() as u32;
    let mut out = Vec::new();
    push32(&mut out, 1); // nbucket
    push32(&mut out, n + 1); // nchain
    push32(&mut out, if n == 0 { 0 } else { 1 }); // bucket 0
    for i in 0..=n {
        // chain: 1 -> 2 -> ... -> n -> STN_UNDEF
        push32(&mut out, if i != 0 && i < n { i + 1 } else { 0 });
    }
    out
}

/// A `.gnu.hash` section over a dynsym holding the given names at indices
/// `symoffset..`. One bucket and one bloom word.
pub fn build_gnu_hash(names: &[&str], symoffset: u32) -> Vec<u8> {
    let mut bloom: u64 = 0;
    for name in names {
        let h = gnu_hash(name);
        bloom |= 1u64 << (h % 64);
        bloom |= 1u64 << ((h >> 5) % 64);
    }
    let mut out = Vec::new();
    push32(&mut out, 1); // nbuckets
    push32(&mut out, symoffset);
    push32(&mut out, 1); // bloom_size
    push32(&mut out, 5); // bloom_shift
    push64(&mut out, bloom);
    push32(&mut out, if names.is_empty() { 0 } else { symoffset }); // bucket 0
    for (i, name) in names.iter().enumerate() {
        let h = gnu_hash(name);
        let last = i + 1 == names.len();
        push32(&mut out, if last { h | 1 } else { h & !1 });
    }
    out
}

pub fn zlib_compress(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

pub fn xz_compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    lzma_rs::xz_compress(&mut &data[..], &mut out).unwrap();
    out
}

pub struct SectionSpec {
    name: String,
    stype: u32,
    flags: u64,
    addr: u64,
    data: Vec<u8>,
    link: u32,
}

impl SectionSpec {
    pub fn new(name: &str, stype: u32) -> Self {
        SectionSpec {
            name: name.to_string(),
            stype,
            flags: 0,
            addr: 0,
            data: Vec::new(),
            link: 0,
        }
    }

    pub fn flags(mut self, flags: u64) -> Self {
        self.flags = flags;
        self
    }

    pub fn addr(mut self, addr: u64) -> Self {
        self.addr = addr;
        self
    }

    pub fn data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn link(mut self, link: u32) -> Self {
        self.link = link;
        self
    }
}

pub struct SegmentSpec {
    ptype: u32,
    vaddr: u64,
    flags: u32,
    mem_size: Option<u64>,
    data: Vec<u8>,
}

impl SegmentSpec {
    pub fn new(ptype: u32, vaddr: u64) -> Self {
        SegmentSpec {
            ptype,
            vaddr,
            flags: 0x4, // readable
            mem_size: None,
            data: Vec::new(),
        }
    }

    pub fn data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// p_memsz when it should exceed the file bytes (bss-style segments).
    pub fn mem(mut self, size: u64) -> Self {
        self.mem_size = Some(size);
        self
    }
}

/// Assembles a 64-bit little-endian image. A null section and a trailing
/// `.shstrtab` are added automatically; declared sections get indices
/// starting at 1, in declaration order.
pub struct ImageBuilder {
    sections: Vec<SectionSpec>,
    segments: Vec<SegmentSpec>,
    etype: u16,
    extended_shnum: bool,
    xindex_shstrndx: bool,
}

impl ImageBuilder {
    pub fn new() -> Self {
        ImageBuilder {
            sections: Vec::new(),
            segments: Vec::new(),
            etype: 2,
            extended_shnum: false,
            xindex_shstrndx: false,
        }
    }

    pub fn section(mut self, spec: SectionSpec) -> Self {
        self.sections.push(spec);
        self
    }

    pub fn segment(mut self, spec: SegmentSpec) -> Self {
        self.segments.push(spec);
        self
    }

    /// Write e_shnum as zero and put the real count in section zero's
    /// sh_size.
    pub fn extended_shnum(mut self) -> Self {
        self.extended_shnum = true;
        self
    }

    /// Write e_shstrndx as SHN_XINDEX and put the real index in section
    /// zero's sh_link.
    pub fn xindex_shstrndx(mut self) -> Self {
        self.xindex_shstrndx = true;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut shstr = StringTable::new();
        let name_offsets: Vec<u32> = self.sections.iter().map(|s| shstr.add(&s.name)).collect();
        let shstr_name = shstr.add(".shstrtab");
        let shstr_bytes = shstr.into_bytes();

        let shnum = self.sections.len() as u64 + 2; // null + declared + shstrtab
        let shstrndx = shnum - 1;
        let phnum = self.segments.len() as u64;

        let mut off = 64 + phnum * 56;
        let seg_offsets: Vec<u64> = self
            .segments
            .iter()
            .map(|seg| {
                off = (off + 3) & !3;
                let this = off;
                off += seg.data.len() as u64;
                this
            })
            .collect();
        let sec_offsets: Vec<u64> = self
            .sections
            .iter()
            .map(|sec| {
                off = (off + 7) & !7;
                let this = off;
                off += sec.data.len() as u64;
                this
            })
            .collect();
        off = (off + 7) & !7;
        let shstr_off = off;
        off += shstr_bytes.len() as u64;
        off = (off + 7) & !7;
        let shoff = off;

        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0u8; 8]);
        push16(&mut out, self.etype);
        push16(&mut out, 0x3e); // x86-64
        push32(&mut out, 1);
        push64(&mut out, 0); // entry
        push64(&mut out, 64); // phoff
        push64(&mut out, shoff);
        push32(&mut out, 0); // flags
        push16(&mut out, 64); // ehsize
        push16(&mut out, 56); // phentsize
        push16(&mut out, phnum as u16);
        push16(&mut out, 64); // shentsize
        push16(&mut out, if self.extended_shnum { 0 } else { shnum as u16 });
        push16(&mut out, if self.xindex_shstrndx { 0xffff } else { shstrndx as u16 });

        for (seg, &data_off) in self.segments.iter().zip(&seg_offsets) {
            push32(&mut out, seg.ptype);
            push32(&mut out, seg.flags);
            push64(&mut out, data_off);
            push64(&mut out, seg.vaddr);
            push64(&mut out, seg.vaddr); // paddr
            push64(&mut out, seg.data.len() as u64);
            push64(&mut out, seg.mem_size.unwrap_or(seg.data.len() as u64));
            push64(&mut out, 4); // align
        }

        for (seg, &data_off) in self.segments.iter().zip(&seg_offsets) {
            pad_to(&mut out, data_off);
            out.extend_from_slice(&seg.data);
        }
        for (sec, &data_off) in self.sections.iter().zip(&sec_offsets) {
            pad_to(&mut out, data_off);
            out.extend_from_slice(&sec.data);
        }
        pad_to(&mut out, shstr_off);
        out.extend_from_slice(&shstr_bytes);
        pad_to(&mut out, shoff);

        // the null section, which doubles as the overflow slot for the
        // extended count and string-table index
        push32(&mut out, 0);
        push32(&mut out, 0); // SHT_NULL
        push64(&mut out, 0);
        push64(&mut out, 0);
        push64(&mut out, 0);
        push64(&mut out, if self.extended_shnum { shnum } else { 0 });
        push32(&mut out, if self.xindex_shstrndx { shstrndx as u32 } else { 0 });
        push32(&mut out, 0);
        push64(&mut out, 0);
        push64(&mut out, 0);

        for ((sec, &name), &data_off) in self.sections.iter().zip(&name_offsets).zip(&sec_offsets) {
            push32(&mut out, name);
            push32(&mut out, sec.stype);
            push64(&mut out, sec.flags);
            push64(&mut out, sec.addr);
            push64(&mut out, data_off);
            push64(&mut out, sec.data.len() as u64);
            push32(&mut out, sec.link);
            push32(&mut out, 0); // info
            push64(&mut out, 1); // align
            push64(&mut out, 0); // entsize
        }

        push32(&mut out, shstr_name);
        push32(&mut out, 3); // SHT_STRTAB
        push64(&mut out, 0);
        push64(&mut out, 0);
        push64(&mut out, shstr_off);
        push64(&mut out, shstr_bytes.len() as u64);
        push32(&mut out, 0);
        push32(&mut out, 0);
        push64(&mut out, 1);
        push64(&mut out, 0);

        out
    }

    pub fn build_file(self) -> ElfFile {
        self.build_file_with(Arc::new(Context::default()))
    }

    pub fn build_file_with(self, ctx: Arc<Context>) -> ElfFile {
        let bytes = self.build();
        let reader = Reader::for_image_bytes(bytes, "test image").unwrap();
        ElfFile::new(ctx, reader, false).unwrap()
    }
}
