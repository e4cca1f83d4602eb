//! An opened ELF image and the queries an unwinder makes against it.
//!
//! Construction reads the ELF header, program headers, and section headers
//! (with names and the dynamic table). Everything else - symbol tables, hash
//! tables, decompressed section bodies, version tables, the separate debug
//! companion, the embedded `.gnu_debugdata` image - is built on first demand
//! and cached. An ElfFile is meant to have a single logical owner: the lazy
//! caches use cell types, so the compiler enforces that it is not shared
//! across threads.
use super::{
    ALLOC_FLAG, ElfHeader, GnuHash, NT_GNU_BUILD_ID, NotesIter, ProgramHeader, Reader, Result,
    SHN_UNDEF, SHN_XINDEX, Section, SectionType, SegmentType, Stream, Symbol, SymbolTable,
    SymbolType, SymbolVersioning, SysvHash, Verdaux, Verdef, Vernaux, Verneed, VersionIdx,
};
use crate::context::Context;
use std::cell::{Cell, OnceCell};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DT_NULL: i64 = 0;
pub const DT_VERDEFNUM: i64 = 0x6ffffffd;
pub const DT_VERNEEDNUM: i64 = 0x6fffffff;

/// One `.dynamic` entry. Tags we don't interpret are preserved as-is.
#[derive(Clone, Copy)]
pub struct Dyn {
    pub tag: i64,
    pub val: u64,
}

impl Dyn {
    pub fn new(reader: &Reader, offset: u64) -> Result<Self> {
        let mut s = Stream::new(reader, offset);
        if reader.sixty_four_bit {
            let tag = s.read_xword()? as i64;
            let val = s.read_xword()?;
            Ok(Dyn { tag, val })
        } else {
            let tag = s.read_word()? as i32 as i64;
            let val = s.read_word()? as u64;
            Ok(Dyn { tag, val })
        }
    }
}

pub struct ElfFile {
    ctx: Arc<Context>,
    pub io: Reader,
    pub header: ElfHeader,

    /// Program headers grouped by type; each group is sorted by p_vaddr so
    /// address lookups can binary search.
    program_headers: BTreeMap<SegmentType, Vec<ProgramHeader>>,

    /// Section zero is always present and is the null section.
    sections: Vec<Section>,
    section_names: HashMap<String, usize>,

    /// `.dynamic` entries grouped by tag.
    dynamic: HashMap<i64, Vec<Dyn>>,

    /// Index of `.gnu.version`, when the image has one.
    gnu_version: Option<usize>,

    /// Debug companions never go looking for their own companion.
    is_debug: bool,

    debug_symbols: OnceCell<SymbolTable>,
    dynamic_symbols: OnceCell<SymbolTable>,
    sysv_hash: OnceCell<Option<SysvHash>>,
    gnu_hash: OnceCell<Option<GnuHash>>,
    symbol_versions: OnceCell<SymbolVersioning>,
    symbol_index: OnceCell<HashMap<String, usize>>,
    debug_data: OnceCell<Option<Box<ElfFile>>>,
    debug_object: OnceCell<Option<Box<ElfFile>>>,
    last_load: Cell<Option<usize>>,
}

impl ElfFile {
    /// Memory-map an image from disk.
    pub fn open(ctx: Arc<Context>, path: &Path) -> Result<Self> {
        let reader = Reader::open(path)?;
        ElfFile::new(ctx, reader, false)
    }

    /// Parse an image from an already-validated reader. `is_debug` marks a
    /// separate debug-info companion and suppresses the recursive search for
    /// its own companion.
    pub fn new(ctx: Arc<Context>, io: Reader, is_debug: bool) -> Result<Self> {
        let header = ElfHeader::new(&io)?;

        let mut program_headers: BTreeMap<SegmentType, Vec<ProgramHeader>> = BTreeMap::new();
        let mut off = header.ph_offset;
        for _ in 0..header.num_ph_entries {
            let ph = ProgramHeader::new(&io, off)?;
            program_headers.entry(ph.stype).or_default().push(ph);
            off += header.ph_entry_size as u64;
        }
        for group in program_headers.values_mut() {
            group.sort_by_key(|ph| ph.vaddr);
        }

        let mut sections = Vec::new();
        let mut section_names = HashMap::new();
        let mut dynamic: HashMap<i64, Vec<Dyn>> = HashMap::new();
        let mut gnu_version = None;

        // Skip the section table entirely if it isn't present in the reader
        // (core files are usually truncated this way).
        if header.section_offset < io.size() {
            // If there are too many sections for the 16-bit count, the real
            // count is in section zero's sh_size.
            let mut count = if header.num_section_entries == 0 && header.section_entry_size != 0 {
                1
            } else {
                header.num_section_entries as usize
            };
            let mut off = header.section_offset;
            let mut i = 0;
            while i < count {
                let section = Section::new(&io, off)?;
                if i == 0 && header.num_section_entries == 0 {
                    count = section.hdr.size as usize;
                }
                sections.push(section);
                off += header.section_entry_size as u64;
                i += 1;
            }
            if sections.is_empty() {
                sections.push(Section::null());
            }

            if header.string_table_index != SHN_UNDEF {
                // e_shstrndx might be too small to hold the string section's
                // index, in which case it's in section zero's sh_link.
                let string_section = if header.string_table_index == SHN_XINDEX {
                    sections[0].hdr.link as usize
                } else {
                    header.string_table_index as usize
                };
                let names_io = match sections.get(string_section) {
                    Some(s) => s.io().clone(),
                    None => Reader::empty(),
                };
                for (i, section) in sections.iter_mut().enumerate() {
                    let name = names_io.read_string(section.hdr.name as u64).unwrap_or_default();
                    section_names.insert(name.clone(), i);
                    section.name = name;
                }

                if let Some(&i) = section_names.get(".dynamic")
                    && sections[i].hdr.stype == SectionType::Dynamic
                {
                    let dio = sections[i].io().clone();
                    let entry_size = if io.sixty_four_bit { 16 } else { 8 };
                    let mut doff = 0;
                    while doff + entry_size <= dio.size() {
                        let dyn_entry = Dyn::new(&dio, doff)?;
                        dynamic.entry(dyn_entry.tag).or_default().push(dyn_entry);
                        doff += entry_size;
                    }
                }

                gnu_version = section_names
                    .get(".gnu.version")
                    .copied()
                    .filter(|&i| sections[i].hdr.stype == SectionType::VerSym);
            }
        } else {
            // leave a null section no matter what
            sections.push(Section::null());
        }

        Ok(ElfFile {
            ctx,
            io,
            header,
            program_headers,
            sections,
            section_names,
            dynamic,
            gnu_version,
            is_debug,
            debug_symbols: OnceCell::new(),
            dynamic_symbols: OnceCell::new(),
            sysv_hash: OnceCell::new(),
            gnu_hash: OnceCell::new(),
            symbol_versions: OnceCell::new(),
            symbol_index: OnceCell::new(),
            debug_data: OnceCell::new(),
            debug_object: OnceCell::new(),
            last_load: Cell::new(None),
        })
    }

    /// The program headers of one segment type, sorted by virtual address.
    pub fn segments(&self, stype: SegmentType) -> &[ProgramHeader] {
        self.program_headers.get(&stype).map_or(&[], |v| v.as_slice())
    }

    pub fn all_segments(&self) -> &BTreeMap<SegmentType, Vec<ProgramHeader>> {
        &self.program_headers
    }

    /// One past the highest virtual address any load segment covers.
    pub fn end_va(&self) -> u64 {
        self.segments(SegmentType::Load)
            .last()
            .map_or(0, |ph| ph.vaddr.saturating_add(ph.mem_size))
    }

    /// The load segment covering a virtual address. Unwinding asks this for
    /// every frame, usually with the same answer, so the last hit is cached.
    pub fn find_load_segment(&self, addr: u64) -> Option<&ProgramHeader> {
        let loads = self.segments(SegmentType::Load);
        if let Some(i) = self.last_load.get()
            && let Some(ph) = loads.get(i)
            && ph.contains(addr)
        {
            return Some(ph);
        }
        let pos = loads.partition_point(|ph| ph.vaddr.saturating_add(ph.mem_size) <= addr);
        if pos < loads.len() && loads[pos].vaddr <= addr {
            self.last_load.set(Some(pos));
            return Some(&loads[pos]);
        }
        None
    }

    /// The PT_INTERP string, e.g. /lib64/ld-linux-x86-64.so.2.
    pub fn interpreter(&self) -> Option<String> {
        let seg = self.segments(SegmentType::Interpreter).first()?;
        self.io.read_string(seg.offset).ok()
    }

    /// Iterate the notes of every PT_NOTE segment.
    pub fn notes(&self) -> NotesIter<'_> {
        NotesIter::new(self.segments(SegmentType::Note), &self.io)
    }

    /// Look up a section by name, requiring the given type (SectionType::Null
    /// acts as a wildcard). Sections stripped to `.zdebug_*` or split out to
    /// `.dwo` are found under their original names.
    pub fn find_section(&self, name: &str, stype: SectionType) -> Option<&Section> {
        if let Some(&i) = self.section_names.get(name) {
            let section = &self.sections[i];
            if section.hdr.stype == stype || stype == SectionType::Null {
                return Some(section);
            }
        }
        if let Some(rest) = name.strip_prefix(".debug_") {
            // Section::io does the decompression for these.
            if let Some(compressed) = self.find_section(&format!(".zdebug_{rest}"), stype) {
                return Some(compressed);
            }
        }
        if !name.ends_with(".dwo") {
            return self.find_section(&format!("{name}.dwo"), stype);
        }
        None
    }

    /// A section by index. The null section reads as absent.
    pub fn section_at(&self, idx: usize) -> Option<&Section> {
        let section = self.sections.get(idx)?;
        if section.hdr.stype != SectionType::Null {
            Some(section)
        } else {
            None
        }
    }

    /// Like find_section, but falls back to the separate debug companion when
    /// the section is missing here or was stripped to SHT_NOBITS.
    pub fn find_debug_section(&self, name: &str, stype: SectionType) -> Option<&Section> {
        if let Some(local) = self.find_section(name, stype)
            && local.hdr.stype != SectionType::NoBits
        {
            return Some(local);
        }
        self.debug_file()?.find_section(name, stype)
    }

    /// The section a section's sh_link refers to, in whichever image the
    /// section came from.
    pub fn find_linked_section(&self, from: &Section) -> Option<&Section> {
        if from.is_from(&self.io) {
            return self.sections.get(from.hdr.link as usize);
        }
        self.debug_file()?.find_linked_section(from)
    }

    /// The `.symtab` symbols, from this image or its debug companion.
    pub fn debug_symbols(&self) -> &SymbolTable {
        self.debug_symbols
            .get_or_init(|| self.load_symtab(".symtab", SectionType::SymbolTable))
    }

    /// The `.dynsym` symbols, from this image or its debug companion.
    pub fn dynamic_symbols(&self) -> &SymbolTable {
        self.dynamic_symbols
            .get_or_init(|| self.load_symtab(".dynsym", SectionType::DynamicSymbolTable))
    }

    fn load_symtab(&self, name: &str, stype: SectionType) -> SymbolTable {
        match self.find_debug_section(name, stype) {
            Some(section) => {
                let strings = match self.find_linked_section(section) {
                    Some(s) => s.io().clone(),
                    None => Reader::empty(),
                };
                SymbolTable::new(section.io().clone(), strings)
            }
            None => SymbolTable::missing(),
        }
    }

    fn sysv_hash(&self) -> Option<&SysvHash> {
        self.sysv_hash
            .get_or_init(|| {
                let section = self.find_section(".hash", SectionType::SymbolHashTable)?;
                let syms = self.find_section(".dynsym", SectionType::DynamicSymbolTable)?;
                let strings = self.find_linked_section(syms)?;
                SysvHash::new(section.io(), syms.io().clone(), strings.io().clone()).ok()
            })
            .as_ref()
    }

    fn gnu_hash(&self) -> Option<&GnuHash> {
        self.gnu_hash
            .get_or_init(|| {
                let section = self.find_section(".gnu.hash", SectionType::GnuHash)?;
                let syms = self.find_section(".dynsym", SectionType::DynamicSymbolTable)?;
                let strings = self.find_linked_section(syms)?;
                GnuHash::new(section.io(), syms.io().clone(), strings.io().clone()).ok()
            })
            .as_ref()
    }

    /// Locate a named symbol via the dynamic hash tables. The GNU table wins
    /// when both exist.
    pub fn find_dynamic_symbol(&self, name: &str) -> Option<(Symbol, usize)> {
        let hit = if let Some(gnu) = self.gnu_hash() {
            gnu.find(name)
        } else if let Some(sysv) = self.sysv_hash() {
            sysv.find(name)
        } else {
            None
        };
        let (idx, sym) = hit?;
        if idx == 0 {
            return None;
        }
        Some((sym, idx as usize))
    }

    /// Locate a named symbol in `.symtab`, which has no hash acceleration.
    /// The whole table is indexed by name on the first call.
    pub fn find_debug_symbol(&self, name: &str) -> Option<(Symbol, usize)> {
        let syms = self.debug_symbols();
        let cache = self.symbol_index.get_or_init(|| {
            let mut by_name = HashMap::new();
            for (i, sym) in syms.iter().enumerate() {
                by_name.insert(syms.name(&sym), i);
            }
            by_name
        });
        let &i = cache.get(name)?;
        Some((syms.get(i)?, i))
    }

    /// Find the symbol covering an address, preferring `.symtab` over
    /// `.dynsym` and a sized covering symbol over a zero-size exact match.
    /// `stype` filters by symbol type; SymbolType::None accepts any. Falls
    /// back to the embedded `.gnu_debugdata` image when the real tables have
    /// no answer.
    pub fn find_symbol_by_address(&self, addr: u64, stype: SymbolType) -> Option<(Symbol, String)> {
        let mut zero_size_match: Option<(Symbol, String)> = None;

        for table in [self.debug_symbols(), self.dynamic_symbols()] {
            for candidate in table.iter() {
                if candidate.shndx as usize >= self.sections.len() {
                    continue;
                }
                if stype != SymbolType::None && candidate.stype() != stype {
                    continue;
                }
                if candidate.value > addr {
                    continue;
                }
                if candidate.value.saturating_add(candidate.size) <= addr {
                    if candidate.size == 0 && candidate.value == addr {
                        let name = table.name(&candidate);
                        zero_size_match = Some((candidate, name));
                    }
                    continue;
                }
                let section = &self.sections[candidate.shndx as usize];
                if section.hdr.flags & ALLOC_FLAG == 0 {
                    continue;
                }
                let name = table.name(&candidate);
                return Some((candidate, name));
            }
        }

        if let Some(mini) = self.debug_data()
            && let Some(hit) = mini.find_symbol_by_address(addr, stype)
        {
            return Some(hit);
        }

        zero_size_match
    }

    /// The `.gnu_debugdata` section is a separate LZMA-compressed ELF image
    /// with just a symbol table. Loaded once; a failed load stays failed.
    fn debug_data(&self) -> Option<&ElfFile> {
        self.debug_data
            .get_or_init(|| self.load_debug_data().map(Box::new))
            .as_deref()
    }

    #[cfg(feature = "lzma")]
    fn load_debug_data(&self) -> Option<ElfFile> {
        let section = self.find_section(".gnu_debugdata", SectionType::ProgBits)?;
        let io = section.io();
        let mut compressed = io.slice(0, io.size() as usize).ok()?;
        let mut inflated = Vec::new();
        if let Err(err) = lzma_rs::xz_decompress(&mut compressed, &mut inflated) {
            warn!("can't decompress .gnu_debugdata in {}: {err:?}", self.io.tag());
            return None;
        }
        let tag = format!("{} .gnu_debugdata", self.io.tag());
        let reader = match Reader::for_image_bytes(inflated, &tag) {
            Ok(reader) => reader,
            Err(err) => {
                warn!("bad .gnu_debugdata in {}: {err}", self.io.tag());
                return None;
            }
        };
        match ElfFile::new(Arc::clone(&self.ctx), reader, true) {
            Ok(file) => Some(file),
            Err(err) => {
                warn!("bad .gnu_debugdata in {}: {err}", self.io.tag());
                None
            }
        }
    }

    #[cfg(not(feature = "lzma"))]
    fn load_debug_data(&self) -> Option<ElfFile> {
        if self.find_section(".gnu_debugdata", SectionType::ProgBits).is_some() {
            warn!(
                "no compiled support for LZMA - can't decode debug data in {}",
                self.io.tag()
            );
        }
        None
    }

    /// The version-table index `.gnu.version` assigns to dynamic symbol `idx`.
    pub fn version_idx_for_symbol(&self, idx: usize) -> Option<VersionIdx> {
        let section = &self.sections[self.gnu_version?];
        section.io().read_half(idx as u64 * 2).ok().map(VersionIdx)
    }

    /// The version name behind an index. Indices 0 and 1 are the reserved
    /// "local" and "global" and have none.
    pub fn symbol_version(&self, idx: VersionIdx) -> Option<&str> {
        let i = idx.index();
        if i >= 2 {
            self.symbol_versions().versions.get(&i).map(String::as_str)
        } else {
            None
        }
    }

    /// Everything `.gnu.version_r` and `.gnu.version_d` define, built once.
    pub fn symbol_versions(&self) -> &SymbolVersioning {
        self.symbol_versions.get_or_init(|| self.load_symbol_versions())
    }

    fn dynamic_entry(&self, tag: i64) -> Option<u64> {
        self.dynamic.get(&tag).and_then(|v| v.first()).map(|d| d.val)
    }

    fn load_symbol_versions(&self) -> SymbolVersioning {
        let mut rv = SymbolVersioning::default();

        if let Some(section) = self.find_section(".gnu.version_r", SectionType::VerNeed)
            && let Some(strings) = self.find_linked_section(section)
        {
            let io = section.io();
            let strings = strings.io();
            let mut off = 0;
            for _ in 0..self.dynamic_entry(DT_VERNEEDNUM).unwrap_or(0) {
                let Ok(verneed) = Verneed::new(io, off) else { break };
                let mut aux_off = off + verneed.aux as u64;
                let filename = strings.read_string(verneed.file as u64).unwrap_or_default();
                let provided = rv.files.entry(filename).or_default();
                for _ in 0..verneed.cnt {
                    let Ok(aux) = Vernaux::new(io, aux_off) else { break };
                    let name = strings.read_string(aux.name as u64).unwrap_or_default();
                    rv.versions.insert(aux.other, name);
                    provided.push(aux.other);
                    if aux.next == 0 {
                        break;
                    }
                    aux_off += aux.next as u64;
                }
                if verneed.next == 0 {
                    break;
                }
                off += verneed.next as u64;
            }
        }

        if let Some(section) = self.find_section(".gnu.version_d", SectionType::VerDef)
            && let Some(strings) = self.find_linked_section(section)
        {
            let io = section.io();
            let strings = strings.io();
            let mut off = 0;
            for _ in 0..self.dynamic_entry(DT_VERDEFNUM).unwrap_or(0) {
                let Ok(verdef) = Verdef::new(io, off) else { break };
                // If there are multiple verdaux entries, the first is the
                // version and the second is the predecessor.
                let mut aux_off = off + verdef.aux as u64;
                if verdef.cnt >= 1
                    && let Ok(aux) = Verdaux::new(io, aux_off)
                {
                    let name = strings.read_string(aux.name as u64).unwrap_or_default();
                    rv.versions.insert(verdef.ndx, name);
                    aux_off += aux.next as u64;
                    if verdef.cnt >= 2
                        && let Ok(aux) = Verdaux::new(io, aux_off)
                    {
                        let name = strings.read_string(aux.name as u64).unwrap_or_default();
                        rv.predecessors.insert(verdef.ndx, name);
                    }
                }
                if verdef.next == 0 {
                    break;
                }
                off += verdef.next as u64;
            }
        }

        rv
    }

    /// The separate debug-info companion for this image, if one can be found.
    /// Only one attempt is ever made; a failed search stays failed so the
    /// unwinder doesn't repeat it per frame.
    pub fn debug_file(&self) -> Option<&ElfFile> {
        self.debug_object
            .get_or_init(|| {
                if self.is_debug || self.ctx.options.no_ext_debug {
                    return None;
                }
                self.locate_debug().map(Box::new)
            })
            .as_deref()
    }

    fn try_load_debug(&self, path: &Path) -> Option<ElfFile> {
        let reader = match Reader::open(path) {
            Ok(reader) => reader,
            Err(err) => {
                if self.ctx.verbose > 0 {
                    debug!("failed to read debug file {}: {err}", path.display());
                }
                return None;
            }
        };
        match ElfFile::new(Arc::clone(&self.ctx), reader, true) {
            Ok(file) => {
                debug!("loaded debug file {}", path.display());
                Some(file)
            }
            Err(err) => {
                if self.ctx.verbose > 0 {
                    debug!("failed to load debug file {}: {err}", path.display());
                }
                None
            }
        }
    }

    fn locate_debug(&self) -> Option<ElfFile> {
        let exec_path = self.io.path().map(Path::to_path_buf);

        // First chance: "<basename>.debug" directly in a debug directory.
        // This needs no build id or debug link to work.
        let mut found = None;
        if let Some(name) = exec_path.as_deref().and_then(Path::file_name) {
            let candidate_name = format!("{}.debug", name.to_string_lossy());
            for dir in self.ctx.debug_directories() {
                if !dir.is_dir() {
                    if self.ctx.verbose > 0 {
                        debug!("debug directory not accessible: {}", dir.display());
                    }
                    continue;
                }
                let candidate = dir.join(&candidate_name);
                if self.ctx.verbose > 0 {
                    debug!("checking for debug file: {}", candidate.display());
                }
                if candidate.is_file()
                    && let Some(file) = self.try_load_debug(&candidate)
                {
                    found = Some(file);
                    break;
                }
            }
        }

        // Use the build id to find debug data.
        let mut build_id = Vec::new();
        if found.is_none() {
            for note in self.notes() {
                if note.name == "GNU" && note.ntype == NT_GNU_BUILD_ID {
                    build_id = note.bytes();
                    if build_id.is_empty() {
                        continue;
                    }
                    let mut rel = format!(".build-id/{:02x}/", build_id[0]);
                    for byte in &build_id[1..] {
                        rel.push_str(&format!("{byte:02x}"));
                    }
                    rel.push_str(".debug");
                    found = self.ctx.debug_image(Path::new(&rel));
                    break;
                }
            }
        }

        // If that doesn't work, maybe the gnu_debuglink is valid?
        if found.is_none()
            && let Some(section) = self.find_section(".gnu_debuglink", SectionType::ProgBits)
            && let Ok(link) = section.io().read_string(0)
            && !link.is_empty()
        {
            for dir in self.ctx.debug_directories() {
                let path = dir.join(&link);
                if self.ctx.verbose > 0 {
                    debug!("checking debug file at: {}", path.display());
                }
                if path.is_file()
                    && let Some(file) = self.try_load_debug(&path)
                {
                    found = Some(file);
                    break;
                }
            }
            // then next to the image itself
            if found.is_none()
                && let Some(dir) = exec_path.as_deref().and_then(Path::parent)
            {
                let path = dir.join(&link);
                if path.is_file() {
                    found = self.try_load_debug(&path);
                }
            }
        }

        if found.is_none()
            && !build_id.is_empty()
            && let Some(client) = &self.ctx.debuginfod
        {
            match client.find_debuginfo(&build_id) {
                Some(path) => found = self.try_load_debug(&path),
                None => {
                    if self.ctx.verbose > 0 {
                        debug!("failed to fetch debuginfo with debuginfod");
                    }
                }
            }
        }

        let Some(mut debug_obj) = found else {
            if self.ctx.verbose > 1 {
                debug!("no debug object for {}", self.io.tag());
            }
            return None;
        };

        // If the .dynamic sections landed at different addresses the exe was
        // prelinked after the debug info was split off; shift the debug
        // addresses to match.
        let primary = self.find_section(".dynamic", SectionType::Null).map(|s| s.hdr.addr);
        let companion = debug_obj.find_section(".dynamic", SectionType::Null).map(|s| s.hdr.addr);
        if let (Some(primary), Some(companion)) = (primary, companion)
            && primary != companion
        {
            let diff = primary.wrapping_sub(companion);
            warn!(
                "dynamic section for debug symbols {} loaded for {} at different offset: \
                 diff is {diff:#x}, assuming the exe is prelinked",
                debug_obj.io.tag(),
                self.io.tag()
            );
            for section in &mut debug_obj.sections {
                section.hdr.addr = section.hdr.addr.wrapping_add(diff);
            }
            if let Some(loads) = debug_obj.program_headers.get_mut(&SegmentType::Load) {
                for ph in loads {
                    ph.vaddr = ph.vaddr.wrapping_add(diff);
                }
            }
        }
        Some(debug_obj)
    }
}
