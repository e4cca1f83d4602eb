//! Hash-accelerated name lookup over the dynamic symbol table, via either
//! the old SysV `.hash` section or the GNU `.gnu.hash` section with its
//! Bloom prefilter.
use super::{Reader, Result, Symbol};

/// Culled from the System V Application Binary Interface.
pub fn elf_hash(name: &str) -> u32 {
    let mut h: u32 = 0;
    for c in name.bytes() {
        h = (h << 4).wrapping_add(c as u32);
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/// The DJB hash the GNU table uses: h*33 + c, seeded with 5381.
pub fn gnu_hash(name: &str) -> u32 {
    let mut h: u32 = 5381;
    for c in name.bytes() {
        h = (h << 5).wrapping_add(h).wrapping_add(c as u32);
    }
    h
}

const STN_UNDEF: u32 = 0;

/// The `.hash` lookup structure: two word counts, then buckets, then chains.
/// Small enough to read into memory up front.
pub struct SysvHash {
    buckets: Vec<u32>,
    chains: Vec<u32>,
    syms: SymbolTableRef,
}

/// The symbol and string readers a hash table confirms candidates against.
struct SymbolTableRef {
    syms: Reader,
    strings: Reader,
}

impl SymbolTableRef {
    fn entry_size(&self) -> u64 {
        if self.syms.sixty_four_bit { 24 } else { 16 }
    }

    fn get(&self, index: u32) -> Option<Symbol> {
        Symbol::new(&self.syms, index as u64 * self.entry_size()).ok()
    }

    fn name_matches(&self, sym: &Symbol, name: &str) -> bool {
        self.strings
            .read_string(sym.name as u64)
            .map(|n| n == name)
            .unwrap_or(false)
    }
}

impl SysvHash {
    pub fn new(hash: &Reader, syms: Reader, strings: Reader) -> Result<Self> {
        let nbucket = hash.read_word(0)?;
        let nchain = hash.read_word(4)?;
        let mut buckets = Vec::with_capacity(nbucket as usize);
        for i in 0..nbucket as u64 {
            buckets.push(hash.read_word(8 + 4 * i)?);
        }
        let mut chains = Vec::with_capacity(nchain as usize);
        for i in 0..nchain as u64 {
            chains.push(hash.read_word(8 + 4 * (nbucket as u64 + i))?);
        }
        Ok(SysvHash {
            buckets,
            chains,
            syms: SymbolTableRef { syms, strings },
        })
    }

    /// Walk the chain for the name's bucket until the name matches or the
    /// chain ends at STN_UNDEF.
    pub fn find(&self, name: &str) -> Option<(u32, Symbol)> {
        if self.buckets.is_empty() {
            return None;
        }
        let bucket = elf_hash(name) as usize % self.buckets.len();
        let mut i = self.buckets[bucket];
        // chains form a permutation, so more steps than entries means a cycle
        for _ in 0..=self.chains.len() {
            if i == STN_UNDEF {
                return None;
            }
            let candidate = self.syms.get(i)?;
            if self.syms.name_matches(&candidate, name) {
                return Some((i, candidate));
            }
            i = *self.chains.get(i as usize)?;
        }
        None
    }
}

/// The `.gnu.hash` lookup structure. Reads go through the section reader on
/// demand; only the four header words are held here.
pub struct GnuHash {
    nbuckets: u32,
    symoffset: u32,
    bloom_size: u32,
    bloom_shift: u32,
    hash: Reader,
    syms: SymbolTableRef,
}

impl GnuHash {
    pub fn new(hash: &Reader, syms: Reader, strings: Reader) -> Result<Self> {
        let nbuckets = hash.read_word(0)?;
        let symoffset = hash.read_word(4)?;
        let bloom_size = hash.read_word(8)?;
        let bloom_shift = hash.read_word(12)?;
        Ok(GnuHash {
            nbuckets,
            symoffset,
            bloom_size,
            bloom_shift,
            hash: hash.clone(),
            syms: SymbolTableRef { syms, strings },
        })
    }

    /// Bloom words are the image's native word size.
    fn bits(&self) -> u32 {
        if self.hash.sixty_four_bit { 64 } else { 32 }
    }

    fn bloom_off(&self, i: u32) -> u64 {
        16 + i as u64 * (self.bits() as u64 / 8)
    }

    fn bucket_off(&self, i: u32) -> u64 {
        self.bloom_off(self.bloom_size) + 4 * i as u64
    }

    fn chain_off(&self, i: u32) -> u64 {
        self.bucket_off(self.nbuckets) + 4 * i as u64
    }

    /// Bloom prefilter first, then the bucket's chain. Chain entries carry
    /// the candidate's hash with the low bit marking the end of the chain,
    /// so compare hashes with that bit masked off.
    pub fn find(&self, name: &str) -> Option<(u32, Symbol)> {
        if self.nbuckets == 0 || self.bloom_size == 0 {
            return None;
        }
        let symhash = gnu_hash(name);
        let bits = self.bits();

        let bloomword = self
            .hash
            .read_addr(self.bloom_off((symhash / bits) % self.bloom_size))
            .ok()?;
        let mask: u64 = 1u64 << (symhash % bits) | 1u64 << ((symhash >> self.bloom_shift) % bits);
        if bloomword & mask != mask {
            return None;
        }

        let mut idx = self
            .hash
            .read_word(self.bucket_off(symhash % self.nbuckets))
            .ok()?;
        if idx < self.symoffset {
            return None;
        }
        loop {
            let candidate = self.syms.get(idx)?;
            let chainhash = self.hash.read_word(self.chain_off(idx - self.symoffset)).ok()?;
            if (chainhash | 1) == (symhash | 1) && self.syms.name_matches(&candidate, name) {
                return Some((idx, candidate));
            }
            if chainhash & 1 != 0 {
                return None;
            }
            idx += 1;
        }
    }
}
