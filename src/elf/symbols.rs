//! Symbol table entries and the tables that hold them.
use super::{Reader, Result, Stream};
use tracing::warn;

/// One symbol table entry, kept close to the file layout so address and
/// bounds checks can use the raw fields directly.
/// See https://refspecs.linuxbase.org/elf/gabi4+/ch4.symtab.html
#[derive(Clone)]
pub struct Symbol {
    /// Index into the symbol string table.
    pub name: u32,

    /// Can be an address, absolute value, etc.
    pub value: u64,

    /// Size of the symbol. Zero if the symbol has no or unknown size.
    pub size: u64,

    /// Type in the low nibble, binding in the high nibble.
    pub info: u8,

    /// Visibility in the low bits.
    pub other: u8,

    /// Index of the section the symbol is defined against, or one of the
    /// reserved SHN values. Zero (SHN_UNDEF) means undefined.
    pub shndx: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SymbolType {
    /// No type given. As a filter this accepts every type.
    None,

    /// A data object, variable, array, etc.
    Object,

    /// Function or other executable code.
    Func,

    /// Another section. Used for relocation.
    Section,

    /// Source file associated with the symbol table.
    File,

    /// Uninitialized common blocks. Used by the linker.
    Common,

    /// Thread local storage data. Value is an offset to the data.
    Tls,

    /// For use by OS or CPU.
    Reserved,
}

/// Linkage visibility and behavior.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SymbolBinding {
    /// Symbol is not visible outside the object file containing its
    /// definition. These appear before global and weak symbols in the table.
    Local,

    /// Visible to all object files.
    Global,

    /// Similar to Global but has lower precedence.
    Weak,

    /// For use by OS or CPU.
    Reserved,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SymbolVisibility {
    /// Visibility is per binding.
    Default,

    /// Visible only within its object file. CPU may special case this.
    Internal,

    /// Visible only within its object file.
    Hidden,

    /// Visible to other object files but cannot be preempted.
    Protected,
}

impl Symbol {
    pub fn new(reader: &Reader, offset: u64) -> Result<Self> {
        // Field order differs so we need both cases.
        let mut s = Stream::new(reader, offset);
        if reader.sixty_four_bit {
            let name = s.read_word()?;
            let info = s.read_byte()?;
            let other = s.read_byte()?;
            let shndx = s.read_half()?;
            let value = s.read_addr()?;
            let size = s.read_xword()?;
            Ok(Symbol {
                name,
                value,
                size,
                info,
                other,
                shndx,
            })
        } else {
            let name = s.read_word()?;
            let value = s.read_addr()?;
            let size = s.read_word()? as u64;
            let info = s.read_byte()?;
            let other = s.read_byte()?;
            let shndx = s.read_half()?;
            Ok(Symbol {
                name,
                value,
                size,
                info,
                other,
                shndx,
            })
        }
    }

    pub fn stype(&self) -> SymbolType {
        SymbolType::from_u8(self.info)
    }

    pub fn binding(&self) -> SymbolBinding {
        SymbolBinding::from_u8(self.info)
    }

    pub fn visibility(&self) -> SymbolVisibility {
        SymbolVisibility::from_u8(self.other)
    }
}

impl SymbolType {
    pub fn from_u8(value: u8) -> Self {
        match value & 0xf {
            0 => SymbolType::None,
            1 => SymbolType::Object,
            2 => SymbolType::Func,
            3 => SymbolType::Section,
            4 => SymbolType::File,
            5 => SymbolType::Common,
            6 => SymbolType::Tls,
            10 | 12 | 13 | 15 => SymbolType::Reserved,
            _ => {
                warn!("unknown symbol type: {}", value & 0xf);
                SymbolType::Reserved
            }
        }
    }
}

impl SymbolBinding {
    pub fn from_u8(value: u8) -> Self {
        match value >> 4 {
            0 => SymbolBinding::Local,
            1 => SymbolBinding::Global,
            2 => SymbolBinding::Weak,
            _ => SymbolBinding::Reserved,
        }
    }
}

impl SymbolVisibility {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x3 {
            0 => SymbolVisibility::Default,
            1 => SymbolVisibility::Internal,
            2 => SymbolVisibility::Hidden,
            _ => SymbolVisibility::Protected,
        }
    }
}

/// A symbol table section paired with its linked string table.
pub struct SymbolTable {
    syms: Reader,
    strings: Reader,
}

impl SymbolTable {
    pub fn new(syms: Reader, strings: Reader) -> Self {
        SymbolTable { syms, strings }
    }

    /// A table that yields nothing, used when the image has no such section.
    pub fn missing() -> Self {
        SymbolTable {
            syms: Reader::empty(),
            strings: Reader::empty(),
        }
    }

    pub fn entry_size(&self) -> u64 {
        if self.syms.sixty_four_bit { 24 } else { 16 }
    }

    pub fn len(&self) -> usize {
        (self.syms.size() / self.entry_size()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Symbol> {
        if index >= self.len() {
            return None;
        }
        Symbol::new(&self.syms, index as u64 * self.entry_size()).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = Symbol> + '_ {
        (0..self.len()).filter_map(|i| self.get(i))
    }

    /// Resolve a symbol's name from the linked string table.
    pub fn name(&self, sym: &Symbol) -> String {
        self.strings.read_string(sym.name as u64).unwrap_or_default()
    }
}
