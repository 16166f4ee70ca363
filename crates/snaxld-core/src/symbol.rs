//! Resolved symbols and the symbol table the writer consumes.
//!
//! `Symbol` is a tagged variant over function / global / data / section
//! payloads behind a shared header of name and resolution flags. Symbols
//! reference their defining chunks by index ([`ChunkRef`]), never by
//! pointer, so the chunk/symbol graph stays cycle-free.

use std::collections::HashMap;
use std::ops::{Index, IndexMut};

use serde::Serialize;

use crate::format::{GlobalType, Signature};
use crate::input::FileId;

/// Identifier of a symbol in the [`SymbolTable`] arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub struct SymbolId(pub u32);

impl SymbolId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Reference to a defining chunk: either a synthetic chunk owned by the
/// link context or a chunk of an input object file.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChunkRef {
    Synthetic(u32),
    File { file: FileId, index: u32 },
}

#[derive(Debug, Clone)]
pub struct FunctionSymbol {
    pub signature: Signature,
    /// Defining chunk; `None` for imports.
    pub chunk: Option<ChunkRef>,
    /// Set during import planning; defined functions resolve through the
    /// chunk instead.
    pub function_index: Option<u32>,
    pub table_index: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct GlobalSymbol {
    pub ty: GlobalType,
    pub chunk: Option<ChunkRef>,
    pub global_index: Option<u32>,
}

/// Placement of a defined data symbol inside an input segment.
#[derive(Debug, Clone, Copy)]
pub struct DataLocation {
    pub file: FileId,
    /// Input segment index within the file.
    pub segment: u32,
    /// Offset within that input segment.
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DataSymbol {
    pub location: Option<DataLocation>,
    /// Final address in linear memory. Computed by memory layout for
    /// located symbols; set directly for `__heap_base` and friends.
    pub virtual_address: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SectionSymbol {
    /// Name of the custom section the symbol refers to.
    pub section: String,
    pub output_section_index: Option<u32>,
}

#[derive(Debug, Clone)]
pub enum SymbolKind {
    Function(FunctionSymbol),
    Global(GlobalSymbol),
    Data(DataSymbol),
    Section(SectionSymbol),
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub defined: bool,
    pub weak: bool,
    pub local: bool,
    pub hidden: bool,
    pub live: bool,
    pub used_in_regular_obj: bool,
    /// Owning object file; `None` for synthetic symbols.
    pub file: Option<FileId>,
    pub kind: SymbolKind,
    /// Index in the linking section's symbol table (relocatable output).
    pub output_symbol_index: Option<u32>,
}

impl Symbol {
    /// A defined, live, non-hidden symbol. Flags are public fields, so
    /// callers refine them after construction.
    pub fn defined(name: impl Into<String>, kind: SymbolKind) -> Self {
        Self {
            name: name.into(),
            defined: true,
            weak: false,
            local: false,
            hidden: false,
            live: true,
            used_in_regular_obj: true,
            file: None,
            kind,
            output_symbol_index: None,
        }
    }

    /// An undefined reference, i.e. an import candidate.
    pub fn undefined(name: impl Into<String>, kind: SymbolKind) -> Self {
        Self {
            defined: false,
            ..Self::defined(name, kind)
        }
    }

    pub fn is_undefined(&self) -> bool {
        !self.defined
    }

    pub fn as_function(&self) -> Option<&FunctionSymbol> {
        match &self.kind {
            SymbolKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_function_mut(&mut self) -> Option<&mut FunctionSymbol> {
        match &mut self.kind {
            SymbolKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_global(&self) -> Option<&GlobalSymbol> {
        match &self.kind {
            SymbolKind::Global(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&DataSymbol> {
        match &self.kind {
            SymbolKind::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_data_mut(&mut self) -> Option<&mut DataSymbol> {
        match &mut self.kind {
            SymbolKind::Data(d) => Some(d),
            _ => None,
        }
    }
}

/// Arena of resolved symbols in registration order, with name lookup.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, SymbolId>,
    /// When false, the writer synthesizes the contract entry function.
    pub entry_is_defined: bool,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            entry_is_defined: true,
            ..Self::default()
        }
    }

    /// Register a symbol. A later symbol with the same name shadows the
    /// earlier one in name lookups (resolution happens upstream).
    pub fn add(&mut self, sym: Symbol) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.by_name.insert(sym.name.clone(), id);
        self.symbols.push(sym);
        id
    }

    pub fn find(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Symbol ids in registration order.
    pub fn ids(&self) -> impl Iterator<Item = SymbolId> {
        (0..self.symbols.len() as u32).map(SymbolId)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }
}

impl Index<SymbolId> for SymbolTable {
    type Output = Symbol;

    fn index(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.index()]
    }
}

impl IndexMut<SymbolId> for SymbolTable {
    fn index_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.index()]
    }
}

/// Handles to the symbols the writer treats specially.
#[derive(Debug, Default)]
pub struct WellKnown {
    /// The mutable stack-pointer global; never exported.
    pub stack_pointer: Option<SymbolId>,
    /// Index of the stack pointer's chunk in the synthetic global list.
    pub stack_pointer_global: Option<u32>,
    pub dso_handle: Option<SymbolId>,
    pub data_end: Option<SymbolId>,
    pub heap_base: Option<SymbolId>,
    /// `__wasm_call_ctors` and its synthetic chunk.
    pub call_ctors: Option<SymbolId>,
    pub call_ctors_func: Option<u32>,
    /// The contract entry function and its synthetic chunk.
    pub entry: Option<SymbolId>,
    pub entry_func: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ValueType;

    fn func_kind() -> SymbolKind {
        SymbolKind::Function(FunctionSymbol {
            signature: Signature::new(vec![], None),
            chunk: None,
            function_index: None,
            table_index: None,
        })
    }

    #[test]
    fn test_add_and_find() {
        let mut table = SymbolTable::new();
        let id = table.add(Symbol::defined("foo", func_kind()));
        assert_eq!(table.find("foo"), Some(id));
        assert_eq!(table.find("bar"), None);
        assert_eq!(table[id].name, "foo");
    }

    #[test]
    fn test_later_symbol_shadows() {
        let mut table = SymbolTable::new();
        let first = table.add(Symbol::defined("dup", func_kind()));
        let second = table.add(Symbol::defined("dup", func_kind()));
        assert_ne!(first, second);
        assert_eq!(table.find("dup"), Some(second));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_undefined_flags() {
        let sym = Symbol::undefined(
            "env_fn",
            SymbolKind::Global(GlobalSymbol {
                ty: GlobalType {
                    value_type: ValueType::I32,
                    mutable: false,
                },
                chunk: None,
                global_index: None,
            }),
        );
        assert!(sym.is_undefined());
        assert!(sym.live);
        assert!(sym.used_in_regular_obj);
    }
}
