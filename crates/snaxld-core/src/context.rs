//! The link context threaded through planning and emission.
//!
//! Configuration, the symbol table, the input files, and the well-known
//! symbol handles travel together as one explicit context instead of
//! process-wide state. The writer mutates the context while planning;
//! emission treats it as frozen.

use crate::config::LinkConfig;
use crate::diagnostic::Diagnostics;
use crate::input::{FileId, InputFunction, InputGlobal, ObjectFile};
use crate::symbol::{ChunkRef, SymbolId, SymbolKind, SymbolTable, WellKnown};

#[derive(Debug, Default)]
pub struct LinkContext {
    pub config: LinkConfig,
    pub symtab: SymbolTable,
    pub files: Vec<ObjectFile>,
    /// Synthetic chunks prepended during index assignment.
    pub synthetic_functions: Vec<InputFunction>,
    pub synthetic_globals: Vec<InputGlobal>,
    pub well_known: WellKnown,
    pub diagnostics: Diagnostics,
}

impl LinkContext {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            symtab: SymbolTable::new(),
            ..Self::default()
        }
    }

    pub fn add_file(&mut self, file: ObjectFile) -> FileId {
        let id = FileId(self.files.len() as u32);
        self.files.push(file);
        id
    }

    pub fn file(&self, id: FileId) -> &ObjectFile {
        &self.files[id.index()]
    }

    pub fn function_chunk(&self, chunk: ChunkRef) -> &InputFunction {
        match chunk {
            ChunkRef::Synthetic(i) => &self.synthetic_functions[i as usize],
            ChunkRef::File { file, index } => &self.files[file.index()].functions[index as usize],
        }
    }

    pub fn global_chunk(&self, chunk: ChunkRef) -> &InputGlobal {
        match chunk {
            ChunkRef::Synthetic(i) => &self.synthetic_globals[i as usize],
            ChunkRef::File { file, index } => &self.files[file.index()].globals[index as usize],
        }
    }

    /// Final function index of a symbol: imports carry it directly,
    /// defined functions resolve through their chunk.
    pub fn function_index(&self, id: SymbolId) -> Option<u32> {
        let func = self.symtab[id].as_function()?;
        if let Some(idx) = func.function_index {
            return Some(idx);
        }
        func.chunk
            .and_then(|c| self.function_chunk(c).function_index)
    }

    pub fn table_index(&self, id: SymbolId) -> Option<u32> {
        self.symtab[id].as_function()?.table_index
    }

    pub fn global_index(&self, id: SymbolId) -> Option<u32> {
        let global = self.symtab[id].as_global()?;
        if let Some(idx) = global.global_index {
            return Some(idx);
        }
        global.chunk.and_then(|c| self.global_chunk(c).global_index)
    }

    /// Virtual address of a data symbol; undefined references resolve
    /// to zero.
    pub fn data_address(&self, id: SymbolId) -> u32 {
        match &self.symtab[id].kind {
            SymbolKind::Data(d) => d.virtual_address.unwrap_or(0),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Signature;
    use crate::symbol::{FunctionSymbol, Symbol};

    #[test]
    fn test_function_index_resolution() {
        let mut ctx = LinkContext::new(LinkConfig::default());

        // Imported function: index stored on the symbol.
        let import = ctx.symtab.add(Symbol::undefined(
            "imp",
            SymbolKind::Function(FunctionSymbol {
                signature: Signature::default(),
                chunk: None,
                function_index: Some(0),
                table_index: None,
            }),
        ));
        assert_eq!(ctx.function_index(import), Some(0));

        // Defined function: index resolves through the chunk.
        let mut chunk = InputFunction::new("def", Signature::default(), vec![0x00, 0x0b]);
        chunk.function_index = Some(1);
        ctx.synthetic_functions.push(chunk);
        let defined = ctx.symtab.add(Symbol::defined(
            "def",
            SymbolKind::Function(FunctionSymbol {
                signature: Signature::default(),
                chunk: Some(ChunkRef::Synthetic(0)),
                function_index: None,
                table_index: None,
            }),
        ));
        assert_eq!(ctx.function_index(defined), Some(1));
    }
}
