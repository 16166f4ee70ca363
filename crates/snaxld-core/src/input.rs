//! Parsed object-file chunks as the writer sees them.
//!
//! Object parsing, symbol resolution, and liveness marking happen
//! upstream; the writer only reads these structures, except for the
//! output indices it records on chunks while planning.

use serde::Serialize;

use crate::format::{GlobalType, InitExpr, RelocKind, Signature};
use crate::symbol::SymbolId;

/// Identifier of an object file in registration order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub struct FileId(pub u32);

impl FileId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A relocation recorded against a chunk.
///
/// `index` addresses the owning file's symbol list, except for
/// `TypeIndexLeb` where it addresses the file's type space. `offset` is
/// relative to the chunk's payload.
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    pub kind: RelocKind,
    pub index: u32,
    pub offset: u32,
    pub addend: i32,
}

impl Relocation {
    pub fn new(kind: RelocKind, index: u32, offset: u32) -> Self {
        Self {
            kind,
            index,
            offset,
            addend: 0,
        }
    }
}

/// A function body imported from an object file (or synthesized by the
/// writer, for the ctor caller and the contract entry).
#[derive(Debug, Clone, Default)]
pub struct InputFunction {
    pub name: String,
    pub debug_name: String,
    pub signature: Signature,
    /// Locals declaration plus code, without the outer size prefix.
    pub body: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub live: bool,
    pub comdat: String,
    pub function_index: Option<u32>,
}

impl InputFunction {
    pub fn new(name: impl Into<String>, signature: Signature, body: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            signature,
            body,
            live: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct InputGlobal {
    pub ty: GlobalType,
    pub init: InitExpr,
    pub live: bool,
    pub global_index: Option<u32>,
}

impl InputGlobal {
    pub fn new(ty: GlobalType, init: InitExpr) -> Self {
        Self {
            ty,
            init,
            live: true,
            global_index: None,
        }
    }
}

/// A data segment chunk.
#[derive(Debug, Clone)]
pub struct InputSegment {
    pub name: String,
    pub alignment: u32,
    pub data: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub live: bool,
    pub comdat: String,
    /// Output placement, set by the segment builder.
    pub output_segment: Option<u32>,
    pub output_offset: u32,
}

impl InputSegment {
    pub fn new(name: impl Into<String>, alignment: u32, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            alignment,
            data,
            relocations: Vec::new(),
            live: true,
            comdat: String::new(),
            output_segment: None,
            output_offset: 0,
        }
    }
}

/// A custom section carried over from an object file.
#[derive(Debug, Clone)]
pub struct InputSection {
    pub name: String,
    pub data: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub live: bool,
}

impl InputSection {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
            relocations: Vec::new(),
            live: true,
        }
    }
}

/// An init-function record from the file's linking metadata.
#[derive(Debug, Clone, Copy)]
pub struct InitFunction {
    /// File-local symbol index of the function to call.
    pub symbol: u32,
    pub priority: u32,
}

/// One input object file.
#[derive(Debug, Default)]
pub struct ObjectFile {
    pub name: String,
    pub functions: Vec<InputFunction>,
    pub globals: Vec<InputGlobal>,
    pub segments: Vec<InputSegment>,
    pub custom_sections: Vec<InputSection>,
    /// File-local symbol index space, mapping into the global table.
    pub symbols: Vec<SymbolId>,
    /// The file's type space and its usage bitmap.
    pub types: Vec<Signature>,
    pub type_is_used: Vec<bool>,
    /// Output type index per file-local type, filled during planning.
    pub type_map: Vec<Option<u32>>,
    pub init_functions: Vec<InitFunction>,
    /// Embedded ABI blob; empty when the file carries none.
    pub abi: String,
    /// `"<action>:<handler>"` declarations.
    pub actions: Vec<String>,
    /// `"<code>::<action>:<handler>"` declarations.
    pub notify: Vec<String>,
}

impl ObjectFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Declare the file's type space; usage bits start cleared.
    pub fn set_types(&mut self, types: Vec<Signature>) {
        self.type_is_used = vec![false; types.len()];
        self.type_map = vec![None; types.len()];
        self.types = types;
    }
}
