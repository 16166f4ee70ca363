//! Output writer for the snax WebAssembly contract linker.
//!
//! Takes a fully-resolved symbol table plus parsed object files and
//! produces the final module binary and the merged `.abi` companion
//! artifact.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          LinkContext                             │
//! │  ┌───────────┐  ┌─────────────┐  ┌────────────┐  ┌───────────┐  │
//! │  │  Config   │  │ SymbolTable │  │ ObjectFile │  │ WellKnown │  │
//! │  │ (options) │  │ (resolved)  │  │  (chunks)  │  │ (handles) │  │
//! │  └───────────┘  └─────────────┘  └────────────┘  └───────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//!          │
//!          ▼
//!   imports → indexes → init funcs → synthetic bodies → types
//!          → memory layout → exports → symtab → sections → file
//! ```
//!
//! Planning is sequential; the only parallel region is the final write,
//! where each section serializes into its own disjoint slice of the
//! output buffer.

pub mod abi;
pub mod config;
pub mod context;
pub mod diagnostic;
pub mod encode;
pub mod format;
pub mod input;
pub mod name;
pub mod symbol;
pub mod types;
pub mod writer;

pub use abi::{AbiError, AbiMerger, JsonAbiMerger};
pub use config::LinkConfig;
pub use context::LinkContext;
pub use diagnostic::{Diagnostic, Diagnostics, Severity};
pub use format::{Export, ExportKind, GlobalType, InitExpr, RelocKind, Signature, ValueType};
pub use input::{
    FileId, InitFunction, InputFunction, InputGlobal, InputSection, InputSegment, ObjectFile,
    Relocation,
};
pub use name::string_to_name;
pub use symbol::{
    ChunkRef, DataLocation, DataSymbol, FunctionSymbol, GlobalSymbol, SectionSymbol, Symbol,
    SymbolId, SymbolKind, SymbolTable, WellKnown,
};
pub use types::SignatureRegistry;
pub use writer::{write_result, WriteError, Writer};
