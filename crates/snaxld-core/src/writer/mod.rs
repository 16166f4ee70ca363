//! The output writer.
//!
//! `Writer::run` turns a resolved symbol table plus parsed object files
//! into the module binary (and the sibling `.abi` artifact). Planning is
//! strictly sequential: imports, index assignment, init functions,
//! synthetic bodies, types, memory layout, exports, custom sections,
//! then the linking symbol table. Emission freezes all of that and
//! serializes the sections in parallel into disjoint ranges of the
//! output buffer.

mod metadata;
pub mod sections;
pub mod synthetic;

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write as _;

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

use crate::abi::{abi_output_path, AbiError, AbiMerger};
use crate::context::LinkContext;
use crate::encode::{write_signature, write_uleb128};
use crate::format::{
    align_to, Export, ExportKind, Global, GlobalType, Import, ImportKind, InitExpr, Limits,
    RelocKind, SectionId, Signature, ValueType, FUNCTION_TABLE_NAME, INITIAL_TABLE_OFFSET,
    LIMITS_FLAG_HAS_MAX, STACK_ALIGNMENT, WASM_MAGIC, WASM_PAGE_SIZE, WASM_VERSION,
};
use crate::input::{FileId, Relocation};
use crate::symbol::{ChunkRef, SymbolId, SymbolKind};
use crate::types::SignatureRegistry;

use sections::{
    CodeSection, CustomSection, DataSection, EmitContext, OutputSection, OutputSegment,
    SyntheticSection,
};

const HEADER_SIZE: usize = 8;

/// Fatal failures of the write stage. Recoverable problems accumulate in
/// the context's diagnostics instead and surface as [`WriteError::Errors`]
/// at the commit checkpoints.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("failed to write the output file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Abi(#[from] AbiError),
    #[error("link failed with {0} error(s)")]
    Errors(usize),
}

/// An init function scheduled for `__wasm_call_ctors`.
#[derive(Debug, Clone, Copy)]
pub struct InitEntry {
    pub sym: SymbolId,
    pub priority: u32,
}

/// Write the link result described by `ctx` to disk.
pub fn write_result(ctx: &mut LinkContext, merger: &mut dyn AbiMerger) -> Result<(), WriteError> {
    Writer::new(ctx).run(merger)
}

pub struct Writer<'a> {
    ctx: &'a mut LinkContext,
    types: SignatureRegistry,

    imported_symbols: Vec<SymbolId>,
    num_imported_functions: u32,
    num_imported_globals: u32,

    /// Defined function and global chunks in final index order.
    input_functions: Vec<ChunkRef>,
    input_globals: Vec<ChunkRef>,
    indirect_functions: Vec<SymbolId>,

    exports: Vec<Export>,
    /// Data symbols exported through synthetic i32 globals.
    fake_globals: Vec<SymbolId>,

    init_functions: Vec<InitEntry>,
    symtab_entries: Vec<SymbolId>,
    abis: Vec<String>,

    custom_section_inputs: BTreeMap<String, Vec<(FileId, u32)>>,
    custom_section_symbols: HashMap<String, SymbolId>,

    segments: Vec<OutputSegment>,
    segment_map: HashMap<String, u32>,

    output_sections: Vec<OutputSection>,
    file_size: usize,
    num_memory_pages: u32,
    max_memory_pages: u32,
}

impl<'a> Writer<'a> {
    pub fn new(ctx: &'a mut LinkContext) -> Self {
        Self {
            ctx,
            types: SignatureRegistry::new(),
            imported_symbols: Vec::new(),
            num_imported_functions: 0,
            num_imported_globals: 0,
            input_functions: Vec::new(),
            input_globals: Vec::new(),
            indirect_functions: Vec::new(),
            exports: Vec::new(),
            fake_globals: Vec::new(),
            init_functions: Vec::new(),
            symtab_entries: Vec::new(),
            abis: Vec::new(),
            custom_section_inputs: BTreeMap::new(),
            custom_section_symbols: HashMap::new(),
            segments: Vec::new(),
            segment_map: HashMap::new(),
            output_sections: Vec::new(),
            file_size: 0,
            num_memory_pages: 0,
            max_memory_pages: 0,
        }
    }

    pub fn run(&mut self, merger: &mut dyn AbiMerger) -> Result<(), WriteError> {
        if self.ctx.config.relocatable {
            self.ctx.config.global_base = 0;
        }

        debug!("-- calculate_imports");
        self.calculate_imports();
        debug!("-- assign_indexes");
        self.assign_indexes();
        debug!("-- calculate_init_functions");
        self.calculate_init_functions();
        if !self.ctx.config.relocatable {
            synthetic::create_ctor_function(self.ctx, &self.init_functions);
        }
        if !self.ctx.symtab.entry_is_defined {
            synthetic::create_dispatch_function(self.ctx);
        }

        debug!("-- calculate_types");
        self.calculate_types();
        debug!("-- layout_memory");
        self.layout_memory();
        debug!("-- calculate_exports");
        self.calculate_exports();
        debug!("-- calculate_custom_sections");
        self.calculate_custom_sections();
        debug!("-- assign_symtab");
        self.assign_symtab();

        info!(
            functions = self.input_functions.len(),
            globals = self.input_globals.len(),
            function_imports = self.num_imported_functions,
            global_imports = self.num_imported_globals,
            "planned module"
        );

        debug!("-- create_sections");
        self.create_sections();

        debug!("-- open_file");
        let file = self.open_file();
        if self.ctx.diagnostics.has_errors() {
            return Err(WriteError::Errors(self.ctx.diagnostics.error_count()));
        }
        let mut file = file.expect("file open reported no error");

        let mut buffer = vec![0u8; self.file_size];
        self.write_header(&mut buffer);
        debug!("-- write_sections");
        self.write_sections(&mut buffer);
        if self.ctx.diagnostics.has_errors() {
            return Err(WriteError::Errors(self.ctx.diagnostics.error_count()));
        }

        file.write_all(&buffer)?;
        file.flush()?;
        drop(file);

        self.write_abi(merger)
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    /// A symbol is imported iff it is an undefined non-data reference
    /// that is live, used from a regular object, and not a weak
    /// reference in non-relocatable output.
    fn calculate_imports(&mut self) {
        let ctx = &mut *self.ctx;
        for i in 0..ctx.symtab.len() {
            let id = SymbolId(i as u32);
            {
                let sym = &ctx.symtab[id];
                if !sym.is_undefined()
                    || matches!(sym.kind, SymbolKind::Data(_))
                    || (sym.weak && !ctx.config.relocatable)
                    || !sym.live
                    || !sym.used_in_regular_obj
                {
                    continue;
                }
            }
            match &mut ctx.symtab[id].kind {
                SymbolKind::Function(f) => {
                    f.function_index = Some(self.num_imported_functions);
                    self.num_imported_functions += 1;
                }
                SymbolKind::Global(g) => {
                    g.global_index = Some(self.num_imported_globals);
                    self.num_imported_globals += 1;
                }
                _ => continue,
            }
            debug!(name = %ctx.symtab[id].name, "import");
            self.imported_symbols.push(id);
        }
    }

    fn assign_indexes(&mut self) {
        let ctx = &mut *self.ctx;

        let mut function_index = self.num_imported_functions;
        for i in 0..ctx.synthetic_functions.len() {
            if !ctx.synthetic_functions[i].live {
                continue;
            }
            ctx.synthetic_functions[i].function_index = Some(function_index);
            function_index += 1;
            self.input_functions.push(ChunkRef::Synthetic(i as u32));
        }
        for fid in 0..ctx.files.len() {
            for i in 0..ctx.files[fid].functions.len() {
                if !ctx.files[fid].functions[i].live {
                    continue;
                }
                ctx.files[fid].functions[i].function_index = Some(function_index);
                function_index += 1;
                self.input_functions.push(ChunkRef::File {
                    file: FileId(fid as u32),
                    index: i as u32,
                });
            }
        }

        // Table slots and type demand come from the relocations of every
        // live code, data, and custom-section chunk.
        let mut table_index = INITIAL_TABLE_OFFSET;
        for fid in 0..ctx.files.len() {
            let mut relocs: Vec<Relocation> = Vec::new();
            for func in &ctx.files[fid].functions {
                if func.live {
                    relocs.extend_from_slice(&func.relocations);
                }
            }
            for seg in &ctx.files[fid].segments {
                if seg.live {
                    relocs.extend_from_slice(&seg.relocations);
                }
            }
            for sec in &ctx.files[fid].custom_sections {
                if sec.live {
                    relocs.extend_from_slice(&sec.relocations);
                }
            }
            for reloc in relocs {
                match reloc.kind {
                    RelocKind::TableIndexI32 | RelocKind::TableIndexSleb => {
                        let sym_id = ctx.files[fid].symbols[reloc.index as usize];
                        let has_table = ctx
                            .symtab[sym_id]
                            .as_function()
                            .and_then(|f| f.table_index)
                            .is_some();
                        if has_table || ctx.function_index(sym_id).is_none() {
                            continue;
                        }
                        if let Some(f) = ctx.symtab[sym_id].as_function_mut() {
                            f.table_index = Some(table_index);
                            table_index += 1;
                            self.indirect_functions.push(sym_id);
                        }
                    }
                    RelocKind::TypeIndexLeb => {
                        let ti = reloc.index as usize;
                        let sig = ctx.files[fid].types[ti].clone();
                        let out = self.types.register(&sig);
                        ctx.files[fid].type_map[ti] = Some(out);
                        ctx.files[fid].type_is_used[ti] = true;
                    }
                    _ => {}
                }
            }
        }

        let mut global_index = self.num_imported_globals;
        for i in 0..ctx.synthetic_globals.len() {
            if !ctx.synthetic_globals[i].live {
                continue;
            }
            ctx.synthetic_globals[i].global_index = Some(global_index);
            global_index += 1;
            self.input_globals.push(ChunkRef::Synthetic(i as u32));
        }
        for fid in 0..ctx.files.len() {
            for i in 0..ctx.files[fid].globals.len() {
                if !ctx.files[fid].globals[i].live {
                    continue;
                }
                ctx.files[fid].globals[i].global_index = Some(global_index);
                global_index += 1;
                self.input_globals.push(ChunkRef::File {
                    file: FileId(fid as u32),
                    index: i as u32,
                });
            }
        }
    }

    fn calculate_init_functions(&mut self) {
        let ctx = &mut *self.ctx;
        for fid in 0..ctx.files.len() {
            for i in 0..ctx.files[fid].init_functions.len() {
                let init = ctx.files[fid].init_functions[i];
                let sym = ctx.files[fid].symbols[init.symbol as usize];
                let void_sig = Signature::default();
                let sig_ok = ctx.symtab[sym]
                    .as_function()
                    .map(|f| f.signature == void_sig)
                    .unwrap_or(false);
                if !sig_ok {
                    let name = ctx.symtab[sym].name.clone();
                    ctx.diagnostics
                        .error(format!("invalid signature for init func: {}", name));
                }
                self.init_functions.push(InitEntry {
                    sym,
                    priority: init.priority,
                });
            }
        }
        // Lowest priority first; stable within equal priorities.
        self.init_functions.sort_by_key(|e| e.priority);
    }

    /// The type section is the union of TYPE-relocation demand, imported
    /// function signatures, and defined function signatures.
    fn calculate_types(&mut self) {
        for fid in 0..self.ctx.files.len() {
            for ti in 0..self.ctx.files[fid].types.len() {
                if self.ctx.files[fid].type_is_used[ti] {
                    let sig = self.ctx.files[fid].types[ti].clone();
                    let out = self.types.register(&sig);
                    self.ctx.files[fid].type_map[ti] = Some(out);
                }
            }
        }
        for i in 0..self.imported_symbols.len() {
            let id = self.imported_symbols[i];
            if let Some(f) = self.ctx.symtab[id].as_function() {
                let sig = f.signature.clone();
                self.types.register(&sig);
            }
        }
        for i in 0..self.input_functions.len() {
            let sig = self.ctx.function_chunk(self.input_functions[i]).signature.clone();
            self.types.register(&sig);
        }
    }

    fn create_output_segments(&mut self) {
        let ctx = &mut *self.ctx;
        for fid in 0..ctx.files.len() {
            if !ctx.files[fid].abi.is_empty() {
                self.abis.push(ctx.files[fid].abi.clone());
            }
            for si in 0..ctx.files[fid].segments.len() {
                if !ctx.files[fid].segments[si].live {
                    continue;
                }
                let name =
                    output_segment_name(ctx.config.merge_data_segments, &ctx.files[fid].segments[si].name)
                        .to_string();
                let index = match self.segment_map.get(&name) {
                    Some(&i) => i,
                    None => {
                        debug!(segment = %name, "new segment");
                        let i = self.segments.len() as u32;
                        self.segments.push(OutputSegment::new(name.clone(), i));
                        self.segment_map.insert(name, i);
                        i
                    }
                };
                let input = &mut ctx.files[fid].segments[si];
                let out = &mut self.segments[index as usize];
                out.alignment = out.alignment.max(input.alignment.max(1));
                let offset = align_to(out.size, input.alignment.max(1));
                input.output_segment = Some(index);
                input.output_offset = offset;
                out.size = offset + input.data.len() as u32;
                out.inputs.push((FileId(fid as u32), si as u32));
            }
        }
    }

    /// Assign virtual addresses: data segments from the global base (or
    /// above the stack with `stack_first`), then the stack, then the
    /// heap base.
    fn layout_memory(&mut self) {
        self.create_output_segments();
        let ctx = &mut *self.ctx;

        fn place_stack(ctx: &mut LinkContext, memory_ptr: &mut u32) {
            if ctx.config.relocatable {
                return;
            }
            *memory_ptr = align_to(*memory_ptr, STACK_ALIGNMENT);
            if ctx.config.z_stack_size != align_to(ctx.config.z_stack_size, STACK_ALIGNMENT) {
                ctx.diagnostics
                    .error(format!("stack size must be {}-byte aligned", STACK_ALIGNMENT));
            }
            info!("mem: stack size  = {}", ctx.config.z_stack_size);
            info!("mem: stack base  = {}", memory_ptr);
            *memory_ptr += ctx.config.z_stack_size;
            if let Some(g) = ctx.well_known.stack_pointer_global {
                ctx.synthetic_globals[g as usize].init = InitExpr::I32Const(*memory_ptr as i32);
            }
            info!("mem: stack top   = {}", memory_ptr);
        }

        fn set_data_address(ctx: &mut LinkContext, id: SymbolId, va: u32) {
            if let Some(d) = ctx.symtab[id].as_data_mut() {
                d.virtual_address = Some(va);
            }
        }

        let mut memory_ptr: u32 = 0;
        if ctx.config.stack_first {
            place_stack(ctx, &mut memory_ptr);
        } else {
            memory_ptr = ctx.config.global_base;
            info!("mem: global base = {}", ctx.config.global_base);
        }

        let data_start = memory_ptr;
        // __dso_handle points at the start of the data segments.
        if let Some(id) = ctx.well_known.dso_handle {
            set_data_address(ctx, id, data_start);
        }

        for seg in &mut self.segments {
            memory_ptr = align_to(memory_ptr, seg.alignment);
            seg.start_va = memory_ptr;
            info!(
                "mem: {:<15} offset={:<8} size={:<8} align={}",
                seg.name, memory_ptr, seg.size, seg.alignment
            );
            memory_ptr += seg.size;
        }

        // Located data symbols get their final addresses now.
        for i in 0..ctx.symtab.len() {
            let id = SymbolId(i as u32);
            let loc = match &ctx.symtab[id].kind {
                SymbolKind::Data(d) => d.location,
                _ => None,
            };
            if let Some(loc) = loc {
                let input = &ctx.files[loc.file.index()].segments[loc.segment as usize];
                if let Some(out) = input.output_segment {
                    let va = self.segments[out as usize].start_va + input.output_offset + loc.offset;
                    set_data_address(ctx, id, va);
                }
            }
        }

        if let Some(id) = ctx.well_known.data_end {
            set_data_address(ctx, id, memory_ptr);
        }
        info!("mem: static data = {}", memory_ptr - data_start);

        if !ctx.config.stack_first {
            place_stack(ctx, &mut memory_ptr);
        }

        // The heap grows from directly after the stack and static data.
        if !ctx.config.relocatable {
            if let Some(id) = ctx.well_known.heap_base {
                set_data_address(ctx, id, memory_ptr);
            }
            info!("mem: heap base   = {}", memory_ptr);
        }

        if ctx.config.initial_memory != 0 {
            if ctx.config.initial_memory != align_to(ctx.config.initial_memory, WASM_PAGE_SIZE) {
                ctx.diagnostics
                    .error(format!("initial memory must be {}-byte aligned", WASM_PAGE_SIZE));
            }
            if memory_ptr > ctx.config.initial_memory {
                ctx.diagnostics.error(format!(
                    "initial memory too small, {} bytes needed",
                    memory_ptr
                ));
            } else {
                memory_ptr = ctx.config.initial_memory;
            }
        }
        self.num_memory_pages = align_to(memory_ptr, WASM_PAGE_SIZE) / WASM_PAGE_SIZE;
        info!("mem: total pages = {}", self.num_memory_pages);

        if ctx.config.max_memory != 0 {
            if ctx.config.max_memory != align_to(ctx.config.max_memory, WASM_PAGE_SIZE) {
                ctx.diagnostics
                    .error(format!("maximum memory must be {}-byte aligned", WASM_PAGE_SIZE));
            }
            if memory_ptr > ctx.config.max_memory {
                ctx.diagnostics.error(format!(
                    "maximum memory too small, {} bytes needed",
                    memory_ptr
                ));
            }
            self.max_memory_pages = ctx.config.max_memory / WASM_PAGE_SIZE;
            info!("mem: max pages   = {}", self.max_memory_pages);
        }
    }

    fn calculate_exports(&mut self) {
        let ctx = &mut *self.ctx;
        if ctx.config.relocatable {
            return;
        }
        if !ctx.config.import_memory {
            self.exports.push(Export {
                name: "memory".to_string(),
                kind: ExportKind::Memory,
                index: 0,
            });
        }
        if ctx.config.export_table {
            self.exports.push(Export {
                name: FUNCTION_TABLE_NAME.to_string(),
                kind: ExportKind::Table,
                index: 0,
            });
        }

        let mut fake_global_index = self.num_imported_globals + self.input_globals.len() as u32;
        for i in 0..ctx.symtab.len() {
            let id = SymbolId(i as u32);
            let sym = &ctx.symtab[id];
            if !sym.defined
                || (sym.hidden && !ctx.config.export_all)
                || sym.local
                || !sym.live
            {
                continue;
            }
            let name = sym.name.clone();
            let export = match &sym.kind {
                SymbolKind::Function(_) => Export {
                    name,
                    kind: ExportKind::Function,
                    index: ctx
                        .function_index(id)
                        .expect("defined function has an index"),
                },
                SymbolKind::Global(g) => {
                    if g.ty.mutable {
                        // Only the stack pointer is ever created mutable,
                        // and it is never exported.
                        debug_assert_eq!(ctx.well_known.stack_pointer, Some(id));
                        continue;
                    }
                    Export {
                        name,
                        kind: ExportKind::Global,
                        index: ctx.global_index(id).expect("defined global has an index"),
                    }
                }
                SymbolKind::Data(_) => {
                    self.fake_globals.push(id);
                    let export = Export {
                        name,
                        kind: ExportKind::Global,
                        index: fake_global_index,
                    };
                    fake_global_index += 1;
                    export
                }
                SymbolKind::Section(_) => continue,
            };
            debug!(name = %export.name, "export");
            self.exports.push(export);
        }
    }

    fn calculate_custom_sections(&mut self) {
        let ctx = &*self.ctx;
        let strip_debug = ctx.config.strip_debug || ctx.config.strip_all;
        for fid in 0..ctx.files.len() {
            for si in 0..ctx.files[fid].custom_sections.len() {
                let name = &ctx.files[fid].custom_sections[si].name;
                // These are known to the linker and synthesized rather
                // than blindly copied.
                if name == "linking" || name == "name" || name.starts_with("reloc.") {
                    continue;
                }
                if strip_debug && name.starts_with(".debug_") {
                    continue;
                }
                self.custom_section_inputs
                    .entry(name.clone())
                    .or_default()
                    .push((FileId(fid as u32), si as u32));
            }
        }
    }

    // ------------------------------------------------------------------
    // Section creation
    // ------------------------------------------------------------------

    fn lookup_type(&mut self, sig: &Signature) -> u32 {
        match self.types.lookup(sig) {
            Some(idx) => idx,
            None => {
                self.ctx
                    .diagnostics
                    .error(format!("type not found: {}", sig));
                0
            }
        }
    }

    fn push_synthetic(&mut self, section: SyntheticSection) {
        self.output_sections.push(OutputSection::Synthetic(section));
    }

    fn create_type_section(&mut self) {
        let mut sec = SyntheticSection::new(SectionId::Type, "");
        write_uleb128(&mut sec.body, self.types.len() as u64);
        for sig in self.types.iter() {
            write_signature(&mut sec.body, sig);
        }
        self.push_synthetic(sec);
    }

    fn create_import_section(&mut self) {
        let mut num_imports = self.imported_symbols.len() as u32;
        if self.ctx.config.import_memory {
            num_imports += 1;
        }
        if self.ctx.config.import_table {
            num_imports += 1;
        }
        if num_imports == 0 {
            return;
        }

        let mut sec = SyntheticSection::new(SectionId::Import, "");
        write_uleb128(&mut sec.body, num_imports as u64);

        if self.ctx.config.import_memory {
            let mut limits = Limits {
                flags: 0,
                initial: self.num_memory_pages,
                maximum: 0,
            };
            if self.max_memory_pages != 0 {
                limits.flags |= LIMITS_FLAG_HAS_MAX;
                limits.maximum = self.max_memory_pages;
            }
            crate::encode::write_import(
                &mut sec.body,
                &Import {
                    field: "memory".to_string(),
                    kind: ImportKind::Memory { limits },
                },
            );
        }
        if self.ctx.config.import_table {
            let size = INITIAL_TABLE_OFFSET + self.indirect_functions.len() as u32;
            crate::encode::write_import(
                &mut sec.body,
                &Import {
                    field: FUNCTION_TABLE_NAME.to_string(),
                    kind: ImportKind::Table {
                        limits: Limits::exact(size),
                    },
                },
            );
        }

        for i in 0..self.imported_symbols.len() {
            let id = self.imported_symbols[i];
            let (field, pending) = {
                let sym = &self.ctx.symtab[id];
                match &sym.kind {
                    SymbolKind::Function(f) => (sym.name.clone(), Ok(f.signature.clone())),
                    SymbolKind::Global(g) => (sym.name.clone(), Err(g.ty)),
                    _ => unreachable!("only functions and globals are imported"),
                }
            };
            let kind = match pending {
                Ok(sig) => ImportKind::Function {
                    sig_index: self.lookup_type(&sig),
                },
                Err(ty) => ImportKind::Global { ty },
            };
            crate::encode::write_import(&mut sec.body, &Import { field, kind });
        }
        self.push_synthetic(sec);
    }

    fn create_function_section(&mut self) {
        if self.input_functions.is_empty() {
            return;
        }
        let mut body = Vec::new();
        write_uleb128(&mut body, self.input_functions.len() as u64);
        for i in 0..self.input_functions.len() {
            let sig = self
                .ctx
                .function_chunk(self.input_functions[i])
                .signature
                .clone();
            let index = self.lookup_type(&sig);
            write_uleb128(&mut body, index as u64);
        }
        let mut sec = SyntheticSection::new(SectionId::Function, "");
        sec.body = body;
        self.push_synthetic(sec);
    }

    /// The table section is always emitted (unless the table is
    /// imported), even when empty: a module containing `call_indirect`
    /// fails validation without a table.
    fn create_table_section(&mut self) {
        if self.ctx.config.import_table {
            return;
        }
        let size = INITIAL_TABLE_OFFSET + self.indirect_functions.len() as u32;
        let mut sec = SyntheticSection::new(SectionId::Table, "");
        write_uleb128(&mut sec.body, 1);
        crate::encode::write_table_type(&mut sec.body, &Limits::exact(size));
        self.push_synthetic(sec);
    }

    fn create_memory_section(&mut self) {
        if self.ctx.config.import_memory {
            return;
        }
        let mut sec = SyntheticSection::new(SectionId::Memory, "");
        write_uleb128(&mut sec.body, 1);
        let mut limits = Limits {
            flags: 0,
            initial: self.num_memory_pages,
            maximum: 0,
        };
        if self.max_memory_pages != 0 {
            limits.flags |= LIMITS_FLAG_HAS_MAX;
            limits.maximum = self.max_memory_pages;
        }
        crate::encode::write_limits(&mut sec.body, &limits);
        self.push_synthetic(sec);
    }

    fn create_global_section(&mut self) {
        let num_globals = self.input_globals.len() + self.fake_globals.len();
        if num_globals == 0 {
            return;
        }
        let mut sec = SyntheticSection::new(SectionId::Global, "");
        write_uleb128(&mut sec.body, num_globals as u64);
        for &chunk in &self.input_globals {
            let global = self.ctx.global_chunk(chunk);
            crate::encode::write_global(
                &mut sec.body,
                &Global {
                    ty: global.ty,
                    init: global.init,
                },
            );
        }
        for &id in &self.fake_globals {
            crate::encode::write_global(
                &mut sec.body,
                &Global {
                    ty: GlobalType {
                        value_type: ValueType::I32,
                        mutable: false,
                    },
                    init: InitExpr::I32Const(self.ctx.data_address(id) as i32),
                },
            );
        }
        self.push_synthetic(sec);
    }

    fn create_export_section(&mut self) {
        if self.exports.is_empty() {
            return;
        }
        let filtered: Vec<Export> = self
            .exports
            .iter()
            .filter(|e| self.ctx.config.retains_export(e))
            .cloned()
            .collect();
        self.exports = filtered;
        if self.exports.is_empty() {
            return;
        }
        let mut sec = SyntheticSection::new(SectionId::Export, "");
        write_uleb128(&mut sec.body, self.exports.len() as u64);
        for export in &self.exports {
            crate::encode::write_export(&mut sec.body, export);
        }
        self.push_synthetic(sec);
    }

    fn create_elem_section(&mut self) {
        if self.indirect_functions.is_empty() {
            return;
        }
        let mut sec = SyntheticSection::new(SectionId::Element, "");
        write_uleb128(&mut sec.body, 1); // segment count
        write_uleb128(&mut sec.body, 0); // table index
        crate::encode::write_init_expr(
            &mut sec.body,
            &InitExpr::I32Const(INITIAL_TABLE_OFFSET as i32),
        );
        write_uleb128(&mut sec.body, self.indirect_functions.len() as u64);

        let mut table_index = INITIAL_TABLE_OFFSET;
        for &id in &self.indirect_functions {
            debug_assert_eq!(self.ctx.table_index(id), Some(table_index));
            let func_index = self.ctx.function_index(id).expect("indirect function has an index");
            write_uleb128(&mut sec.body, func_index as u64);
            table_index += 1;
        }
        self.push_synthetic(sec);
    }

    fn create_code_section(&mut self) {
        if self.input_functions.is_empty() {
            return;
        }
        debug!("create_code_section");
        let sec = CodeSection::new(self.input_functions.clone(), self.ctx);
        self.output_sections.push(OutputSection::Code(sec));
    }

    fn create_data_section(&mut self) {
        if self.segments.is_empty() {
            return;
        }
        debug!("create_data_section");
        let sec = DataSection::new(&self.segments);
        self.output_sections.push(OutputSection::Data(sec));
    }

    fn create_custom_sections(&mut self) {
        debug!("create_custom_sections");
        let names: Vec<String> = self.custom_section_inputs.keys().cloned().collect();
        for name in names {
            let inputs = self.custom_section_inputs[&name].clone();
            if let Some(&sym) = self.custom_section_symbols.get(&name) {
                let index = self.output_sections.len() as u32;
                if let SymbolKind::Section(s) = &mut self.ctx.symtab[sym].kind {
                    s.output_section_index = Some(index);
                }
            }
            let sec = CustomSection::new(name, inputs, self.ctx);
            self.output_sections.push(OutputSection::Custom(sec));
        }
    }

    fn create_sections(&mut self) {
        self.create_type_section();
        self.create_import_section();
        self.create_function_section();
        self.create_table_section();
        self.create_memory_section();
        self.create_global_section();
        self.create_export_section();
        self.create_elem_section();
        self.create_code_section();
        self.create_data_section();
        self.create_custom_sections();

        if self.ctx.config.relocatable {
            self.create_linking_section();
            self.create_reloc_sections();
        }
        if !self.ctx.config.strip_names() {
            self.create_name_section();
        }

        self.file_size = HEADER_SIZE;
        for sec in &mut self.output_sections {
            sec.set_offset(self.file_size);
            sec.finalize();
            self.file_size += sec.size();
        }
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    fn open_file(&mut self) -> Option<File> {
        let path = self.ctx.config.output_file.clone();
        info!("writing: {}", path.display());
        match File::create(&path) {
            Ok(f) => Some(f),
            Err(e) => {
                self.ctx
                    .diagnostics
                    .error(format!("failed to open {}: {}", path.display(), e));
                None
            }
        }
    }

    fn write_header(&self, buffer: &mut [u8]) {
        buffer[..4].copy_from_slice(&WASM_MAGIC);
        buffer[4..8].copy_from_slice(&WASM_VERSION.to_le_bytes());
    }

    /// Serialize every section into its disjoint slice of the buffer.
    /// Offsets and contents are frozen, so the writes are independent.
    fn write_sections(&self, buffer: &mut [u8]) {
        let emit = EmitContext {
            ctx: &*self.ctx,
            segments: &self.segments,
        };
        let mut jobs: Vec<(&mut [u8], &OutputSection)> = Vec::new();
        let mut rest = &mut buffer[HEADER_SIZE..];
        for sec in &self.output_sections {
            let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(sec.size());
            jobs.push((chunk, sec));
            rest = tail;
        }
        jobs.into_par_iter()
            .for_each(|(chunk, sec)| sec.write_to(chunk, &emit));
    }

    fn write_abi(&self, merger: &mut dyn AbiMerger) -> Result<(), WriteError> {
        if self.abis.is_empty() {
            return Ok(());
        }
        merger.seed(self.abis.last().expect("non-empty"))?;
        for abi in &self.abis {
            merger.fold(abi)?;
        }
        let path = abi_output_path(&self.ctx.config.output_file);
        info!("writing: {}", path.display());
        std::fs::write(&path, merger.render().as_bytes())?;
        Ok(())
    }
}

fn output_segment_name(merge: bool, name: &str) -> &str {
    if !merge {
        return name;
    }
    if name.starts_with(".text.") {
        return ".text";
    }
    if name.starts_with(".data.") {
        return ".data";
    }
    if name.starts_with(".bss.") {
        return ".bss";
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_segment_name() {
        assert_eq!(output_segment_name(true, ".data.foo"), ".data");
        assert_eq!(output_segment_name(true, ".text.bar"), ".text");
        assert_eq!(output_segment_name(true, ".bss.x"), ".bss");
        assert_eq!(output_segment_name(true, ".rodata"), ".rodata");
        assert_eq!(output_segment_name(false, ".data.foo"), ".data.foo");
    }
}
