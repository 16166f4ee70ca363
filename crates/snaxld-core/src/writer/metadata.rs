//! Linker metadata sections: "linking", "name", and "reloc.*".
//!
//! The linking and reloc sections are only produced for relocatable
//! output, so a re-link can consume the module as an input object. The
//! name section is emitted unless debug info is stripped.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::encode::{write_str, write_u8, write_uleb128};
use crate::format::{linking, SectionId};
use crate::input::FileId;
use crate::symbol::{ChunkRef, Symbol, SymbolKind};

use super::sections::{EmitContext, SubSection, SyntheticSection};
use super::Writer;

fn wasm_flags(sym: &Symbol) -> u32 {
    let mut flags = 0;
    if sym.local {
        flags |= linking::FLAG_LOCAL;
    }
    if sym.weak {
        flags |= linking::FLAG_WEAK;
    }
    if sym.hidden {
        flags |= linking::FLAG_HIDDEN;
    }
    if sym.is_undefined() {
        flags |= linking::FLAG_UNDEFINED;
    }
    flags
}

impl<'a> Writer<'a> {
    /// Assign output-symbol indices for the linking section's symbol
    /// table: object files in registration order, each file's own
    /// symbols in their order. Section symbols are only included when a
    /// custom section of that name survives, and one index is shared per
    /// section name.
    pub(super) fn assign_symtab(&mut self) {
        if !self.ctx.config.relocatable {
            return;
        }
        let ctx = &mut *self.ctx;
        let mut section_indices: HashMap<String, u32> = HashMap::new();
        let mut symbol_index = self.symtab_entries.len() as u32;

        for fid in 0..ctx.files.len() {
            debug!(file = %ctx.files[fid].name, "symtab entries");
            for i in 0..ctx.files[fid].symbols.len() {
                let id = ctx.files[fid].symbols[i];
                if ctx.symtab[id].file != Some(FileId(fid as u32)) {
                    continue;
                }
                if let SymbolKind::Section(s) = &ctx.symtab[id].kind {
                    let name = s.section.clone();
                    if !self.custom_section_inputs.contains_key(&name) {
                        continue;
                    }
                    if let Some(&existing) = section_indices.get(&name) {
                        ctx.symtab[id].output_symbol_index = Some(existing);
                        continue;
                    }
                    section_indices.insert(name.clone(), symbol_index);
                    self.custom_section_symbols.insert(name, id);
                    ctx.symtab[id].live = true;
                }
                // Relocatable output performs no GC, so everything here
                // must be live.
                debug_assert!(ctx.symtab[id].live);
                ctx.symtab[id].output_symbol_index = Some(symbol_index);
                symbol_index += 1;
                self.symtab_entries.push(id);
            }
        }
    }

    pub(super) fn create_linking_section(&mut self) {
        let mut sec = SyntheticSection::new(SectionId::Custom, "linking");
        write_uleb128(&mut sec.body, linking::METADATA_VERSION as u64);
        let ctx = &*self.ctx;

        if !self.symtab_entries.is_empty() {
            let mut sub = SubSection::new(linking::SYMBOL_TABLE);
            write_uleb128(&mut sub.body, self.symtab_entries.len() as u64);

            for &id in &self.symtab_entries {
                let sym = &ctx.symtab[id];
                let flags = wasm_flags(sym);
                match &sym.kind {
                    SymbolKind::Function(_) => {
                        write_u8(&mut sub.body, linking::SYMTAB_FUNCTION);
                        write_uleb128(&mut sub.body, flags as u64);
                        write_uleb128(&mut sub.body, ctx.function_index(id).unwrap_or(0) as u64);
                        if sym.defined {
                            write_str(&mut sub.body, &sym.name);
                        }
                    }
                    SymbolKind::Global(_) => {
                        write_u8(&mut sub.body, linking::SYMTAB_GLOBAL);
                        write_uleb128(&mut sub.body, flags as u64);
                        write_uleb128(&mut sub.body, ctx.global_index(id).unwrap_or(0) as u64);
                        if sym.defined {
                            write_str(&mut sub.body, &sym.name);
                        }
                    }
                    SymbolKind::Data(d) => {
                        write_u8(&mut sub.body, linking::SYMTAB_DATA);
                        write_uleb128(&mut sub.body, flags as u64);
                        write_str(&mut sub.body, &sym.name);
                        if sym.defined {
                            if let Some(loc) = d.location {
                                let input =
                                    &ctx.files[loc.file.index()].segments[loc.segment as usize];
                                write_uleb128(
                                    &mut sub.body,
                                    input.output_segment.unwrap_or(0) as u64,
                                );
                                write_uleb128(
                                    &mut sub.body,
                                    (input.output_offset + loc.offset) as u64,
                                );
                                write_uleb128(&mut sub.body, loc.size as u64);
                            }
                        }
                    }
                    SymbolKind::Section(s) => {
                        write_u8(&mut sub.body, linking::SYMTAB_SECTION);
                        write_uleb128(&mut sub.body, flags as u64);
                        write_uleb128(&mut sub.body, s.output_section_index.unwrap_or(0) as u64);
                    }
                }
            }
            sub.write_to(&mut sec.body);
        }

        if !self.segments.is_empty() {
            let mut sub = SubSection::new(linking::SEGMENT_INFO);
            write_uleb128(&mut sub.body, self.segments.len() as u64);
            for seg in &self.segments {
                write_str(&mut sub.body, &seg.name);
                write_uleb128(&mut sub.body, seg.alignment as u64);
                write_uleb128(&mut sub.body, 0); // flags
            }
            sub.write_to(&mut sec.body);
        }

        if !self.init_functions.is_empty() {
            let mut sub = SubSection::new(linking::INIT_FUNCS);
            write_uleb128(&mut sub.body, self.init_functions.len() as u64);
            for entry in &self.init_functions {
                write_uleb128(&mut sub.body, entry.priority as u64);
                write_uleb128(
                    &mut sub.body,
                    ctx.symtab[entry.sym].output_symbol_index.unwrap_or(0) as u64,
                );
            }
            sub.write_to(&mut sec.body);
        }

        // COMDAT groups, keyed (and emitted) by name.
        let mut comdats: BTreeMap<String, Vec<(u8, u32)>> = BTreeMap::new();
        for &chunk in &self.input_functions {
            if let ChunkRef::File { file, index } = chunk {
                let func = &ctx.files[file.index()].functions[index as usize];
                if !func.comdat.is_empty() {
                    comdats
                        .entry(func.comdat.clone())
                        .or_default()
                        .push((linking::COMDAT_FUNCTION, func.function_index.unwrap_or(0)));
                }
            }
        }
        for seg in &self.segments {
            if seg.inputs.is_empty() {
                continue;
            }
            let (fid, si) = seg.inputs[0];
            let comdat = &ctx.files[fid.index()].segments[si as usize].comdat;
            // All inputs grouped into one output segment must agree.
            debug_assert!(seg
                .inputs
                .iter()
                .all(|&(f, s)| &ctx.files[f.index()].segments[s as usize].comdat == comdat));
            if !comdat.is_empty() {
                comdats
                    .entry(comdat.clone())
                    .or_default()
                    .push((linking::COMDAT_DATA, seg.index));
            }
        }
        if !comdats.is_empty() {
            let mut sub = SubSection::new(linking::COMDAT_INFO);
            write_uleb128(&mut sub.body, comdats.len() as u64);
            for (name, entries) in &comdats {
                write_str(&mut sub.body, name);
                write_uleb128(&mut sub.body, 0); // flags for future use
                write_uleb128(&mut sub.body, entries.len() as u64);
                for &(kind, index) in entries {
                    write_u8(&mut sub.body, kind);
                    write_uleb128(&mut sub.body, index as u64);
                }
            }
            sub.write_to(&mut sec.body);
        }

        self.push_synthetic(sec);
    }

    /// One FUNCTION subsection of `(index, name)` pairs in function-index
    /// order: imported functions first, then defined ones. The chunk's
    /// debug name wins over the symbol name; unnamed chunks are skipped.
    pub(super) fn create_name_section(&mut self) {
        let ctx = &*self.ctx;
        let mut num_names = 0usize;
        for &id in &self.imported_symbols {
            if ctx.symtab[id].as_function().is_some() {
                num_names += 1;
            }
        }
        for &chunk in &self.input_functions {
            if !ctx.function_chunk(chunk).name.is_empty() {
                num_names += 1;
            }
        }
        if num_names == 0 {
            return;
        }

        let mut sec = SyntheticSection::new(SectionId::Custom, "name");
        let mut sub = SubSection::new(linking::NAMES_FUNCTION);
        write_uleb128(&mut sub.body, num_names as u64);

        for &id in &self.imported_symbols {
            let sym = &ctx.symtab[id];
            if sym.as_function().is_some() {
                write_uleb128(&mut sub.body, ctx.function_index(id).unwrap_or(0) as u64);
                write_str(&mut sub.body, &sym.name);
            }
        }
        for &chunk in &self.input_functions {
            let func = ctx.function_chunk(chunk);
            if func.name.is_empty() {
                continue;
            }
            write_uleb128(&mut sub.body, func.function_index.unwrap_or(0) as u64);
            let name = if !func.debug_name.is_empty() {
                &func.debug_name
            } else {
                &func.name
            };
            write_str(&mut sub.body, name);
        }

        sub.write_to(&mut sec.body);
        self.push_synthetic(sec);
    }

    /// One `reloc.*` custom section per output section that carries
    /// relocations, referencing it by output-section index.
    pub(super) fn create_reloc_sections(&mut self) {
        debug!("create_reloc_sections");
        let mut new_sections = Vec::new();
        {
            let emit = EmitContext {
                ctx: &*self.ctx,
                segments: &self.segments,
            };
            for (i, sec) in self.output_sections.iter().enumerate() {
                let count = sec.num_relocations(&emit);
                if count == 0 {
                    continue;
                }
                let name = match sec.section_id() {
                    SectionId::Data => "reloc.DATA".to_string(),
                    SectionId::Code => "reloc.CODE".to_string(),
                    SectionId::Custom => {
                        format!("reloc.{}", sec.custom_name().unwrap_or_default())
                    }
                    _ => unreachable!(
                        "relocations only supported for code, data, or custom sections"
                    ),
                };
                let mut out = SyntheticSection::new(SectionId::Custom, name);
                write_uleb128(&mut out.body, i as u64);
                write_uleb128(&mut out.body, count as u64);
                sec.write_relocations(&mut out.body, &emit);
                new_sections.push(out);
            }
        }
        for sec in new_sections {
            self.push_synthetic(sec);
        }
    }
}
