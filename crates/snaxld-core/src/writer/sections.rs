//! Output sections and their serialization.
//!
//! Synthetic sections buffer their body in memory because the section
//! frame is length-prefixed; code, data, and custom sections compute
//! their layout up front and serialize straight from the input chunks,
//! applying relocations on the way out. Every section writes only inside
//! its own `[offset, offset + size)` range of the output buffer, which is
//! what makes the final write safe to parallelize.

use crate::context::LinkContext;
use crate::encode::{
    self, patch_sleb128, patch_u32_le, patch_uleb128, str_len, uleb128_len, write_init_expr,
    write_str, write_uleb128,
};
use crate::format::{InitExpr, RelocKind, SectionId};
use crate::input::{FileId, ObjectFile, Relocation};
use crate::symbol::ChunkRef;

/// Frozen state a section body is a pure function of.
#[derive(Clone, Copy)]
pub struct EmitContext<'a> {
    pub ctx: &'a LinkContext,
    pub segments: &'a [OutputSegment],
}

impl<'a> EmitContext<'a> {
    /// Resolve the value a relocation patches in.
    pub fn reloc_value(&self, file: &ObjectFile, reloc: &Relocation) -> u32 {
        if reloc.kind == RelocKind::TypeIndexLeb {
            let mapped = file.type_map[reloc.index as usize];
            debug_assert!(mapped.is_some(), "type reloc against unregistered type");
            return mapped.unwrap_or(0);
        }
        let sym = file.symbols[reloc.index as usize];
        match reloc.kind {
            RelocKind::FunctionIndexLeb => self.ctx.function_index(sym).unwrap_or(0),
            RelocKind::TableIndexSleb | RelocKind::TableIndexI32 => {
                self.ctx.table_index(sym).unwrap_or(0)
            }
            RelocKind::GlobalIndexLeb => self.ctx.global_index(sym).unwrap_or(0),
            RelocKind::MemoryAddrLeb | RelocKind::MemoryAddrSleb | RelocKind::MemoryAddrI32 => {
                self.ctx.data_address(sym).wrapping_add(reloc.addend as u32)
            }
            RelocKind::TypeIndexLeb => unreachable!(),
        }
    }
}

/// Patch the relocations of one chunk into `buf`. `base` is the position
/// of the chunk's payload within `buf`.
fn apply_relocations(
    buf: &mut [u8],
    base: usize,
    relocs: &[Relocation],
    file: &ObjectFile,
    emit: &EmitContext,
) {
    for reloc in relocs {
        let value = emit.reloc_value(file, reloc);
        let at = base + reloc.offset as usize;
        match reloc.kind {
            RelocKind::FunctionIndexLeb
            | RelocKind::TypeIndexLeb
            | RelocKind::GlobalIndexLeb
            | RelocKind::MemoryAddrLeb => patch_uleb128(buf, at, value),
            RelocKind::TableIndexSleb | RelocKind::MemoryAddrSleb => {
                patch_sleb128(buf, at, value as i32)
            }
            RelocKind::TableIndexI32 | RelocKind::MemoryAddrI32 => patch_u32_le(buf, at, value),
        }
    }
}

/// Serialize one relocation entry for a `reloc.*` section. `offset` has
/// already been rebased to the output section's contents.
fn write_relocation(
    buf: &mut Vec<u8>,
    reloc: &Relocation,
    offset: u32,
    file: &ObjectFile,
    ctx: &LinkContext,
) {
    write_uleb128(buf, reloc.kind as u64);
    write_uleb128(buf, offset as u64);
    let index = if reloc.kind == RelocKind::TypeIndexLeb {
        file.type_map[reloc.index as usize].unwrap_or(0)
    } else {
        // Relocatable output references the linking section's symbol table.
        let sym = file.symbols[reloc.index as usize];
        ctx.symtab[sym].output_symbol_index.unwrap_or(0)
    };
    write_uleb128(buf, index as u64);
    if reloc.kind.has_addend() {
        encode::write_sleb128(buf, reloc.addend as i64);
    }
}

/// A group of input segments emitted as one output data segment.
#[derive(Debug)]
pub struct OutputSegment {
    pub name: String,
    pub index: u32,
    pub alignment: u32,
    pub size: u32,
    pub start_va: u32,
    /// (file, input-segment index) pairs in arrival order.
    pub inputs: Vec<(FileId, u32)>,
}

impl OutputSegment {
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
            alignment: 1,
            size: 0,
            start_va: 0,
            inputs: Vec::new(),
        }
    }
}

/// A buffered section framed as `id, leb(len), [name,] body`.
#[derive(Debug)]
pub struct SyntheticSection {
    pub id: SectionId,
    pub name: String,
    pub body: Vec<u8>,
    offset: usize,
    header: Vec<u8>,
}

impl SyntheticSection {
    pub fn new(id: SectionId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            body: Vec::new(),
            offset: 0,
            header: Vec::new(),
        }
    }

    fn payload_len(&self) -> usize {
        let name_len = if self.name.is_empty() {
            0
        } else {
            str_len(&self.name)
        };
        name_len + self.body.len()
    }

    fn finalize(&mut self) {
        self.header.push(self.id as u8);
        let payload_len = self.payload_len() as u64;
        write_uleb128(&mut self.header, payload_len);
    }

    fn size(&self) -> usize {
        self.header.len() + self.payload_len()
    }

    fn write_to(&self, out: &mut [u8]) {
        let mut buf = Vec::with_capacity(self.size());
        buf.extend_from_slice(&self.header);
        if !self.name.is_empty() {
            write_str(&mut buf, &self.name);
        }
        buf.extend_from_slice(&self.body);
        out[..buf.len()].copy_from_slice(&buf);
    }
}

/// The code section: a count followed by size-prefixed function bodies in
/// final index order, synthetic chunks first.
#[derive(Debug)]
pub struct CodeSection {
    funcs: Vec<ChunkRef>,
    /// Offset of each body within the section contents.
    body_offsets: Vec<u32>,
    contents_size: usize,
    offset: usize,
    header: Vec<u8>,
}

impl CodeSection {
    pub fn new(funcs: Vec<ChunkRef>, ctx: &LinkContext) -> Self {
        let mut contents_size = uleb128_len(funcs.len() as u64);
        let mut body_offsets = Vec::with_capacity(funcs.len());
        for chunk in &funcs {
            let body = &ctx.function_chunk(*chunk).body;
            contents_size += uleb128_len(body.len() as u64);
            body_offsets.push(contents_size as u32);
            contents_size += body.len();
        }
        Self {
            funcs,
            body_offsets,
            contents_size,
            offset: 0,
            header: Vec::new(),
        }
    }

    fn write_to(&self, out: &mut [u8], emit: &EmitContext) {
        let mut buf = Vec::with_capacity(self.header.len() + self.contents_size);
        buf.extend_from_slice(&self.header);
        let contents_base = self.header.len();
        write_uleb128(&mut buf, self.funcs.len() as u64);
        for chunk in &self.funcs {
            let body = &emit.ctx.function_chunk(*chunk).body;
            write_uleb128(&mut buf, body.len() as u64);
            buf.extend_from_slice(body);
        }
        for (i, chunk) in self.funcs.iter().enumerate() {
            if let ChunkRef::File { file, index } = chunk {
                let file = emit.ctx.file(*file);
                let func = &file.functions[*index as usize];
                let base = contents_base + self.body_offsets[i] as usize;
                apply_relocations(&mut buf, base, &func.relocations, file, emit);
            }
        }
        out[..buf.len()].copy_from_slice(&buf);
    }

    fn num_relocations(&self, ctx: &LinkContext) -> usize {
        self.funcs
            .iter()
            .map(|chunk| match chunk {
                ChunkRef::File { file, index } => {
                    ctx.file(*file).functions[*index as usize].relocations.len()
                }
                ChunkRef::Synthetic(_) => 0,
            })
            .sum()
    }

    fn write_relocations(&self, buf: &mut Vec<u8>, ctx: &LinkContext) {
        for (i, chunk) in self.funcs.iter().enumerate() {
            if let ChunkRef::File { file, index } = chunk {
                let file = ctx.file(*file);
                let func = &file.functions[*index as usize];
                for reloc in &func.relocations {
                    write_relocation(buf, reloc, self.body_offsets[i] + reloc.offset, file, ctx);
                }
            }
        }
    }
}

/// The data section: one wasm data segment per output segment, each with
/// an `i32.const` placement expression.
#[derive(Debug)]
pub struct DataSection {
    /// Offset of each output segment's payload within section contents.
    payload_offsets: Vec<u32>,
    contents_size: usize,
    offset: usize,
    header: Vec<u8>,
}

impl DataSection {
    pub fn new(segments: &[OutputSegment]) -> Self {
        let mut contents_size = uleb128_len(segments.len() as u64);
        let mut payload_offsets = Vec::with_capacity(segments.len());
        for seg in segments {
            let mut head = Vec::new();
            write_uleb128(&mut head, 0); // linear memory index
            write_init_expr(&mut head, &InitExpr::I32Const(seg.start_va as i32));
            write_uleb128(&mut head, seg.size as u64);
            contents_size += head.len();
            payload_offsets.push(contents_size as u32);
            contents_size += seg.size as usize;
        }
        Self {
            payload_offsets,
            contents_size,
            offset: 0,
            header: Vec::new(),
        }
    }

    fn write_to(&self, out: &mut [u8], emit: &EmitContext) {
        let mut buf = Vec::with_capacity(self.header.len() + self.contents_size);
        buf.extend_from_slice(&self.header);
        write_uleb128(&mut buf, emit.segments.len() as u64);
        for seg in emit.segments {
            write_uleb128(&mut buf, 0);
            write_init_expr(&mut buf, &InitExpr::I32Const(seg.start_va as i32));
            write_uleb128(&mut buf, seg.size as u64);
            let payload_start = buf.len();
            debug_assert_eq!(
                payload_start,
                self.header.len() + self.payload_offsets[seg.index as usize] as usize
            );
            buf.resize(payload_start + seg.size as usize, 0);
            for &(fid, si) in &seg.inputs {
                let file = emit.ctx.file(fid);
                let input = &file.segments[si as usize];
                let base = payload_start + input.output_offset as usize;
                buf[base..base + input.data.len()].copy_from_slice(&input.data);
                apply_relocations(&mut buf, base, &input.relocations, file, emit);
            }
        }
        out[..buf.len()].copy_from_slice(&buf);
    }

    fn num_relocations(&self, emit: &EmitContext) -> usize {
        emit.segments
            .iter()
            .flat_map(|seg| seg.inputs.iter())
            .map(|&(fid, si)| emit.ctx.file(fid).segments[si as usize].relocations.len())
            .sum()
    }

    fn write_relocations(&self, buf: &mut Vec<u8>, emit: &EmitContext) {
        for seg in emit.segments {
            let payload = self.payload_offsets[seg.index as usize];
            for &(fid, si) in &seg.inputs {
                let file = emit.ctx.file(fid);
                let input = &file.segments[si as usize];
                for reloc in &input.relocations {
                    write_relocation(
                        buf,
                        reloc,
                        payload + input.output_offset + reloc.offset,
                        file,
                        emit.ctx,
                    );
                }
            }
        }
    }
}

/// A custom section copied (concatenated) from input object files.
#[derive(Debug)]
pub struct CustomSection {
    pub name: String,
    inputs: Vec<(FileId, u32)>,
    /// Offset of each input's data within the concatenated payload.
    input_offsets: Vec<u32>,
    data_size: usize,
    offset: usize,
    header: Vec<u8>,
}

impl CustomSection {
    pub fn new(name: impl Into<String>, inputs: Vec<(FileId, u32)>, ctx: &LinkContext) -> Self {
        let mut data_size = 0usize;
        let mut input_offsets = Vec::with_capacity(inputs.len());
        for &(fid, si) in &inputs {
            input_offsets.push(data_size as u32);
            data_size += ctx.file(fid).custom_sections[si as usize].data.len();
        }
        Self {
            name: name.into(),
            inputs,
            input_offsets,
            data_size,
            offset: 0,
            header: Vec::new(),
        }
    }

    fn payload_len(&self) -> usize {
        str_len(&self.name) + self.data_size
    }

    fn write_to(&self, out: &mut [u8], emit: &EmitContext) {
        let mut buf = Vec::with_capacity(self.header.len() + self.payload_len());
        buf.extend_from_slice(&self.header);
        write_str(&mut buf, &self.name);
        let data_base = buf.len();
        for (i, &(fid, si)) in self.inputs.iter().enumerate() {
            let file = emit.ctx.file(fid);
            let input = &file.custom_sections[si as usize];
            let base = data_base + self.input_offsets[i] as usize;
            buf.extend_from_slice(&input.data);
            apply_relocations(&mut buf, base, &input.relocations, file, emit);
        }
        out[..buf.len()].copy_from_slice(&buf);
    }

    fn num_relocations(&self, ctx: &LinkContext) -> usize {
        self.inputs
            .iter()
            .map(|&(fid, si)| {
                ctx.file(fid).custom_sections[si as usize].relocations.len()
            })
            .sum()
    }

    fn write_relocations(&self, buf: &mut Vec<u8>, ctx: &LinkContext) {
        for (i, &(fid, si)) in self.inputs.iter().enumerate() {
            let file = ctx.file(fid);
            let input = &file.custom_sections[si as usize];
            for reloc in &input.relocations {
                write_relocation(buf, reloc, self.input_offsets[i] + reloc.offset, file, ctx);
            }
        }
    }
}

/// One section of the output module.
#[derive(Debug)]
pub enum OutputSection {
    Synthetic(SyntheticSection),
    Code(CodeSection),
    Data(DataSection),
    Custom(CustomSection),
}

impl OutputSection {
    pub fn section_id(&self) -> SectionId {
        match self {
            OutputSection::Synthetic(s) => s.id,
            OutputSection::Code(_) => SectionId::Code,
            OutputSection::Data(_) => SectionId::Data,
            OutputSection::Custom(_) => SectionId::Custom,
        }
    }

    pub fn custom_name(&self) -> Option<&str> {
        match self {
            OutputSection::Custom(c) => Some(&c.name),
            OutputSection::Synthetic(s) if s.id == SectionId::Custom => Some(&s.name),
            _ => None,
        }
    }

    pub fn set_offset(&mut self, offset: usize) {
        match self {
            OutputSection::Synthetic(s) => s.offset = offset,
            OutputSection::Code(s) => s.offset = offset,
            OutputSection::Data(s) => s.offset = offset,
            OutputSection::Custom(s) => s.offset = offset,
        }
    }

    /// Build the section frame; contents are already fixed.
    pub fn finalize(&mut self) {
        match self {
            OutputSection::Synthetic(s) => s.finalize(),
            OutputSection::Code(s) => {
                s.header.push(SectionId::Code as u8);
                write_uleb128(&mut s.header, s.contents_size as u64);
            }
            OutputSection::Data(s) => {
                s.header.push(SectionId::Data as u8);
                write_uleb128(&mut s.header, s.contents_size as u64);
            }
            OutputSection::Custom(s) => {
                s.header.push(SectionId::Custom as u8);
                let payload_len = s.payload_len() as u64;
                write_uleb128(&mut s.header, payload_len);
            }
        }
    }

    pub fn size(&self) -> usize {
        match self {
            OutputSection::Synthetic(s) => s.size(),
            OutputSection::Code(s) => s.header.len() + s.contents_size,
            OutputSection::Data(s) => s.header.len() + s.contents_size,
            OutputSection::Custom(s) => s.header.len() + s.payload_len(),
        }
    }

    pub fn offset(&self) -> usize {
        match self {
            OutputSection::Synthetic(s) => s.offset,
            OutputSection::Code(s) => s.offset,
            OutputSection::Data(s) => s.offset,
            OutputSection::Custom(s) => s.offset,
        }
    }

    /// Serialize into `out`, a slice of exactly `self.size()` bytes.
    pub fn write_to(&self, out: &mut [u8], emit: &EmitContext) {
        debug_assert_eq!(out.len(), self.size());
        match self {
            OutputSection::Synthetic(s) => s.write_to(out),
            OutputSection::Code(s) => s.write_to(out, emit),
            OutputSection::Data(s) => s.write_to(out, emit),
            OutputSection::Custom(s) => s.write_to(out, emit),
        }
    }

    pub fn num_relocations(&self, emit: &EmitContext) -> usize {
        match self {
            OutputSection::Synthetic(_) => 0,
            OutputSection::Code(s) => s.num_relocations(emit.ctx),
            OutputSection::Data(s) => s.num_relocations(emit),
            OutputSection::Custom(s) => s.num_relocations(emit.ctx),
        }
    }

    pub fn write_relocations(&self, buf: &mut Vec<u8>, emit: &EmitContext) {
        match self {
            OutputSection::Synthetic(_) => {
                unreachable!("relocations only supported for code, data, or custom sections")
            }
            OutputSection::Code(s) => s.write_relocations(buf, emit.ctx),
            OutputSection::Data(s) => s.write_relocations(buf, emit),
            OutputSection::Custom(s) => s.write_relocations(buf, emit.ctx),
        }
    }
}

/// A length-prefixed subsection of the linking or name section.
#[derive(Debug)]
pub struct SubSection {
    ty: u32,
    pub body: Vec<u8>,
}

impl SubSection {
    pub fn new(ty: u32) -> Self {
        Self {
            ty,
            body: Vec::new(),
        }
    }

    pub fn write_to(self, parent: &mut Vec<u8>) {
        write_uleb128(parent, self.ty as u64);
        write_uleb128(parent, self.body.len() as u64);
        parent.extend_from_slice(&self.body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_section_frame() {
        let mut sec = SyntheticSection::new(SectionId::Type, "");
        sec.body.extend_from_slice(&[0x01, 0x60, 0x00, 0x00]);
        let mut wrapped = OutputSection::Synthetic(sec);
        wrapped.finalize();
        assert_eq!(wrapped.size(), 6);
        let emit_segments: Vec<OutputSegment> = Vec::new();
        let ctx = LinkContext::default();
        let emit = EmitContext {
            ctx: &ctx,
            segments: &emit_segments,
        };
        let mut out = vec![0u8; wrapped.size()];
        wrapped.write_to(&mut out, &emit);
        assert_eq!(out, [0x01, 0x04, 0x01, 0x60, 0x00, 0x00]);
    }

    #[test]
    fn test_custom_synthetic_includes_name() {
        let mut sec = SyntheticSection::new(SectionId::Custom, "linking");
        sec.body.push(0x01);
        let mut wrapped = OutputSection::Synthetic(sec);
        wrapped.finalize();
        // id + leb(size) + (leb(7) + "linking") + body
        assert_eq!(wrapped.size(), 1 + 1 + 8 + 1);
    }

    #[test]
    fn test_subsection_frame() {
        let mut parent = Vec::new();
        let mut sub = SubSection::new(8);
        sub.body.extend_from_slice(&[0xaa, 0xbb]);
        sub.write_to(&mut parent);
        assert_eq!(parent, [0x08, 0x02, 0xaa, 0xbb]);
    }
}
