//! Byte-level encoders for the module binary.
//!
//! All writers append to an in-memory `Vec<u8>` and cannot fail. Relocation
//! patching uses the fixed-width (5-byte LEB / 4-byte LE) forms so a patch
//! never changes the length of the surrounding code.

use crate::format::{
    Export, Global, GlobalType, Import, ImportKind, InitExpr, Limits, Signature,
    ELEM_TYPE_FUNCREF, FUNC_TYPE_FORM, LIMITS_FLAG_HAS_MAX,
};

pub fn write_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub fn write_u32_le(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(bytes);
}

/// Unsigned LEB128.
pub fn write_uleb128(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Signed LEB128.
pub fn write_sleb128(buf: &mut Vec<u8>, mut value: i64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if !done {
            byte |= 0x80;
        }
        buf.push(byte);
        if done {
            break;
        }
    }
}

/// Number of bytes `write_uleb128` produces for `value`.
pub fn uleb128_len(mut value: u64) -> usize {
    let mut len = 1;
    value >>= 7;
    while value != 0 {
        len += 1;
        value >>= 7;
    }
    len
}

/// Length-prefixed UTF-8 string.
pub fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_uleb128(buf, s.len() as u64);
    write_bytes(buf, s.as_bytes());
}

pub fn str_len(s: &str) -> usize {
    uleb128_len(s.len() as u64) + s.len()
}

/// Overwrite 5 bytes at `offset` with a padded unsigned LEB128 of `value`.
pub fn patch_uleb128(buf: &mut [u8], offset: usize, value: u32) {
    let mut v = value;
    for i in 0..5 {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if i < 4 {
            byte |= 0x80;
        }
        buf[offset + i] = byte;
    }
}

/// Overwrite 5 bytes at `offset` with a padded signed LEB128 of `value`.
pub fn patch_sleb128(buf: &mut [u8], offset: usize, value: i32) {
    let mut v = value as i64;
    for i in 0..5 {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if i < 4 {
            byte |= 0x80;
        }
        buf[offset + i] = byte;
    }
}

/// Overwrite 4 bytes at `offset` with a little-endian `value`.
pub fn patch_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn write_signature(buf: &mut Vec<u8>, sig: &Signature) {
    write_u8(buf, FUNC_TYPE_FORM);
    write_uleb128(buf, sig.params.len() as u64);
    for p in &sig.params {
        write_u8(buf, p.code());
    }
    match sig.result {
        Some(r) => {
            write_uleb128(buf, 1);
            write_u8(buf, r.code());
        }
        None => write_uleb128(buf, 0),
    }
}

pub fn write_limits(buf: &mut Vec<u8>, limits: &Limits) {
    write_uleb128(buf, limits.flags as u64);
    write_uleb128(buf, limits.initial as u64);
    if limits.flags & LIMITS_FLAG_HAS_MAX != 0 {
        write_uleb128(buf, limits.maximum as u64);
    }
}

pub fn write_table_type(buf: &mut Vec<u8>, limits: &Limits) {
    write_u8(buf, ELEM_TYPE_FUNCREF);
    write_limits(buf, limits);
}

pub fn write_global_type(buf: &mut Vec<u8>, ty: &GlobalType) {
    write_u8(buf, ty.value_type.code());
    write_u8(buf, ty.mutable as u8);
}

pub fn write_init_expr(buf: &mut Vec<u8>, expr: &InitExpr) {
    use crate::format::opcode;
    match expr {
        InitExpr::I32Const(v) => {
            write_u8(buf, opcode::I32_CONST);
            write_sleb128(buf, *v as i64);
        }
        InitExpr::I64Const(v) => {
            write_u8(buf, opcode::I64_CONST);
            write_sleb128(buf, *v);
        }
        InitExpr::GetGlobal(idx) => {
            write_u8(buf, 0x23);
            write_uleb128(buf, *idx as u64);
        }
    }
    write_u8(buf, opcode::END);
}

pub fn write_global(buf: &mut Vec<u8>, global: &Global) {
    write_global_type(buf, &global.ty);
    write_init_expr(buf, &global.init);
}

pub fn write_import(buf: &mut Vec<u8>, import: &Import) {
    write_str(buf, crate::format::IMPORT_MODULE);
    write_str(buf, &import.field);
    match &import.kind {
        ImportKind::Function { sig_index } => {
            write_u8(buf, 0);
            write_uleb128(buf, *sig_index as u64);
        }
        ImportKind::Table { limits } => {
            write_u8(buf, 1);
            write_table_type(buf, limits);
        }
        ImportKind::Memory { limits } => {
            write_u8(buf, 2);
            write_limits(buf, limits);
        }
        ImportKind::Global { ty } => {
            write_u8(buf, 3);
            write_global_type(buf, ty);
        }
    }
}

pub fn write_export(buf: &mut Vec<u8>, export: &Export) {
    write_str(buf, &export.name);
    write_u8(buf, export.kind as u8);
    write_uleb128(buf, export.index as u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ValueType;

    #[test]
    fn test_uleb128() {
        let mut buf = Vec::new();
        write_uleb128(&mut buf, 0);
        write_uleb128(&mut buf, 127);
        write_uleb128(&mut buf, 128);
        write_uleb128(&mut buf, 624485);
        assert_eq!(buf, [0x00, 0x7f, 0x80, 0x01, 0xe5, 0x8e, 0x26]);
    }

    #[test]
    fn test_sleb128() {
        let mut buf = Vec::new();
        write_sleb128(&mut buf, 0);
        assert_eq!(buf, [0x00]);

        buf.clear();
        write_sleb128(&mut buf, -1);
        assert_eq!(buf, [0x7f]);

        buf.clear();
        write_sleb128(&mut buf, 63);
        assert_eq!(buf, [0x3f]);

        buf.clear();
        write_sleb128(&mut buf, 64);
        assert_eq!(buf, [0xc0, 0x00]);

        buf.clear();
        write_sleb128(&mut buf, -123456);
        assert_eq!(buf, [0xc0, 0xbb, 0x78]);
    }

    #[test]
    fn test_uleb128_len() {
        for v in [0u64, 1, 127, 128, 16383, 16384, u32::MAX as u64] {
            let mut buf = Vec::new();
            write_uleb128(&mut buf, v);
            assert_eq!(buf.len(), uleb128_len(v));
        }
    }

    #[test]
    fn test_patch_uleb128() {
        let mut buf = vec![0u8; 7];
        patch_uleb128(&mut buf, 1, 1);
        assert_eq!(&buf[1..6], &[0x81, 0x80, 0x80, 0x80, 0x00]);
        patch_uleb128(&mut buf, 1, 624485);
        assert_eq!(&buf[1..6], &[0xe5, 0x8e, 0xa6, 0x80, 0x00]);
    }

    #[test]
    fn test_patch_sleb128_negative() {
        let mut buf = vec![0u8; 5];
        patch_sleb128(&mut buf, 0, -1);
        assert_eq!(buf, [0xff, 0xff, 0xff, 0xff, 0x7f]);
    }

    #[test]
    fn test_write_str() {
        let mut buf = Vec::new();
        write_str(&mut buf, "env");
        assert_eq!(buf, [0x03, b'e', b'n', b'v']);
        assert_eq!(str_len("env"), 4);
    }

    #[test]
    fn test_write_signature() {
        let mut buf = Vec::new();
        write_signature(
            &mut buf,
            &Signature::new(vec![ValueType::I32], Some(ValueType::I64)),
        );
        assert_eq!(buf, [0x60, 0x01, 0x7f, 0x01, 0x7e]);
    }

    #[test]
    fn test_write_init_expr() {
        let mut buf = Vec::new();
        write_init_expr(&mut buf, &InitExpr::I32Const(1024));
        assert_eq!(buf, [0x41, 0x80, 0x08, 0x0b]);
    }
}
