// Binary chunk loader/dumper for the standard Lua 5.2 precompiled format
// (the output of luac 5.2): "\x1bLua", version 0x52, little-endian,
// 4-byte ints, 8-byte doubles. The dumper writes the same layout with
// 8-byte size_t, so chunks round-trip and the disassembler has input.

use std::rc::Rc;

use smol_str::SmolStr;
use thiserror::Error;

use crate::lua_value::{LocalVar, LuaValue, Prototype, UpvalueDesc};

const SIGNATURE: &[u8; 4] = b"\x1bLua";
const VERSION: u8 = 0x52;
const FORMAT: u8 = 0;
const TAIL: &[u8; 6] = b"\x19\x93\r\n\x1a\n";

const TAG_NIL: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_NUMBER: u8 = 3;
const TAG_STRING: u8 = 4;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("not a precompiled chunk (bad signature)")]
    BadSignature,
    #[error("unsupported bytecode version 0x{0:02x} (expected 0x52)")]
    BadVersion(u8),
    #[error("unsupported chunk layout: {0}")]
    Unsupported(&'static str),
    #[error("truncated chunk")]
    Truncated,
    #[error("bad constant tag {0}")]
    BadConstantTag(u8),
}

/// Read a precompiled chunk into a prototype tree. `name` stands in when
/// the chunk carries no source name.
pub fn load_chunk(bytes: &[u8], name: &str) -> Result<Prototype, ChunkError> {
    let mut r = Reader::new(bytes);

    let sig = r.take(4)?;
    if sig != SIGNATURE {
        return Err(ChunkError::BadSignature);
    }
    let version = r.byte()?;
    if version != VERSION {
        return Err(ChunkError::BadVersion(version));
    }
    if r.byte()? != FORMAT {
        return Err(ChunkError::Unsupported("non-standard format"));
    }
    if r.byte()? != 1 {
        return Err(ChunkError::Unsupported("big-endian chunk"));
    }
    if r.byte()? != 4 {
        return Err(ChunkError::Unsupported("sizeof(int) != 4"));
    }
    let size_t_len = r.byte()?;
    if size_t_len != 4 && size_t_len != 8 {
        return Err(ChunkError::Unsupported("sizeof(size_t)"));
    }
    r.size_t_len = size_t_len as usize;
    if r.byte()? != 4 {
        return Err(ChunkError::Unsupported("sizeof(Instruction) != 4"));
    }
    if r.byte()? != 8 {
        return Err(ChunkError::Unsupported("sizeof(lua_Number) != 8"));
    }
    if r.byte()? != 0 {
        return Err(ChunkError::Unsupported("integral lua_Number"));
    }
    if r.take(6)? != TAIL {
        return Err(ChunkError::Unsupported("corrupted tail"));
    }

    r.function(name)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    size_t_len: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader {
            data,
            pos: 0,
            size_t_len: 8,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ChunkError> {
        if self.pos + n > self.data.len() {
            return Err(ChunkError::Truncated);
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn byte(&mut self) -> Result<u8, ChunkError> {
        Ok(self.take(1)?[0])
    }

    fn int(&mut self) -> Result<u32, ChunkError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn size_t(&mut self) -> Result<usize, ChunkError> {
        if self.size_t_len == 4 {
            Ok(self.int()? as usize)
        } else {
            let b = self.take(8)?;
            Ok(u64::from_le_bytes([
                b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            ]) as usize)
        }
    }

    fn number(&mut self) -> Result<f64, ChunkError> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// luac string: size_t length including the trailing NUL; zero means
    /// no string.
    fn string(&mut self) -> Result<Option<SmolStr>, ChunkError> {
        let len = self.size_t()?;
        if len == 0 {
            return Ok(None);
        }
        let bytes = self.take(len)?;
        let text = &bytes[..len - 1];
        Ok(Some(SmolStr::new(String::from_utf8_lossy(text))))
    }

    fn function(&mut self, default_source: &str) -> Result<Prototype, ChunkError> {
        let line_defined = self.int()?;
        let last_line_defined = self.int()?;
        let num_params = self.byte()?;
        let is_vararg = self.byte()?;
        let max_stack_size = self.byte()?;

        let n_code = self.int()? as usize;
        let mut code = Vec::with_capacity(n_code);
        for _ in 0..n_code {
            code.push(self.int()?);
        }

        let n_const = self.int()? as usize;
        let mut constants = Vec::with_capacity(n_const);
        for _ in 0..n_const {
            let tag = self.byte()?;
            constants.push(match tag {
                TAG_NIL => LuaValue::Nil,
                TAG_BOOLEAN => LuaValue::Boolean(self.byte()? != 0),
                TAG_NUMBER => {
                    let n = self.number()?;
                    // Integral constants keep exact integer arithmetic.
                    if n.trunc() == n && n.abs() < 1e15 {
                        LuaValue::Integer(n as i64)
                    } else {
                        LuaValue::Number(n)
                    }
                }
                TAG_STRING => match self.string()? {
                    Some(s) => LuaValue::String(s),
                    None => LuaValue::string(""),
                },
                other => return Err(ChunkError::BadConstantTag(other)),
            });
        }

        let n_protos = self.int()? as usize;
        let mut protos = Vec::with_capacity(n_protos);
        for _ in 0..n_protos {
            protos.push(Rc::new(self.function(default_source)?));
        }

        let n_upvals = self.int()? as usize;
        let mut upvalue_descs = Vec::with_capacity(n_upvals);
        for _ in 0..n_upvals {
            let instack = self.byte()? != 0;
            let idx = self.byte()?;
            upvalue_descs.push(UpvalueDesc {
                name: SmolStr::default(),
                instack,
                idx,
            });
        }

        // Debug section.
        let source = self
            .string()?
            .unwrap_or_else(|| SmolStr::new(default_source));
        let n_lines = self.int()? as usize;
        let mut line_info = Vec::with_capacity(n_lines);
        for _ in 0..n_lines {
            line_info.push(self.int()?);
        }
        let n_locals = self.int()? as usize;
        let mut locals = Vec::with_capacity(n_locals);
        for _ in 0..n_locals {
            let name = self.string()?.unwrap_or_default();
            let start_pc = self.int()?;
            let end_pc = self.int()?;
            locals.push(LocalVar {
                name,
                start_pc,
                end_pc,
            });
        }
        let n_upval_names = self.int()? as usize;
        for i in 0..n_upval_names {
            let name = self.string()?.unwrap_or_default();
            if let Some(desc) = upvalue_descs.get_mut(i) {
                desc.name = name;
            }
        }

        Ok(Prototype {
            code,
            constants,
            protos,
            upvalue_descs,
            num_params,
            is_vararg,
            max_stack_size,
            source,
            line_defined,
            last_line_defined,
            line_info,
            locals,
        })
    }
}

/// Write a prototype tree in the same precompiled layout (little-endian,
/// 8-byte size_t).
pub fn dump_chunk(proto: &Prototype) -> Vec<u8> {
    let mut w = Vec::new();
    w.extend_from_slice(SIGNATURE);
    w.push(VERSION);
    w.push(FORMAT);
    w.push(1); // little-endian
    w.push(4); // sizeof(int)
    w.push(8); // sizeof(size_t)
    w.push(4); // sizeof(Instruction)
    w.push(8); // sizeof(lua_Number)
    w.push(0); // numbers are floats
    w.extend_from_slice(TAIL);
    dump_function(&mut w, proto);
    w
}

fn dump_int(w: &mut Vec<u8>, v: u32) {
    w.extend_from_slice(&v.to_le_bytes());
}

fn dump_size_t(w: &mut Vec<u8>, v: usize) {
    w.extend_from_slice(&(v as u64).to_le_bytes());
}

fn dump_string(w: &mut Vec<u8>, s: Option<&str>) {
    match s {
        None => dump_size_t(w, 0),
        Some(s) => {
            dump_size_t(w, s.len() + 1);
            w.extend_from_slice(s.as_bytes());
            w.push(0);
        }
    }
}

fn dump_function(w: &mut Vec<u8>, proto: &Prototype) {
    dump_int(w, proto.line_defined);
    dump_int(w, proto.last_line_defined);
    w.push(proto.num_params);
    w.push(proto.is_vararg);
    w.push(proto.max_stack_size);

    dump_int(w, proto.code.len() as u32);
    for inst in &proto.code {
        dump_int(w, *inst);
    }

    dump_int(w, proto.constants.len() as u32);
    for k in &proto.constants {
        match k {
            LuaValue::Nil => w.push(TAG_NIL),
            LuaValue::Boolean(b) => {
                w.push(TAG_BOOLEAN);
                w.push(*b as u8);
            }
            LuaValue::Integer(i) => {
                w.push(TAG_NUMBER);
                w.extend_from_slice(&(*i as f64).to_le_bytes());
            }
            LuaValue::Number(n) => {
                w.push(TAG_NUMBER);
                w.extend_from_slice(&n.to_le_bytes());
            }
            LuaValue::String(s) => {
                w.push(TAG_STRING);
                dump_string(w, Some(s.as_str()));
            }
            // The loader never produces aggregate constants.
            other => {
                w.push(TAG_STRING);
                dump_string(w, Some(&other.display_string()));
            }
        }
    }

    dump_int(w, proto.protos.len() as u32);
    for child in &proto.protos {
        dump_function(w, child);
    }

    dump_int(w, proto.upvalue_descs.len() as u32);
    for desc in &proto.upvalue_descs {
        w.push(desc.instack as u8);
        w.push(desc.idx);
    }

    // Debug section.
    dump_string(w, Some(proto.source.as_str()));
    dump_int(w, proto.line_info.len() as u32);
    for line in &proto.line_info {
        dump_int(w, *line);
    }
    dump_int(w, proto.locals.len() as u32);
    for local in &proto.locals {
        dump_string(w, Some(local.name.as_str()));
        dump_int(w, local.start_pc);
        dump_int(w, local.end_pc);
    }
    dump_int(w, proto.upvalue_descs.len() as u32);
    for desc in &proto.upvalue_descs {
        dump_string(w, Some(desc.name.as_str()));
    }
}
