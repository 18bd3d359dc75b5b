// Prototype - immutable compiled chunk.
// Built once by the loader (or by hand in tests), never mutated afterward.

use std::rc::Rc;

use smol_str::SmolStr;

use crate::lua_value::LuaValue;

#[derive(Debug)]
pub struct Prototype {
    /// 32-bit instruction words.
    pub code: Vec<u32>,
    /// Constant pool.
    pub constants: Vec<LuaValue>,
    /// Nested function prototypes.
    pub protos: Vec<Rc<Prototype>>,
    /// Capture descriptors for this function's upvalues.
    pub upvalue_descs: Vec<UpvalueDesc>,
    pub num_params: u8,
    pub is_vararg: u8,
    pub max_stack_size: u8,
    /// Chunk name for diagnostics.
    pub source: SmolStr,
    pub line_defined: u32,
    pub last_line_defined: u32,
    /// Line number per instruction, parallel to `code`.
    pub line_info: Vec<u32>,
    /// Local variable debug records.
    pub locals: Vec<LocalVar>,
}

/// Where a closure's upvalue is captured from: the enclosing frame's
/// registers (`instack`) or the enclosing closure's own upvalue array.
#[derive(Debug, Clone)]
pub struct UpvalueDesc {
    pub name: SmolStr,
    pub instack: bool,
    pub idx: u8,
}

#[derive(Debug, Clone)]
pub struct LocalVar {
    pub name: SmolStr,
    pub start_pc: u32,
    pub end_pc: u32,
}

impl Prototype {
    pub fn new(source: impl Into<SmolStr>) -> Prototype {
        Prototype {
            code: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            upvalue_descs: Vec::new(),
            num_params: 0,
            is_vararg: 0,
            max_stack_size: 2,
            source: source.into(),
            line_defined: 0,
            last_line_defined: 0,
            line_info: Vec::new(),
            locals: Vec::new(),
        }
    }

    /// Source line for a pc, when line info was kept.
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        self.line_info.get(pc).copied()
    }

    /// `source:line` tag used to enrich runtime errors.
    pub fn fileline(&self, pc: usize) -> String {
        match self.line_at(pc) {
            Some(line) => format!("{}:{}", self.source, line),
            None => self.source.to_string(),
        }
    }
}
