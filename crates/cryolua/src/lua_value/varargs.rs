// Varargs - multiple value bundle passed between calls
// Shaped so arg(i), first() and subargs(i) stay O(1): a bundle is either
// empty, a single value, a shared list with a start offset, or a leading
// list chained onto a tail bundle (the shape produced when register
// contents are combined with a pending multi-result).

use std::rc::Rc;

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult};

#[derive(Debug, Clone, Default)]
pub enum Varargs {
    #[default]
    None,
    One(LuaValue),
    /// Shared value list, logically starting at `1 + start`.
    Many(Rc<[LuaValue]>, usize),
    /// Leading list (from `start`) followed by a tail bundle.
    Chain(Rc<[LuaValue]>, usize, Rc<Varargs>),
}

impl Varargs {
    pub fn none() -> Varargs {
        Varargs::None
    }

    pub fn one(value: LuaValue) -> Varargs {
        Varargs::One(value)
    }

    /// Bundle a plain vector of values.
    pub fn many(values: Vec<LuaValue>) -> Varargs {
        match values.len() {
            0 => Varargs::None,
            1 => Varargs::One(values.into_iter().next().unwrap()),
            _ => Varargs::Many(values.into(), 0),
        }
    }

    /// Bundle `values` followed by an existing tail bundle.
    pub fn of(values: Vec<LuaValue>, tail: Varargs) -> Varargs {
        if values.is_empty() {
            return tail;
        }
        if tail.is_none() {
            return Varargs::many(values);
        }
        Varargs::Chain(values.into(), 0, Rc::new(tail))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Varargs::None)
    }

    /// Number of values in the bundle.
    pub fn narg(&self) -> usize {
        match self {
            Varargs::None => 0,
            Varargs::One(_) => 1,
            Varargs::Many(list, start) => list.len() - start,
            Varargs::Chain(list, start, tail) => list.len() - start + tail.narg(),
        }
    }

    /// The i-th value, 1-based; nil when out of range.
    pub fn arg(&self, i: usize) -> LuaValue {
        if i == 0 {
            return LuaValue::Nil;
        }
        match self {
            Varargs::None => LuaValue::Nil,
            Varargs::One(v) => {
                if i == 1 {
                    v.clone()
                } else {
                    LuaValue::Nil
                }
            }
            Varargs::Many(list, start) => {
                list.get(start + i - 1).cloned().unwrap_or(LuaValue::Nil)
            }
            Varargs::Chain(list, start, tail) => {
                let head = list.len() - start;
                if i <= head {
                    list[start + i - 1].clone()
                } else {
                    tail.arg(i - head)
                }
            }
        }
    }

    pub fn first(&self) -> LuaValue {
        self.arg(1)
    }

    /// The sub-bundle starting at the i-th value, 1-based.
    pub fn subargs(&self, i: usize) -> Varargs {
        if i <= 1 {
            return self.clone();
        }
        match self {
            Varargs::None | Varargs::One(_) => Varargs::None,
            Varargs::Many(list, start) => {
                let start = start + i - 1;
                if start >= list.len() {
                    Varargs::None
                } else {
                    Varargs::Many(list.clone(), start)
                }
            }
            Varargs::Chain(list, start, tail) => {
                let head = list.len() - start;
                if i - 1 < head {
                    Varargs::Chain(list.clone(), start + i - 1, tail.clone())
                } else {
                    tail.subargs(i - head)
                }
            }
        }
    }

    /// Flatten into a plain vector (host boundary, snapshot records).
    pub fn to_vec(&self) -> Vec<LuaValue> {
        let n = self.narg();
        let mut out = Vec::with_capacity(n);
        for i in 1..=n {
            out.push(self.arg(i));
        }
        out
    }
}

/// Left-to-right string accumulator used by `OP_CONCAT`.
///
/// Pushing a value that is neither a string nor a number raises the usual
/// concatenation error.
pub struct Buffer {
    data: String,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            data: String::new(),
        }
    }

    pub fn push(&mut self, value: &LuaValue) -> LuaResult<()> {
        match value.concat_fragment() {
            Some(s) => {
                self.data.push_str(&s);
                Ok(())
            }
            None => Err(LuaError::new(format!(
                "attempt to concatenate a {} value",
                value.type_name()
            ))),
        }
    }

    pub fn concat(&mut self, other: Buffer) {
        self.data.push_str(&other.data);
    }

    /// Flatten the accumulated text into a string value.
    pub fn value(self) -> LuaValue {
        LuaValue::string(self.data)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}
