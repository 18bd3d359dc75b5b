// LuaFrame - one activation record.
//
// Each frame owns its register file (sized by the prototype's max stack)
// so the whole call chain can be serialized frame by frame. The frame
// keeps the closure it executes: that supplies code, constants and the
// upvalue array, and keeps a tail-called callee reachable for snapshots.

use std::rc::Rc;

use crate::lua_value::{LuaValue, Varargs};
use crate::lua_vm::upvalue::{close_cell, UpValue, UpvalueCell};
use crate::lua_vm::LuaClosure;

pub struct LuaFrame {
    pub closure: Rc<LuaClosure>,
    pub pc: usize,
    /// Register file, length = max_stack_size.
    pub stack: Vec<LuaValue>,
    /// Live top for variadic splices: registers `[.., top - v.narg())`
    /// followed by `v` form the current open-ended value list.
    pub top: usize,
    /// Pending multi-result from the last open call.
    pub v: Varargs,
    /// The frame's `...` arguments.
    pub varargs: Varargs,
    /// Open upvalue cells minted for this frame, keyed by slot.
    /// At most one cell per slot.
    pub open_upvalues: Vec<(usize, UpvalueCell)>,
}

impl LuaFrame {
    /// FRESH entry: registers nil-filled, parameters written to
    /// `stack[0..num_params)`, overflow bundled as frame varargs.
    pub fn new(closure: Rc<LuaClosure>, args: Varargs) -> LuaFrame {
        let proto = closure.proto.clone();
        let num_params = proto.num_params as usize;
        let mut stack = vec![LuaValue::Nil; proto.max_stack_size as usize];
        for i in 0..num_params.min(stack.len()) {
            stack[i] = args.arg(i + 1);
        }
        let varargs = if proto.is_vararg != 0 {
            args.subargs(num_params + 1)
        } else {
            Varargs::None
        };
        LuaFrame {
            closure,
            pc: 0,
            stack,
            top: 0,
            v: Varargs::None,
            varargs,
            open_upvalues: Vec::new(),
        }
    }

    pub fn code_len(&self) -> usize {
        self.closure.proto.code.len()
    }

    /// Existing open cell for a slot, or a freshly minted one. Keeps the
    /// one-open-cell-per-slot invariant.
    pub fn find_upvalue(&mut self, level: usize, slot: usize) -> UpvalueCell {
        for (s, cell) in &self.open_upvalues {
            if *s == slot {
                return cell.clone();
            }
        }
        let cell = UpValue::open_cell(level, slot);
        self.open_upvalues.push((slot, cell.clone()));
        cell
    }

    /// Close every open cell with slot >= `from` (OP_JMP upvalue close).
    pub fn close_upvalues_from(&mut self, from: usize) {
        let registers = &self.stack;
        self.open_upvalues.retain(|(slot, cell)| {
            if *slot >= from {
                close_cell(cell, registers);
                false
            } else {
                true
            }
        });
    }

    /// Close everything; runs when the frame pops.
    pub fn close_all_upvalues(&mut self) {
        self.close_upvalues_from(0);
    }

    /// Force the dispatch position onto the terminal RETURN epilogue so
    /// the next step unwinds this frame (stop protocol).
    pub fn force_return_pc(&mut self) {
        let len = self.code_len();
        if len > 0 {
            self.pc = len - 1;
        }
    }
}

impl std::fmt::Debug for LuaFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaFrame")
            .field("source", &self.closure.proto.source)
            .field("pc", &self.pc)
            .field("registers", &self.stack.len())
            .field("top", &self.top)
            .field("open_upvalues", &self.open_upvalues.len())
            .finish()
    }
}
