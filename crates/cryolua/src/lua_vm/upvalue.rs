// Upvalue cell - a mutable slot shared by every closure that captured the
// same variable. Open cells alias a live register through (level, slot)
// indices resolved against the execution stack; closing copies the value
// in and severs the alias. Closing twice is a no-op.

use std::cell::RefCell;
use std::rc::Rc;

use crate::lua_value::LuaValue;

pub type UpvalueCell = Rc<RefCell<UpValue>>;

#[derive(Debug, Clone)]
pub enum UpValue {
    /// Aliases `frames[level].stack[slot]`.
    Open { level: usize, slot: usize },
    /// Owns its value.
    Closed(LuaValue),
}

impl UpValue {
    pub fn open_cell(level: usize, slot: usize) -> UpvalueCell {
        Rc::new(RefCell::new(UpValue::Open { level, slot }))
    }

    pub fn closed_cell(value: LuaValue) -> UpvalueCell {
        Rc::new(RefCell::new(UpValue::Closed(value)))
    }

    pub fn is_open(&self) -> bool {
        matches!(self, UpValue::Open { .. })
    }
}

/// Close a cell against the register file of the frame that owns it.
/// Idempotent: an already-closed cell keeps its value.
pub fn close_cell(cell: &UpvalueCell, registers: &[LuaValue]) {
    let mut uv = cell.borrow_mut();
    if let UpValue::Open { slot, .. } = *uv {
        let value = registers.get(slot).cloned().unwrap_or(LuaValue::Nil);
        *uv = UpValue::Closed(value);
    }
}

/// Read through a cell, resolving an open alias against the live chain.
pub(crate) fn upvalue_get(handle: &crate::lua_vm::StackHandle, cell: &UpvalueCell) -> LuaValue {
    let uv = cell.borrow();
    match &*uv {
        UpValue::Open { level, slot } => handle.borrow().register(*level, *slot),
        UpValue::Closed(v) => v.clone(),
    }
}

/// Write through a cell, resolving an open alias against the live chain.
pub(crate) fn upvalue_set(
    handle: &crate::lua_vm::StackHandle,
    cell: &UpvalueCell,
    value: LuaValue,
) {
    let target = match &*cell.borrow() {
        UpValue::Open { level, slot } => Some((*level, *slot)),
        UpValue::Closed(_) => None,
    };
    match target {
        Some((level, slot)) => handle.borrow_mut().set_register(level, slot, value),
        None => *cell.borrow_mut() = UpValue::Closed(value),
    }
}
