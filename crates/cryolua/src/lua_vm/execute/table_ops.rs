// Table access with __index / __newindex chasing. Handler functions run
// synchronously through the regular call machinery; handler tables keep
// the chase going, bounded so a cyclic metatable chain cannot hang the
// interpreter.

use crate::lua_value::{LuaValue, Varargs};
use crate::lua_vm::execute::call::call_value;
use crate::lua_vm::{CallMode, Flow, LuaError, LuaResult, LuaVM, StackHandle};

const MAX_META_CHAIN: usize = 100;

/// `t[k]` honoring metatables.
pub fn index_value(
    vm: &LuaVM,
    handle: &StackHandle,
    table: LuaValue,
    key: LuaValue,
) -> LuaResult<LuaValue> {
    let mut target = table;
    for _ in 0..MAX_META_CHAIN {
        match &target {
            LuaValue::Table(t) => {
                let raw = t.borrow().raw_get(&key);
                if !raw.is_nil() {
                    return Ok(raw);
                }
                let handler = metatable_field(&target, "__index");
                match handler {
                    LuaValue::Nil => return Ok(LuaValue::Nil),
                    LuaValue::Function(_) => {
                        let results = meta_call(
                            vm,
                            handle,
                            handler,
                            Varargs::many(vec![target.clone(), key]),
                        )?;
                        return Ok(results.first());
                    }
                    next => target = next,
                }
            }
            LuaValue::UserData(_) => {
                let handler = metatable_field(&target, "__index");
                match handler {
                    LuaValue::Nil => {
                        return Err(index_error(&target));
                    }
                    LuaValue::Function(_) => {
                        let results = meta_call(
                            vm,
                            handle,
                            handler,
                            Varargs::many(vec![target.clone(), key]),
                        )?;
                        return Ok(results.first());
                    }
                    next => target = next,
                }
            }
            other => return Err(index_error(other)),
        }
    }
    Err(LuaError::new("'__index' chain too long; possible loop"))
}

/// `t[k] = v` honoring metatables.
pub fn newindex_value(
    vm: &LuaVM,
    handle: &StackHandle,
    table: LuaValue,
    key: LuaValue,
    value: LuaValue,
) -> LuaResult<()> {
    let mut target = table;
    for _ in 0..MAX_META_CHAIN {
        match &target {
            LuaValue::Table(t) => {
                let has_raw = !t.borrow().raw_get(&key).is_nil();
                if has_raw {
                    return t.borrow_mut().raw_set(key, value);
                }
                let handler = metatable_field(&target, "__newindex");
                match handler {
                    LuaValue::Nil => {
                        return t.borrow_mut().raw_set(key, value);
                    }
                    LuaValue::Function(_) => {
                        meta_call(
                            vm,
                            handle,
                            handler,
                            Varargs::many(vec![target.clone(), key, value]),
                        )?;
                        return Ok(());
                    }
                    next => target = next,
                }
            }
            LuaValue::UserData(_) => {
                let handler = metatable_field(&target, "__newindex");
                match handler {
                    LuaValue::Nil => return Err(index_error(&target)),
                    LuaValue::Function(_) => {
                        meta_call(
                            vm,
                            handle,
                            handler,
                            Varargs::many(vec![target.clone(), key, value]),
                        )?;
                        return Ok(());
                    }
                    next => target = next,
                }
            }
            other => return Err(index_error(other)),
        }
    }
    Err(LuaError::new("'__newindex' chain too long; possible loop"))
}

/// The `__call` handler of a table or userdata, if any.
pub fn call_metamethod(value: &LuaValue) -> Option<LuaValue> {
    let handler = metatable_field(value, "__call");
    match handler {
        LuaValue::Nil => None,
        h => Some(h),
    }
}

/// Raw lookup of an event handler in a value's metatable.
pub fn metatable_field(value: &LuaValue, event: &str) -> LuaValue {
    let mt = match value {
        LuaValue::Table(t) => t.borrow().metatable(),
        LuaValue::UserData(u) => u.metatable.borrow().clone(),
        _ => None,
    };
    match mt {
        Some(LuaValue::Table(mt)) => mt.borrow().raw_get(&LuaValue::string(event)),
        _ => LuaValue::Nil,
    }
}

/// Invoke a metamethod handler synchronously. The nested activation gets
/// its own level so the FRESH/RESUME bookkeeping stays consistent.
fn meta_call(
    vm: &LuaVM,
    handle: &StackHandle,
    handler: LuaValue,
    args: Varargs,
) -> LuaResult<Varargs> {
    handle.borrow_mut().current_level += 1;
    let flow = call_value(vm, handle, handler, args, CallMode::Sync);
    handle.borrow_mut().current_level -= 1;
    match flow? {
        Flow::Values(v) => Ok(v),
        _ => Err(LuaError::new("metamethod may not suspend")),
    }
}

fn index_error(value: &LuaValue) -> LuaError {
    LuaError::new(format!("attempt to index a {} value", value.type_name()))
}
