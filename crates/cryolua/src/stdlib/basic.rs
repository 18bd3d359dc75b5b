// Basic library (_G global functions)
// Implements: print, type, tostring, tonumber, assert, error, next,
// pairs, ipairs, select, rawget, rawset, rawequal, rawlen, getmetatable,
// setmetatable.
//
// Every binding is a named host function in the VM registry, so a
// restored snapshot that captured one of them (e.g. the `next` value
// returned by `pairs`) rebinds to the live implementation.

use crate::lua_value::{LuaValue, Varargs};
use crate::lua_vm::{HostFunction, HostReturn, HostScope, LuaError, LuaResult, LuaVM};

pub fn open(vm: &LuaVM) {
    vm.register_global_host(HostFunction::new("print", lua_print));
    vm.register_global_host(HostFunction::new("type", lua_type));
    vm.register_global_host(HostFunction::new("tostring", lua_tostring));
    vm.register_global_host(HostFunction::new("tonumber", lua_tonumber));
    vm.register_global_host(HostFunction::new("assert", lua_assert));
    vm.register_global_host(HostFunction::new("error", lua_error));
    vm.register_global_host(HostFunction::new("next", lua_next));
    vm.register_global_host(HostFunction::new("pairs", lua_pairs));
    vm.register_global_host(HostFunction::new("ipairs", lua_ipairs));
    vm.register_global_host(HostFunction::new("select", lua_select));
    vm.register_global_host(HostFunction::new("rawget", lua_rawget));
    vm.register_global_host(HostFunction::new("rawset", lua_rawset));
    vm.register_global_host(HostFunction::new("rawequal", lua_rawequal));
    vm.register_global_host(HostFunction::new("rawlen", lua_rawlen));
    vm.register_global_host(HostFunction::new("getmetatable", lua_getmetatable));
    vm.register_global_host(HostFunction::new("setmetatable", lua_setmetatable));
    // Iterator backing ipairs; registry-only, scripts reach it through
    // the values ipairs returns.
    vm.register_host(HostFunction::new("inext", lua_inext));
}

fn values(v: Varargs) -> LuaResult<HostReturn> {
    Ok(HostReturn::Values(v))
}

fn one(v: LuaValue) -> LuaResult<HostReturn> {
    values(Varargs::One(v))
}

fn arg_table(scope: &HostScope, n: usize, what: &str) -> LuaResult<LuaValue> {
    let v = scope.args.arg(n);
    if v.as_table().is_none() {
        return Err(LuaError::new(format!(
            "bad argument #{} to '{}' (table expected, got {})",
            n,
            what,
            v.type_name()
        )));
    }
    Ok(v)
}

/// print(...) - write values to the VM output sink
fn lua_print(scope: &mut HostScope) -> LuaResult<HostReturn> {
    let n = scope.args.narg();
    let mut line = String::new();
    for i in 1..=n {
        if i > 1 {
            line.push('\t');
        }
        line.push_str(&scope.args.arg(i).display_string());
    }
    scope.vm.write_line(&line);
    values(Varargs::None)
}

/// type(v) - type name of a value
fn lua_type(scope: &mut HostScope) -> LuaResult<HostReturn> {
    if scope.args.narg() == 0 {
        return Err(LuaError::new(
            "bad argument #1 to 'type' (value expected)",
        ));
    }
    one(LuaValue::string(scope.args.first().type_name()))
}

/// tostring(v)
fn lua_tostring(scope: &mut HostScope) -> LuaResult<HostReturn> {
    one(LuaValue::string(scope.args.first().display_string()))
}

/// tonumber(v [, base])
fn lua_tonumber(scope: &mut HostScope) -> LuaResult<HostReturn> {
    let v = scope.args.first();
    if scope.args.narg() >= 2 {
        let base = scope.args.arg(2).to_integer().ok_or_else(|| {
            LuaError::new("bad argument #2 to 'tonumber' (number expected)")
        })?;
        if !(2..=36).contains(&base) {
            return Err(LuaError::new(
                "bad argument #2 to 'tonumber' (base out of range)",
            ));
        }
        let Some(s) = v.as_str() else {
            return Err(LuaError::new(format!(
                "bad argument #1 to 'tonumber' (string expected, got {})",
                v.type_name()
            )));
        };
        return match i64::from_str_radix(s.trim(), base as u32) {
            Ok(i) => one(LuaValue::Integer(i)),
            Err(_) => one(LuaValue::Nil),
        };
    }
    match v.to_numeric() {
        Some(n) => one(n),
        None => one(LuaValue::Nil),
    }
}

/// assert(v [, message]) - raise when v is false or nil
fn lua_assert(scope: &mut HostScope) -> LuaResult<HostReturn> {
    if !scope.args.first().to_boolean() {
        let message = match scope.args.arg(2) {
            LuaValue::Nil => "assertion failed!".to_string(),
            m => m.display_string(),
        };
        return Err(LuaError::new(message));
    }
    values(scope.args.clone())
}

/// error(message [, level])
fn lua_error(scope: &mut HostScope) -> LuaResult<HostReturn> {
    let message = scope.args.first().display_string();
    let level = scope.args.arg(2).to_integer().unwrap_or(1) as i32;
    Err(LuaError::with_level(message, level))
}

/// next(t [, key]) - stateless table traversal
fn lua_next(scope: &mut HostScope) -> LuaResult<HostReturn> {
    let t = arg_table(scope, 1, "next")?;
    let key = scope.args.arg(2);
    let table = t.as_table().unwrap().borrow();
    match table.next(&key)? {
        Some((k, v)) => values(Varargs::many(vec![k, v])),
        None => one(LuaValue::Nil),
    }
}

/// pairs(t) -> next, t, nil
fn lua_pairs(scope: &mut HostScope) -> LuaResult<HostReturn> {
    let t = arg_table(scope, 1, "pairs")?;
    let next_fn = scope
        .vm
        .host_lookup("next")
        .map(LuaValue::host_function)
        .unwrap_or(LuaValue::Nil);
    values(Varargs::many(vec![next_fn, t, LuaValue::Nil]))
}

/// ipairs(t) -> inext, t, 0
fn lua_ipairs(scope: &mut HostScope) -> LuaResult<HostReturn> {
    let t = arg_table(scope, 1, "ipairs")?;
    let iter = scope
        .vm
        .host_lookup("inext")
        .map(LuaValue::host_function)
        .unwrap_or(LuaValue::Nil);
    values(Varargs::many(vec![iter, t, LuaValue::Integer(0)]))
}

/// inext(t, i) - the ipairs step
fn lua_inext(scope: &mut HostScope) -> LuaResult<HostReturn> {
    let t = arg_table(scope, 1, "inext")?;
    let i = scope.args.arg(2).to_integer().unwrap_or(0) + 1;
    let v = t.as_table().unwrap().borrow().raw_geti(i);
    if v.is_nil() {
        one(LuaValue::Nil)
    } else {
        values(Varargs::many(vec![LuaValue::Integer(i), v]))
    }
}

/// select('#', ...) or select(n, ...)
fn lua_select(scope: &mut HostScope) -> LuaResult<HostReturn> {
    let selector = scope.args.first();
    let rest = scope.args.subargs(2);
    if selector.as_str() == Some("#") {
        return one(LuaValue::Integer(rest.narg() as i64));
    }
    let n = selector.to_integer().ok_or_else(|| {
        LuaError::new("bad argument #1 to 'select' (number expected)")
    })?;
    if n < 0 {
        let total = rest.narg() as i64;
        let from = total + n + 1;
        if from < 1 {
            return Err(LuaError::new(
                "bad argument #1 to 'select' (index out of range)",
            ));
        }
        return values(rest.subargs(from as usize));
    }
    if n == 0 {
        return Err(LuaError::new(
            "bad argument #1 to 'select' (index out of range)",
        ));
    }
    values(rest.subargs(n as usize))
}

/// rawget(t, k)
fn lua_rawget(scope: &mut HostScope) -> LuaResult<HostReturn> {
    let t = arg_table(scope, 1, "rawget")?;
    let k = scope.args.arg(2);
    let v = t.as_table().unwrap().borrow().raw_get(&k);
    one(v)
}

/// rawset(t, k, v) -> t
fn lua_rawset(scope: &mut HostScope) -> LuaResult<HostReturn> {
    let t = arg_table(scope, 1, "rawset")?;
    let k = scope.args.arg(2);
    let v = scope.args.arg(3);
    t.as_table().unwrap().borrow_mut().raw_set(k, v)?;
    one(t)
}

/// rawequal(a, b)
fn lua_rawequal(scope: &mut HostScope) -> LuaResult<HostReturn> {
    let eq = scope.args.arg(1).lua_eq(&scope.args.arg(2));
    one(LuaValue::Boolean(eq))
}

/// rawlen(v) - length without metamethods
fn lua_rawlen(scope: &mut HostScope) -> LuaResult<HostReturn> {
    match scope.args.first() {
        LuaValue::Table(t) => one(LuaValue::Integer(t.borrow().length())),
        LuaValue::String(s) => one(LuaValue::Integer(s.len() as i64)),
        other => Err(LuaError::new(format!(
            "table or string expected, got {}",
            other.type_name()
        ))),
    }
}

/// getmetatable(t) - honors the __metatable guard
fn lua_getmetatable(scope: &mut HostScope) -> LuaResult<HostReturn> {
    let v = scope.args.first();
    let mt = match &v {
        LuaValue::Table(t) => t.borrow().metatable(),
        LuaValue::UserData(u) => u.metatable.borrow().clone(),
        _ => None,
    };
    match mt {
        None => one(LuaValue::Nil),
        Some(mt_value) => {
            if let Some(mt_table) = mt_value.as_table() {
                let guard = mt_table
                    .borrow()
                    .raw_get(&LuaValue::string("__metatable"));
                if !guard.is_nil() {
                    return one(guard);
                }
            }
            one(mt_value)
        }
    }
}

/// setmetatable(t, mt) -> t
fn lua_setmetatable(scope: &mut HostScope) -> LuaResult<HostReturn> {
    let t = arg_table(scope, 1, "setmetatable")?;
    let mt = scope.args.arg(2);
    let new_mt = match &mt {
        LuaValue::Nil => None,
        LuaValue::Table(_) => Some(mt.clone()),
        other => {
            return Err(LuaError::new(format!(
                "bad argument #2 to 'setmetatable' (nil or table expected, got {})",
                other.type_name()
            )));
        }
    };
    let table = t.as_table().unwrap();
    let protected = match table.borrow().metatable() {
        Some(LuaValue::Table(mt)) => !mt
            .borrow()
            .raw_get(&LuaValue::string("__metatable"))
            .is_nil(),
        _ => false,
    };
    if protected {
        return Err(LuaError::new("cannot change a protected metatable"));
    }
    table.borrow_mut().set_metatable(new_mt);
    one(t)
}
