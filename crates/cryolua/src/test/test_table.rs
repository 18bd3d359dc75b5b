/// Table semantics: raw access, borders, traversal, metatables, SETLIST
/// and the generic for loop.
use std::cell::RefCell;
use std::rc::Rc;

use crate::lua_value::{LuaTable, LuaValue};
use crate::lua_vm::{HostFunction, HostReturn, LuaVM, OpCode};
use crate::test::{abc, abx, asbx, rk, ProtoBuilder};

#[test]
fn test_raw_access_and_array_migration() {
    let mut t = LuaTable::new(0, 0);
    t.raw_seti(2, LuaValue::Integer(20));
    t.raw_seti(1, LuaValue::Integer(10));
    // Key 2 migrates out of the hash part once 1 fills the gap.
    assert_eq!(t.length(), 2);
    assert_eq!(t.raw_geti(2), LuaValue::Integer(20));

    t.raw_set(LuaValue::string("k"), LuaValue::Boolean(true))
        .unwrap();
    assert_eq!(t.raw_get(&LuaValue::string("k")), LuaValue::Boolean(true));

    // Integral float keys collapse onto integer keys.
    assert_eq!(t.raw_get(&LuaValue::Number(1.0)), LuaValue::Integer(10));

    // Removing the tail shrinks the border.
    t.raw_seti(2, LuaValue::Nil);
    assert_eq!(t.length(), 1);
}

#[test]
fn test_invalid_keys() {
    let mut t = LuaTable::new(0, 0);
    assert!(t
        .raw_set(LuaValue::Nil, LuaValue::Integer(1))
        .unwrap_err()
        .message
        .contains("table index is nil"));
    assert!(t
        .raw_set(LuaValue::Number(f64::NAN), LuaValue::Integer(1))
        .unwrap_err()
        .message
        .contains("table index is NaN"));
}

#[test]
fn test_next_enumerates_everything() {
    let mut t = LuaTable::new(0, 0);
    t.raw_seti(1, LuaValue::Integer(10));
    t.raw_seti(2, LuaValue::Integer(20));
    t.raw_set(LuaValue::string("a"), LuaValue::Integer(30))
        .unwrap();
    t.raw_set(LuaValue::string("b"), LuaValue::Integer(40))
        .unwrap();

    let mut seen = Vec::new();
    let mut key = LuaValue::Nil;
    while let Some((k, v)) = t.next(&key).unwrap() {
        seen.push((k.clone(), v));
        key = k;
    }
    assert_eq!(seen.len(), 4);
    let total: i64 = seen
        .iter()
        .map(|(_, v)| match v {
            LuaValue::Integer(i) => *i,
            _ => 0,
        })
        .sum();
    assert_eq!(total, 100);

    let err = t.next(&LuaValue::string("missing")).unwrap_err();
    assert!(err.message.contains("invalid key to 'next'"));
}

/// NEWTABLE + SETLIST builds the array part; LEN reads the border.
#[test]
fn test_setlist_and_len() {
    let mut b = ProtoBuilder::new("setlist.lua", 5);
    let k10 = b.constant(LuaValue::Integer(10));
    let k20 = b.constant(LuaValue::Integer(20));
    let k30 = b.constant(LuaValue::Integer(30));
    let proto = b
        .code(vec![
            abc(OpCode::NewTable, 0, 3, 0),
            abx(OpCode::LoadK, 1, k10),
            abx(OpCode::LoadK, 2, k20),
            abx(OpCode::LoadK, 3, k30),
            abc(OpCode::SetList, 0, 3, 1),
            abc(OpCode::Len, 1, 0, 0),
            abc(OpCode::Return, 1, 2, 0),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    let vm = LuaVM::new();
    let result = vm.call(&vm.load_proto(proto), vec![]).unwrap();
    assert_eq!(result.first(), LuaValue::Integer(3));
}

/// GETTABLE falls back through a `__index` table chain.
#[test]
fn test_index_metamethod_chain() {
    let vm = LuaVM::new();

    let base = LuaValue::table(LuaTable::new(0, 1));
    base.as_table()
        .unwrap()
        .borrow_mut()
        .raw_set(LuaValue::string("x"), LuaValue::Integer(99))
        .unwrap();

    let mt = LuaValue::table(LuaTable::new(0, 1));
    mt.as_table()
        .unwrap()
        .borrow_mut()
        .raw_set(LuaValue::string("__index"), base)
        .unwrap();

    let t = LuaValue::table(LuaTable::new(0, 0));
    t.as_table().unwrap().borrow_mut().set_metatable(Some(mt));
    vm.set_global("t", t);

    let mut b = ProtoBuilder::new("mt.lua", 2);
    b.upvalue("_ENV", false, 0);
    let kt = b.constant(LuaValue::string("t"));
    let kx = b.constant(LuaValue::string("x"));
    let proto = b
        .code(vec![
            abc(OpCode::GetTabUp, 0, 0, rk(kt)),
            abc(OpCode::GetTable, 1, 0, rk(kx)),
            abc(OpCode::Return, 1, 2, 0),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    let result = vm.call(&vm.load_proto(proto), vec![]).unwrap();
    assert_eq!(result.first(), LuaValue::Integer(99));
}

/// SETTABLE routes through a `__newindex` handler function.
#[test]
fn test_newindex_handler_function() {
    let vm = LuaVM::new();
    let recorded: Rc<RefCell<Option<(LuaValue, LuaValue)>>> = Rc::new(RefCell::new(None));

    let sink = recorded.clone();
    let handler = vm.register_host(HostFunction::new("record_set", move |scope| {
        *sink.borrow_mut() = Some((scope.args.arg(2), scope.args.arg(3)));
        Ok(HostReturn::Values(crate::lua_value::Varargs::None))
    }));

    let mt = LuaValue::table(LuaTable::new(0, 1));
    mt.as_table()
        .unwrap()
        .borrow_mut()
        .raw_set(LuaValue::string("__newindex"), handler)
        .unwrap();

    let t = LuaValue::table(LuaTable::new(0, 0));
    t.as_table().unwrap().borrow_mut().set_metatable(Some(mt));
    vm.set_global("t", t.clone());

    let mut b = ProtoBuilder::new("ni.lua", 2);
    b.upvalue("_ENV", false, 0);
    let kt = b.constant(LuaValue::string("t"));
    let ky = b.constant(LuaValue::string("y"));
    let k5 = b.constant(LuaValue::Integer(5));
    let proto = b
        .code(vec![
            abc(OpCode::GetTabUp, 0, 0, rk(kt)),
            abc(OpCode::SetTable, 0, rk(ky), rk(k5)),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    vm.call(&vm.load_proto(proto), vec![]).unwrap();
    let (key, value) = recorded.borrow_mut().take().expect("handler ran");
    assert_eq!(key, LuaValue::string("y"));
    assert_eq!(value, LuaValue::Integer(5));
    // The raw table stays untouched.
    assert!(t
        .as_table()
        .unwrap()
        .borrow()
        .raw_get(&LuaValue::string("y"))
        .is_nil());
}

/// Generic for over pairs(): TFORCALL + TFORLOOP with the stateless
/// `next` iterator counting three array entries.
#[test]
fn test_generic_for_counts_entries() {
    let (vm, _out) = crate::test::capture_vm();

    let mut b = ProtoBuilder::new("gfor.lua", 8);
    b.upvalue("_ENV", false, 0);
    let k10 = b.constant(LuaValue::Integer(10));
    let k20 = b.constant(LuaValue::Integer(20));
    let k30 = b.constant(LuaValue::Integer(30));
    let k0 = b.constant(LuaValue::Integer(0));
    let k1 = b.constant(LuaValue::Integer(1));
    let knext = b.constant(LuaValue::string("next"));
    let proto = b
        .code(vec![
            abc(OpCode::NewTable, 0, 3, 0),
            abx(OpCode::LoadK, 1, k10),
            abx(OpCode::LoadK, 2, k20),
            abx(OpCode::LoadK, 3, k30),
            abc(OpCode::SetList, 0, 3, 1),
            abx(OpCode::LoadK, 1, k0),            // count = 0
            abc(OpCode::GetTabUp, 2, 0, rk(knext)), // f = next
            abc(OpCode::Move, 3, 0, 0),           // s = t
            abc(OpCode::LoadNil, 4, 0, 0),        // control = nil
            asbx(OpCode::Jmp, 0, 1),              // -> TFORCALL
            abc(OpCode::Add, 1, 1, rk(k1)),       // count = count + 1
            abc(OpCode::TForCall, 2, 0, 2),
            asbx(OpCode::TForLoop, 4, -3),
            abc(OpCode::Return, 1, 2, 0),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    let result = vm.call(&vm.load_proto(proto), vec![]).unwrap();
    assert_eq!(result.first(), LuaValue::Integer(3));
}
