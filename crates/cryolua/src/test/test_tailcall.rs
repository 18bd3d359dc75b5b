/// Tail-call trampoline behavior.
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaVM, OpCode};
use crate::test::{abc, abx, capture_vm, rk, ProtoBuilder};

/// `function a() return b() end function b() return 42 end return a()`
#[test]
fn test_tail_call_result() {
    // b: return 42
    let mut b = ProtoBuilder::new("b.lua", 2);
    b.upvalue("_ENV", false, 0);
    let k42 = b.constant(LuaValue::Integer(42));
    let b_proto = b
        .code(vec![
            abx(OpCode::LoadK, 0, k42),
            abc(OpCode::Return, 0, 2, 0),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    // a: return b()
    let mut a = ProtoBuilder::new("a.lua", 2);
    a.upvalue("_ENV", false, 0);
    let kb = a.constant(LuaValue::string("b"));
    let a_proto = a
        .code(vec![
            abc(OpCode::GetTabUp, 0, 0, rk(kb)),
            abc(OpCode::TailCall, 0, 1, 0),
            abc(OpCode::Return, 0, 0, 0),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    // main: _ENV.a = closure(a); _ENV.b = closure(b); return a()
    let mut main = ProtoBuilder::new("main.lua", 2);
    main.upvalue("_ENV", false, 0);
    let ka = main.constant(LuaValue::string("a"));
    let kb = main.constant(LuaValue::string("b"));
    let a_idx = main.child(a_proto);
    let b_idx = main.child(b_proto);
    let main_proto = main
        .code(vec![
            abx(OpCode::Closure, 0, a_idx),
            abc(OpCode::SetTabUp, 0, rk(ka), 0),
            abx(OpCode::Closure, 0, b_idx),
            abc(OpCode::SetTabUp, 0, rk(kb), 0),
            abc(OpCode::GetTabUp, 0, 0, rk(ka)),
            abc(OpCode::Call, 0, 1, 0),
            abc(OpCode::Return, 0, 0, 0),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    let vm = LuaVM::new();
    let result = vm.call(&vm.load_proto(main_proto), vec![]).unwrap();
    assert_eq!(result.first(), LuaValue::Integer(42));
}

/// The tail-calling frame is gone before the callee runs: an error inside
/// the callee never mentions the tail-caller in its traceback.
#[test]
fn test_tail_caller_absent_from_traceback() {
    let (vm, _out) = capture_vm();

    // berr: error("boom")
    let mut berr = ProtoBuilder::new("b.lua", 3);
    berr.upvalue("_ENV", false, 0);
    let kerror = berr.constant(LuaValue::string("error"));
    let kboom = berr.constant(LuaValue::string("boom"));
    let berr_proto = berr
        .code(vec![
            abc(OpCode::GetTabUp, 0, 0, rk(kerror)),
            abx(OpCode::LoadK, 1, kboom),
            abc(OpCode::Call, 0, 2, 1),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    // atail: return berr()
    let mut atail = ProtoBuilder::new("a.lua", 2);
    atail.upvalue("_ENV", false, 0);
    let kb = atail.constant(LuaValue::string("berr"));
    let atail_proto = atail
        .code(vec![
            abc(OpCode::GetTabUp, 0, 0, rk(kb)),
            abc(OpCode::TailCall, 0, 1, 0),
            abc(OpCode::Return, 0, 0, 0),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    let mut main = ProtoBuilder::new("main.lua", 2);
    main.upvalue("_ENV", false, 0);
    let ka = main.constant(LuaValue::string("atail"));
    let kb = main.constant(LuaValue::string("berr"));
    let a_idx = main.child(atail_proto);
    let b_idx = main.child(berr_proto);
    let main_proto = main
        .code(vec![
            abx(OpCode::Closure, 0, a_idx),
            abc(OpCode::SetTabUp, 0, rk(ka), 0),
            abx(OpCode::Closure, 0, b_idx),
            abc(OpCode::SetTabUp, 0, rk(kb), 0),
            abc(OpCode::GetTabUp, 0, 0, rk(ka)),
            abc(OpCode::Call, 0, 1, 1),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    let err = vm.call(&vm.load_proto(main_proto), vec![]).unwrap_err();
    assert!(err.message.contains("boom"));
    let trace = err.traceback.join("\n");
    assert!(trace.contains("b.lua"));
    assert!(!trace.contains("a.lua"));
    assert!(trace.contains("main.lua"));
}
