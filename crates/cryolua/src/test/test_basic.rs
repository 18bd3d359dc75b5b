/// Core dispatch tests over hand-assembled chunks.
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaVM, OpCode};
use crate::test::{abc, abx, asbx, capture_vm, rk, ProtoBuilder};

/// `return 1 + 2 * 3` evaluates to 7.
#[test]
fn test_basic_arithmetic_chunk() {
    let mut b = ProtoBuilder::new("s1.lua", 2);
    let k1 = b.constant(LuaValue::Integer(1));
    let k2 = b.constant(LuaValue::Integer(2));
    let k3 = b.constant(LuaValue::Integer(3));
    let proto = b
        .code(vec![
            abc(OpCode::Mul, 1, rk(k2), rk(k3)),
            abc(OpCode::Add, 0, rk(k1), 1),
            abc(OpCode::Return, 0, 2, 0),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    let vm = LuaVM::new();
    let main = vm.load_proto(proto);
    let result = vm.call(&main, vec![]).unwrap();
    assert_eq!(result.first(), LuaValue::Integer(7));
}

/// MOVE is a plain register copy with no side effects.
#[test]
fn test_move_is_register_copy() {
    let mut b = ProtoBuilder::new("move.lua", 3);
    let k = b.constant(LuaValue::string("payload"));
    let proto = b
        .code(vec![
            abx(OpCode::LoadK, 0, k),
            abc(OpCode::Move, 2, 0, 0),
            abc(OpCode::Return, 2, 2, 0),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    let vm = LuaVM::new();
    let main = vm.load_proto(proto);
    let result = vm.call(&main, vec![]).unwrap();
    assert_eq!(result.first(), LuaValue::string("payload"));
}

/// Numeric for: sum of 1..5.
#[test]
fn test_numeric_for_loop() {
    let mut b = ProtoBuilder::new("for.lua", 5);
    let k0 = b.constant(LuaValue::Integer(0));
    let k1 = b.constant(LuaValue::Integer(1));
    let k5 = b.constant(LuaValue::Integer(5));
    let proto = b
        .code(vec![
            abx(OpCode::LoadK, 0, k0),       // sum = 0
            abx(OpCode::LoadK, 1, k1),       // init
            abx(OpCode::LoadK, 2, k5),       // limit
            abx(OpCode::LoadK, 3, k1),       // step
            asbx(OpCode::ForPrep, 1, 1),     // -> FORLOOP
            abc(OpCode::Add, 0, 0, 4),       // sum = sum + i
            asbx(OpCode::ForLoop, 1, -2),    // -> body
            abc(OpCode::Return, 0, 2, 0),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    let vm = LuaVM::new();
    let main = vm.load_proto(proto);
    let result = vm.call(&main, vec![]).unwrap();
    assert_eq!(result.first(), LuaValue::Integer(15));
}

/// A float step keeps the loop in float arithmetic.
#[test]
fn test_numeric_for_loop_float() {
    let mut b = ProtoBuilder::new("forf.lua", 5);
    let k0 = b.constant(LuaValue::Integer(0));
    let k_init = b.constant(LuaValue::Number(0.5));
    let k_limit = b.constant(LuaValue::Number(2.5));
    let k_step = b.constant(LuaValue::Number(1.0));
    let proto = b
        .code(vec![
            abx(OpCode::LoadK, 0, k0),
            abx(OpCode::LoadK, 1, k_init),
            abx(OpCode::LoadK, 2, k_limit),
            abx(OpCode::LoadK, 3, k_step),
            asbx(OpCode::ForPrep, 1, 1),
            abc(OpCode::Add, 0, 0, 4),
            asbx(OpCode::ForLoop, 1, -2),
            abc(OpCode::Return, 0, 2, 0),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    let vm = LuaVM::new();
    let main = vm.load_proto(proto);
    let result = vm.call(&main, vec![]).unwrap();
    // 0.5 + 1.5 + 2.5
    assert_eq!(result.first(), LuaValue::Number(4.5));
}

/// Non-numeric loop bounds raise the classic message.
#[test]
fn test_for_loop_bad_initial_value() {
    let mut b = ProtoBuilder::new("forbad.lua", 5);
    let k_bad = b.constant(LuaValue::string("x"));
    let k1 = b.constant(LuaValue::Integer(1));
    let proto = b
        .code(vec![
            abx(OpCode::LoadK, 1, k_bad),
            abx(OpCode::LoadK, 2, k1),
            abx(OpCode::LoadK, 3, k1),
            asbx(OpCode::ForPrep, 1, 0),
            asbx(OpCode::ForLoop, 1, -1),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    let vm = LuaVM::new();
    let main = vm.load_proto(proto);
    let err = vm.call(&main, vec![]).unwrap_err();
    // "x" does not coerce even though strings sometimes do.
    assert!(err.message.contains("'for' initial value must be a number"));
}

/// VARARG B=0 forwards every argument through RETURN B=0.
#[test]
fn test_vararg_passthrough() {
    let mut b = ProtoBuilder::new("va.lua", 3);
    b.vararg();
    let proto = b
        .code(vec![
            abc(OpCode::Vararg, 0, 0, 0),
            abc(OpCode::Return, 0, 0, 0),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    let vm = LuaVM::new();
    let main = vm.load_proto(proto);
    let result = vm
        .call(
            &main,
            vec![
                LuaValue::Integer(10),
                LuaValue::string("mid"),
                LuaValue::Boolean(true),
            ],
        )
        .unwrap();
    assert_eq!(result.narg(), 3);
    assert_eq!(result.arg(1), LuaValue::Integer(10));
    assert_eq!(result.arg(2), LuaValue::string("mid"));
    assert_eq!(result.arg(3), LuaValue::Boolean(true));
}

/// TEST skips the following jump when the register disagrees with C.
#[test]
fn test_test_and_jump() {
    // if r0 then return "yes" else return "no"
    let mut b = ProtoBuilder::new("test.lua", 2);
    b.params(1);
    let k_yes = b.constant(LuaValue::string("yes"));
    let k_no = b.constant(LuaValue::string("no"));
    let proto = b
        .code(vec![
            abc(OpCode::Test, 0, 0, 0),      // truthy -> skip the jump
            asbx(OpCode::Jmp, 0, 2),         // -> "no" branch
            abx(OpCode::LoadK, 1, k_yes),
            abc(OpCode::Return, 1, 2, 0),
            abx(OpCode::LoadK, 1, k_no),
            abc(OpCode::Return, 1, 2, 0),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    let vm = LuaVM::new();
    let main = vm.load_proto(proto);
    let yes = vm.call(&main, vec![LuaValue::Boolean(true)]).unwrap();
    assert_eq!(yes.first(), LuaValue::string("yes"));
    let main2 = vm.load_proto({
        let mut b2 = ProtoBuilder::new("test.lua", 2);
        b2.params(1);
        let k_yes = b2.constant(LuaValue::string("yes"));
        let k_no = b2.constant(LuaValue::string("no"));
        b2.code(vec![
            abc(OpCode::Test, 0, 0, 0),
            asbx(OpCode::Jmp, 0, 2),
            abx(OpCode::LoadK, 1, k_yes),
            abc(OpCode::Return, 1, 2, 0),
            abx(OpCode::LoadK, 1, k_no),
            abc(OpCode::Return, 1, 2, 0),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build()
    });
    let no = vm.call(&main2, vec![LuaValue::Nil]).unwrap();
    assert_eq!(no.first(), LuaValue::string("no"));
}

/// print goes through the VM output sink.
#[test]
fn test_print_through_sink() {
    let (vm, out) = capture_vm();
    let mut b = ProtoBuilder::new("print.lua", 3);
    b.upvalue("_ENV", false, 0);
    let k_print = b.constant(LuaValue::string("print"));
    let k_msg = b.constant(LuaValue::string("hello"));
    let proto = b
        .code(vec![
            abc(OpCode::GetTabUp, 0, 0, rk(k_print)),
            abx(OpCode::LoadK, 1, k_msg),
            abc(OpCode::Call, 0, 2, 1),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();
    let main = vm.load_proto(proto);
    vm.call(&main, vec![]).unwrap();
    assert_eq!(crate::test::captured(&out), "hello\n");
}
