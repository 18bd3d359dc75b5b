/// Precompiled chunk round trips through dump/load, plus header checks.
use crate::lua_value::{dump_chunk, load_chunk, ChunkError, LuaValue};
use crate::lua_vm::{LuaVM, OpCode};
use crate::test::{abc, abx, rk, ProtoBuilder};

fn arithmetic_proto() -> std::rc::Rc<crate::lua_value::Prototype> {
    let mut b = ProtoBuilder::new("@s1.lua", 2);
    let k1 = b.constant(LuaValue::Integer(1));
    let k2 = b.constant(LuaValue::Integer(2));
    let k3 = b.constant(LuaValue::Integer(3));
    b.upvalue("_ENV", false, 0);
    b.code(vec![
        abc(OpCode::Mul, 1, rk(k2), rk(k3)),
        abc(OpCode::Add, 0, rk(k1), 1),
        abc(OpCode::Return, 0, 2, 0),
        abc(OpCode::Return, 0, 1, 0),
    ])
    .build()
}

#[test]
fn test_dump_load_round_trip() {
    let proto = arithmetic_proto();
    let bytes = dump_chunk(&proto);
    let loaded = load_chunk(&bytes, "reloaded").unwrap();

    assert_eq!(loaded.code, proto.code);
    assert_eq!(loaded.constants.len(), proto.constants.len());
    assert_eq!(loaded.num_params, proto.num_params);
    assert_eq!(loaded.max_stack_size, proto.max_stack_size);
    assert_eq!(loaded.upvalue_descs.len(), 1);
    assert_eq!(loaded.source.as_str(), "@s1.lua");
    assert_eq!(loaded.line_info, proto.line_info);
    // Integral number constants come back as exact integers.
    assert_eq!(loaded.constants[0], LuaValue::Integer(1));
}

#[test]
fn test_loaded_chunk_executes() {
    let proto = arithmetic_proto();
    let bytes = dump_chunk(&proto);

    let vm = LuaVM::new();
    let main = vm.load(&bytes, "s1").unwrap();
    let result = vm.call(&main, vec![]).unwrap();
    assert_eq!(result.first(), LuaValue::Integer(7));
}

#[test]
fn test_nested_protos_round_trip() {
    let mut inner = ProtoBuilder::new("nested.lua", 2);
    let k = inner.constant(LuaValue::string("inner value"));
    inner.upvalue("x", true, 3);
    let inner_proto = inner
        .code(vec![
            abx(OpCode::LoadK, 0, k),
            abc(OpCode::Return, 0, 2, 0),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    let mut outer = ProtoBuilder::new("nested.lua", 3);
    let inner_idx = outer.child(inner_proto);
    let outer_proto = outer
        .code(vec![
            abx(OpCode::Closure, 0, inner_idx),
            abc(OpCode::Return, 0, 2, 0),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    let bytes = dump_chunk(&outer_proto);
    let loaded = load_chunk(&bytes, "nested").unwrap();
    assert_eq!(loaded.protos.len(), 1);
    let child = &loaded.protos[0];
    assert_eq!(child.constants[0], LuaValue::string("inner value"));
    assert_eq!(child.upvalue_descs.len(), 1);
    assert!(child.upvalue_descs[0].instack);
    assert_eq!(child.upvalue_descs[0].idx, 3);
    assert_eq!(child.upvalue_descs[0].name.as_str(), "x");
}

#[test]
fn test_bad_signature_rejected() {
    let err = load_chunk(b"\x1bNotLua.....", "x").unwrap_err();
    assert!(matches!(err, ChunkError::BadSignature));
}

#[test]
fn test_wrong_version_rejected() {
    let mut bytes = dump_chunk(&arithmetic_proto());
    bytes[4] = 0x53;
    let err = load_chunk(&bytes, "x").unwrap_err();
    assert!(matches!(err, ChunkError::BadVersion(0x53)));
}

#[test]
fn test_truncated_chunk_rejected() {
    let bytes = dump_chunk(&arithmetic_proto());
    let err = load_chunk(&bytes[..bytes.len() / 2], "x").unwrap_err();
    assert!(matches!(err, ChunkError::Truncated));
}
