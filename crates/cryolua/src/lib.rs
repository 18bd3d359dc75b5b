// cryolua
// A Lua 5.2 bytecode interpreter whose execution state can be frozen to
// bytes mid-run and thawed in another process: scripts suspend at host
// call boundaries, the whole call chain serializes, and resumption
// re-descends to the exact instruction that was executing.

#[cfg(test)]
mod test;

pub mod lua_value;
pub mod lua_vm;
pub mod snapshot;
pub mod stdlib;

pub use lua_value::{
    dump_chunk, load_chunk, Buffer, ChunkError, LuaFunction, LuaTable, LuaUserData, LuaValue,
    LuaValueKind, Prototype, UpvalueDesc, Varargs,
};
pub use lua_vm::{
    ExecutionStack, Flow, HostFunction, HostReturn, HostScope, Instruction, LuaClosure, LuaError,
    LuaResult, LuaVM, OpCode, Outcome, StackHandle, UpValue, HOST_LEVEL_NONE,
};
pub use snapshot::{deserialize_execution_context, serialize_execution_context, SnapshotError};

/// Run a precompiled chunk to completion with the basic library open.
pub fn run_chunk(bytes: &[u8], name: &str) -> LuaResult<Vec<LuaValue>> {
    let vm = LuaVM::new();
    vm.open_basic_lib();
    let closure = vm.load(bytes, name)?;
    Ok(vm.call(&closure, vec![])?.to_vec())
}
