// Test module organization
pub mod test_basic;
pub mod test_chunk_loader;
pub mod test_table;
pub mod test_tailcall;

// The compiler is out of scope, so tests drive the engine with
// hand-assembled prototypes; every function body ends with the standard
// `RETURN 0 1` epilogue, as compiled chunks do.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use crate::lua_value::{LuaTable, LuaValue, Prototype, UpvalueDesc};
use crate::lua_vm::{HostFunction, HostReturn, Instruction, LuaError, LuaVM, OpCode};
use crate::snapshot::serialize_execution_context;
use smol_str::SmolStr;

pub fn abc(op: OpCode, a: usize, b: usize, c: usize) -> u32 {
    Instruction::abc(op, a, b, c)
}

pub fn abx(op: OpCode, a: usize, bx: usize) -> u32 {
    Instruction::abx(op, a, bx)
}

pub fn asbx(op: OpCode, a: usize, sbx: i32) -> u32 {
    Instruction::asbx(op, a, sbx)
}

/// RK operand selecting constant `i`.
pub fn rk(i: usize) -> usize {
    Instruction::rk(i)
}

pub struct ProtoBuilder {
    proto: Prototype,
}

impl ProtoBuilder {
    pub fn new(source: &str, max_stack: u8) -> ProtoBuilder {
        let mut proto = Prototype::new(source);
        proto.max_stack_size = max_stack;
        ProtoBuilder { proto }
    }

    pub fn params(&mut self, n: u8) -> &mut Self {
        self.proto.num_params = n;
        self
    }

    pub fn vararg(&mut self) -> &mut Self {
        self.proto.is_vararg = 1;
        self
    }

    pub fn upvalue(&mut self, name: &str, instack: bool, idx: u8) -> &mut Self {
        self.proto.upvalue_descs.push(UpvalueDesc {
            name: SmolStr::new(name),
            instack,
            idx,
        });
        self
    }

    pub fn constant(&mut self, v: LuaValue) -> usize {
        self.proto.constants.push(v);
        self.proto.constants.len() - 1
    }

    pub fn child(&mut self, p: Rc<Prototype>) -> usize {
        self.proto.protos.push(p);
        self.proto.protos.len() - 1
    }

    pub fn code(&mut self, code: Vec<u32>) -> &mut Self {
        self.proto.line_info = (1..=code.len() as u32).collect();
        self.proto.code = code;
        self
    }

    pub fn build(&mut self) -> Rc<Prototype> {
        Rc::new(std::mem::replace(&mut self.proto, Prototype::new("spent")))
    }
}

struct SinkWriter(Rc<RefCell<Vec<u8>>>);

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// VM with the basic library open and `print` captured into a buffer.
pub fn capture_vm() -> (LuaVM, Rc<RefCell<Vec<u8>>>) {
    let vm = LuaVM::new();
    vm.open_basic_lib();
    let buf = Rc::new(RefCell::new(Vec::new()));
    vm.set_output(Box::new(SinkWriter(buf.clone())));
    (vm, buf)
}

pub fn captured(buf: &Rc<RefCell<Vec<u8>>>) -> String {
    String::from_utf8(buf.borrow().clone()).unwrap()
}

/// Bind a host object `obj` with the suspendable methods the suspension
/// scenarios call: `coreFun` snapshots the live chain into `store` and
/// suspends; `coreDelay` just suspends.
pub fn bind_core_object(vm: &LuaVM, store: Rc<RefCell<Option<Vec<u8>>>>) {
    let core_fun = vm.register_host(HostFunction::suspendable("coreFun", move |scope| {
        let bytes = serialize_execution_context(&scope.stack).map_err(LuaError::host)?;
        *store.borrow_mut() = Some(bytes);
        Ok(HostReturn::Suspend)
    }));
    let core_delay = vm.register_host(HostFunction::suspendable("coreDelay", |_| {
        Ok(HostReturn::Suspend)
    }));

    let obj = LuaTable::new(0, 2);
    let obj = LuaValue::table(obj);
    {
        let t = obj.as_table().unwrap();
        t.borrow_mut()
            .raw_set(LuaValue::string("coreFun"), core_fun)
            .unwrap();
        t.borrow_mut()
            .raw_set(LuaValue::string("coreDelay"), core_delay)
            .unwrap();
    }
    vm.set_global("obj", obj);
}

/// A two-frame chain that suspends inside `obj:coreFun()` and would print
/// from both frames after the resume point:
/// `function inner() print(obj:coreFun()) end inner(); print("after")`
pub fn suspend_chain_proto() -> Rc<Prototype> {
    let mut inner = ProtoBuilder::new("chain.lua", 3);
    inner.upvalue("_ENV", false, 0);
    let kobj = inner.constant(LuaValue::string("obj"));
    let kfun = inner.constant(LuaValue::string("coreFun"));
    let kprint = inner.constant(LuaValue::string("print"));
    let inner_proto = inner
        .code(vec![
            abc(OpCode::GetTabUp, 0, 0, rk(kobj)),
            abc(OpCode::SelfOp, 0, 0, rk(kfun)),
            abc(OpCode::Call, 0, 2, 2),
            abc(OpCode::GetTabUp, 1, 0, rk(kprint)),
            abc(OpCode::Move, 2, 0, 0),
            abc(OpCode::Call, 1, 2, 1),
            abc(OpCode::Return, 0, 1, 0),
        ])
        .build();

    let mut main = ProtoBuilder::new("chain.lua", 2);
    main.upvalue("_ENV", false, 0);
    let kinner = main.constant(LuaValue::string("inner"));
    let kprint = main.constant(LuaValue::string("print"));
    let kafter = main.constant(LuaValue::string("after"));
    let inner_idx = main.child(inner_proto);
    main.code(vec![
        abx(OpCode::Closure, 0, inner_idx),
        abc(OpCode::SetTabUp, 0, rk(kinner), 0),
        abc(OpCode::GetTabUp, 0, 0, rk(kinner)),
        abc(OpCode::Call, 0, 1, 1),
        abc(OpCode::GetTabUp, 0, 0, rk(kprint)),
        abx(OpCode::LoadK, 1, kafter),
        abc(OpCode::Call, 0, 2, 1),
        abc(OpCode::Return, 0, 1, 0),
    ])
    .build()
}

/// Registry-only `coreFun`/`coreDelay`, for VMs that restore a snapshot
/// and only need the names to rebind.
pub fn register_core_stubs(vm: &LuaVM) {
    vm.register_host(HostFunction::suspendable("coreFun", |_| {
        Ok(HostReturn::Suspend)
    }));
    vm.register_host(HostFunction::suspendable("coreDelay", |_| {
        Ok(HostReturn::Suspend)
    }));
}
