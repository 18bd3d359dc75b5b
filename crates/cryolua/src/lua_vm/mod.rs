// Lua Virtual Machine driver.
// Owns the globals table, the host-function registry and the output sink;
// exposes the load / call / suspendable_call / snapshot entry points.

mod closure;
pub mod execute;
mod execution_stack;
mod host;
mod lua_error;
mod lua_frame;
pub mod opcode;
pub(crate) mod upvalue;

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use log::debug;

pub use closure::{CallMode, Flow, LuaClosure};
pub use execution_stack::{ExecutionStack, StackHandle, HOST_LEVEL_NONE};
pub use host::{HostFnImpl, HostFunction, HostRegistry, HostReturn, HostScope};
pub use lua_error::{LuaError, LuaResult};
pub use lua_frame::LuaFrame;
pub use opcode::{Instruction, OpCode};
pub use upvalue::{UpValue, UpvalueCell};

use crate::lua_value::{load_chunk, LuaTable, LuaValue, Prototype, Varargs};
use crate::snapshot;

/// Driver-level result of a suspendable call.
#[derive(Debug)]
pub enum Outcome {
    Done(Varargs),
    /// A host callable paused the script; the closure keeps its execution
    /// stack attached for snapshot or in-memory resumption.
    Suspended,
}

pub struct LuaVM {
    globals: LuaValue,
    host: RefCell<HostRegistry>,
    out: Rc<RefCell<Box<dyn Write>>>,
    /// Script-defined error hook; taken out around hook calls so the hook
    /// cannot re-enter itself.
    error_hook: RefCell<Option<LuaValue>>,
}

impl LuaVM {
    pub fn new() -> LuaVM {
        LuaVM {
            globals: LuaValue::table(LuaTable::new(0, 20)),
            host: RefCell::new(HostRegistry::new()),
            out: Rc::new(RefCell::new(Box::new(std::io::stdout()))),
            error_hook: RefCell::new(None),
        }
    }

    // ============ Globals & environment ============

    pub fn globals(&self) -> LuaValue {
        self.globals.clone()
    }

    pub fn get_global(&self, name: &str) -> LuaValue {
        let table = self.globals.as_table().expect("globals is a table").borrow();
        table.raw_get(&LuaValue::string(name))
    }

    pub fn set_global(&self, name: &str, value: LuaValue) {
        let table = self.globals.as_table().expect("globals is a table");
        // Globals keys are strings; raw_set cannot fail on them.
        let _ = table.borrow_mut().raw_set(LuaValue::string(name), value);
    }

    // ============ Output sink ============

    pub fn set_output(&self, w: Box<dyn Write>) {
        *self.out.borrow_mut() = w;
    }

    pub fn write_line(&self, line: &str) {
        let mut out = self.out.borrow_mut();
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }

    // ============ Host functions ============

    /// Register a host callable and hand back its function value.
    pub fn register_host(&self, f: HostFunction) -> LuaValue {
        let rc = Rc::new(f);
        self.host.borrow_mut().register(rc.clone());
        LuaValue::host_function(rc)
    }

    /// Register and bind into globals under the callable's name.
    pub fn register_global_host(&self, f: HostFunction) -> LuaValue {
        let name = f.name().to_string();
        let value = self.register_host(f);
        self.set_global(&name, value.clone());
        value
    }

    pub fn host_lookup(&self, name: &str) -> Option<Rc<HostFunction>> {
        self.host.borrow().lookup(name)
    }

    pub fn open_basic_lib(&self) {
        crate::stdlib::basic::open(self);
    }

    // ============ Loading ============

    /// Load a precompiled Lua 5.2 chunk and bind it to the globals table.
    pub fn load(&self, bytes: &[u8], name: &str) -> LuaResult<Rc<LuaClosure>> {
        let proto = load_chunk(bytes, name).map_err(|e| LuaError::host(e))?;
        Ok(self.load_proto(Rc::new(proto)))
    }

    /// Wrap a main prototype into a root closure. Every upvalue the main
    /// chunk declares (the `_ENV` convention) is a closed cell holding the
    /// globals table.
    pub fn load_proto(&self, proto: Rc<Prototype>) -> Rc<LuaClosure> {
        let upvalues = proto
            .upvalue_descs
            .iter()
            .map(|_| UpValue::closed_cell(self.globals.clone()))
            .collect();
        LuaClosure::new(proto, self.globals.clone(), upvalues)
    }

    // ============ Call entry points ============

    /// Synchronous run to completion.
    pub fn call(&self, closure: &Rc<LuaClosure>, args: Vec<LuaValue>) -> LuaResult<Varargs> {
        let result = closure.invoke(self, Varargs::many(args));
        closure.detach_stack();
        result.map_err(|e| self.finish_error(e))
    }

    /// Suspendable run: completes, or pauses at a suspending host call.
    pub fn suspendable_call(
        &self,
        closure: &Rc<LuaClosure>,
        args: Vec<LuaValue>,
    ) -> LuaResult<Outcome> {
        match closure.suspendable_invoke(self, Varargs::many(args)) {
            Ok(Flow::Values(v)) => {
                closure.detach_stack();
                Ok(Outcome::Done(v))
            }
            Ok(Flow::Suspend) => {
                if let Some(handle) = closure.stack_handle() {
                    handle.borrow_mut().mark_suspended();
                }
                Ok(Outcome::Suspended)
            }
            Ok(Flow::TailCall(..)) => unreachable!("trampoline resolved by suspendable_invoke"),
            Err(e) => {
                closure.detach_stack();
                Err(self.finish_error(e))
            }
        }
    }

    /// Sugar for installing the value the next resume will splice in.
    pub fn set_return_value(&self, closure: &Rc<LuaClosure>, value: LuaValue) {
        if let Some(handle) = closure.stack_handle() {
            handle.borrow_mut().return_value = value;
        }
    }

    /// Cooperative tear-down of a suspended invocation; the next
    /// `suspendable_call` unwinds every frame and returns normally.
    pub fn stop(&self, closure: &Rc<LuaClosure>) {
        if let Some(handle) = closure.stack_handle() {
            handle.borrow_mut().stop();
        }
    }

    // ============ Snapshots ============

    pub fn serialize_execution_context(
        &self,
        stack: &StackHandle,
    ) -> Result<Vec<u8>, snapshot::SnapshotError> {
        snapshot::serialize_execution_context(stack)
    }

    pub fn deserialize_execution_context(
        &self,
        bytes: &[u8],
    ) -> Result<Rc<LuaClosure>, snapshot::SnapshotError> {
        snapshot::deserialize_execution_context(bytes, self)
    }

    // ============ Error boundary ============

    pub fn set_error_hook(&self, hook: Option<LuaValue>) {
        *self.error_hook.borrow_mut() = hook;
    }

    /// Root-boundary error enrichment: pass the message through the
    /// script-defined hook, if any. The hook slot is emptied around the
    /// call so a raising hook cannot recurse into itself.
    fn finish_error(&self, mut err: LuaError) -> LuaError {
        let hook = self.error_hook.borrow_mut().take();
        if let Some(hook_fn) = &hook {
            let message = LuaValue::string(err.positioned_message());
            match self.call_hook(hook_fn, message) {
                Ok(v) if !v.is_nil() => err.message = v.display_string(),
                _ => {}
            }
            *self.error_hook.borrow_mut() = hook;
        }
        debug!("script error: {}", err.positioned_message());
        err
    }

    fn call_hook(&self, hook: &LuaValue, message: LuaValue) -> LuaResult<LuaValue> {
        let handle = ExecutionStack::new_handle();
        let flow = execute::call_value(
            self,
            &handle,
            hook.clone(),
            Varargs::One(message),
            CallMode::Sync,
        )?;
        match flow {
            Flow::Values(v) => Ok(v.first()),
            _ => Ok(LuaValue::Nil),
        }
    }
}

impl Default for LuaVM {
    fn default() -> Self {
        LuaVM::new()
    }
}
