// LuaClosure - a prototype bound to an environment and upvalues, plus the
// call entry points. A closure that roots a resumable invocation carries
// the execution stack; the dispatch loop propagates that handle into every
// callee so suspension can be captured at any depth.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use crate::lua_value::{LuaValue, Prototype, Varargs};
use crate::lua_vm::execute::{call_value, execute};
use crate::lua_vm::upvalue::UpvalueCell;
use crate::lua_vm::{ExecutionStack, LuaError, LuaFrame, LuaResult, LuaVM, StackHandle};

/// Result of one raw dispatch-loop run.
pub enum Flow {
    Values(Varargs),
    /// Tail-call trampoline: the caller must keep evaluating until
    /// concrete. The originating frame is already gone.
    TailCall(LuaValue, Varargs),
    /// A host callable paused the runtime; frames stay pushed.
    Suspend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Sync,
    Suspendable,
}

/// Lua call-chain depth limit. The dispatch loop recurses on the native
/// stack, one activation per Lua frame, so the bound also bounds native
/// stack use.
const MAX_CALL_DEPTH: usize = 200;

pub struct LuaClosure {
    pub proto: Rc<Prototype>,
    /// Globals table this closure resolves its environment against.
    pub env: LuaValue,
    pub upvalues: Vec<UpvalueCell>,
    /// Populated when this closure roots a resumable invocation.
    pub execution_stack: RefCell<Option<StackHandle>>,
}

impl LuaClosure {
    pub fn new(proto: Rc<Prototype>, env: LuaValue, upvalues: Vec<UpvalueCell>) -> Rc<LuaClosure> {
        Rc::new(LuaClosure {
            proto,
            env,
            upvalues,
            execution_stack: RefCell::new(None),
        })
    }

    pub fn stack_handle(&self) -> Option<StackHandle> {
        self.execution_stack.borrow().clone()
    }

    pub fn attach_stack(&self, handle: StackHandle) {
        *self.execution_stack.borrow_mut() = Some(handle);
    }

    pub fn detach_stack(&self) {
        *self.execution_stack.borrow_mut() = None;
    }

    fn ensure_stack(&self) -> StackHandle {
        let mut slot = self.execution_stack.borrow_mut();
        match &*slot {
            Some(h) => h.clone(),
            None => {
                let h = ExecutionStack::new_handle();
                *slot = Some(h.clone());
                h
            }
        }
    }

    // ============ Raw entries (may return a trampoline) ============

    /// Synchronous raw entry.
    pub fn on_invoke(self: &Rc<Self>, vm: &LuaVM, args: Varargs) -> LuaResult<Flow> {
        self.enter(vm, args, CallMode::Sync)
    }

    /// Suspendable raw entry.
    pub fn on_suspendable_invoke(self: &Rc<Self>, vm: &LuaVM, args: Varargs) -> LuaResult<Flow> {
        self.enter(vm, args, CallMode::Suspendable)
    }

    /// Create or restore the frame for this invocation and run the
    /// dispatch loop over it.
    ///
    /// FRESH: no frame exists at `current_level`; a new one is pushed and
    /// the arguments populate its registers. RESUME: a frame from a
    /// suspended chain already sits at `current_level`; it is re-entered
    /// at its saved pc and the arguments are ignored.
    fn enter(self: &Rc<Self>, vm: &LuaVM, args: Varargs, mode: CallMode) -> LuaResult<Flow> {
        let handle = self.ensure_stack();

        if handle.borrow().user_end_call && !handle.borrow().frames.is_empty() {
            return stop_unwind(vm, &handle);
        }

        let level = {
            let mut stack = handle.borrow_mut();
            let level = stack.current_level;
            if level >= stack.frames.len() {
                debug_assert_eq!(level, stack.frames.len());
                if level >= MAX_CALL_DEPTH {
                    return Err(LuaError::new("stack overflow"));
                }
                let frame = LuaFrame::new(self.clone(), args);
                stack.frames.push(frame);
            }
            level
        };

        let result = execute(vm, &handle, level, mode);

        match &result {
            Ok(Flow::Suspend) => {
                // Frames stay pushed across the yield; resumption reopens
                // them through the RESUME path.
            }
            _ => {
                let mut stack = handle.borrow_mut();
                if stack.frames.len() == level + 1 {
                    if let Some(mut frame) = stack.frames.pop() {
                        frame.close_all_upvalues();
                    }
                }
            }
        }
        result
    }

    // ============ Resolving entries ============

    /// Synchronous invocation; tail-call trampolines are evaluated until a
    /// concrete result emerges.
    pub fn invoke(self: &Rc<Self>, vm: &LuaVM, args: Varargs) -> LuaResult<Varargs> {
        let handle = self.ensure_stack();
        let mut flow = self.on_invoke(vm, args)?;
        loop {
            match flow {
                Flow::Values(v) => return Ok(v),
                Flow::TailCall(callee, targs) => {
                    flow = call_value(vm, &handle, callee, targs, CallMode::Sync)?;
                }
                Flow::Suspend => {
                    return Err(LuaError::new("attempt to suspend a non-suspendable call"));
                }
            }
        }
    }

    /// Suspendable invocation; resolves trampolines, may yield.
    pub fn suspendable_invoke(self: &Rc<Self>, vm: &LuaVM, args: Varargs) -> LuaResult<Flow> {
        let handle = self.ensure_stack();
        let mut flow = self.on_suspendable_invoke(vm, args)?;
        loop {
            match flow {
                Flow::TailCall(callee, targs) => {
                    flow = call_value(vm, &handle, callee, targs, CallMode::Suspendable)?;
                }
                other => return Ok(other),
            }
        }
    }

    // ============ Arity fast paths ============

    pub fn call0(self: &Rc<Self>, vm: &LuaVM) -> LuaResult<LuaValue> {
        Ok(self.invoke(vm, Varargs::None)?.first())
    }

    pub fn call1(self: &Rc<Self>, vm: &LuaVM, a: LuaValue) -> LuaResult<LuaValue> {
        Ok(self.invoke(vm, Varargs::One(a))?.first())
    }

    pub fn call2(self: &Rc<Self>, vm: &LuaVM, a: LuaValue, b: LuaValue) -> LuaResult<LuaValue> {
        Ok(self.invoke(vm, Varargs::many(vec![a, b]))?.first())
    }

    pub fn call3(
        self: &Rc<Self>,
        vm: &LuaVM,
        a: LuaValue,
        b: LuaValue,
        c: LuaValue,
    ) -> LuaResult<LuaValue> {
        Ok(self.invoke(vm, Varargs::many(vec![a, b, c]))?.first())
    }

    pub fn suspendable_call0(self: &Rc<Self>, vm: &LuaVM) -> LuaResult<Flow> {
        self.suspendable_invoke(vm, Varargs::None)
    }

    pub fn suspendable_call1(self: &Rc<Self>, vm: &LuaVM, a: LuaValue) -> LuaResult<Flow> {
        self.suspendable_invoke(vm, Varargs::One(a))
    }

    pub fn suspendable_call2(
        self: &Rc<Self>,
        vm: &LuaVM,
        a: LuaValue,
        b: LuaValue,
    ) -> LuaResult<Flow> {
        self.suspendable_invoke(vm, Varargs::many(vec![a, b]))
    }

    pub fn suspendable_call3(
        self: &Rc<Self>,
        vm: &LuaVM,
        a: LuaValue,
        b: LuaValue,
        c: LuaValue,
    ) -> LuaResult<Flow> {
        self.suspendable_invoke(vm, Varargs::many(vec![a, b, c]))
    }
}

/// Stop protocol: unwind every pushed frame, innermost first. Each frame
/// is parked on its RETURN epilogue, so one dispatch step per frame
/// returns NONE and pops it, closing open upvalues on the way out.
fn stop_unwind(vm: &LuaVM, handle: &StackHandle) -> LuaResult<Flow> {
    debug!("stop unwind: {} frames", handle.borrow().frames.len());
    loop {
        let level = {
            let stack = handle.borrow();
            if stack.frames.is_empty() {
                break;
            }
            stack.frames.len() - 1
        };
        handle.borrow_mut().current_level = level;
        let step = execute(vm, handle, level, CallMode::Suspendable);
        {
            let mut stack = handle.borrow_mut();
            if stack.frames.len() == level + 1 {
                if let Some(mut frame) = stack.frames.pop() {
                    frame.close_all_upvalues();
                }
            }
        }
        step?;
    }
    Ok(Flow::Values(Varargs::None))
}

impl std::fmt::Debug for LuaClosure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaClosure")
            .field("source", &self.proto.source)
            .field("upvalues", &self.upvalues.len())
            .field("rooted", &self.execution_stack.borrow().is_some())
            .finish()
    }
}
