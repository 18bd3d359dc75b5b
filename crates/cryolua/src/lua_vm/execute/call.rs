// Call boundaries: OP_CALL and OP_TFORCALL, the engine's only suspension
// points, plus the generic callee dispatch shared with trampoline
// resolution and metamethod handlers.
//
// Resume protocol: current_level is incremented before dispatch. When it
// lands exactly on host_level, the pending host call is NOT re-executed -
// the stored return_value is spliced into the caller per the call's
// result shape and the marker is reset. The splice fires at most once per
// resume (host_level goes back to the sentinel immediately).

use log::{debug, trace};

use crate::lua_value::{LuaFunction, LuaValue, Varargs};
use crate::lua_vm::execute::{gather_args, table_ops};
use crate::lua_vm::{
    CallMode, Flow, Instruction, LuaError, LuaFrame, LuaResult, LuaVM, HostReturn, HostScope,
    StackHandle, HOST_LEVEL_NONE,
};

pub enum StepOutcome {
    Continue,
    Suspend,
}

/// OP_CALL A B C.
pub fn op_call(
    vm: &LuaVM,
    handle: &StackHandle,
    level: usize,
    mode: CallMode,
    inst: Instruction,
) -> LuaResult<StepOutcome> {
    let a = inst.a();
    let b = inst.b();
    let c = inst.c();

    // Splice check: a resumed chain re-executes the call instruction that
    // had suspended; at the pending depth the host's value stands in for
    // the call itself.
    {
        let mut stack = handle.borrow_mut();
        stack.current_level += 1;
        if stack.current_level == stack.host_level {
            let value = stack.take_return_value();
            stack.host_level = HOST_LEVEL_NONE;
            let frame = stack.frame_mut(level);
            install_results(frame, a, c, Varargs::One(value));
            stack.current_level -= 1;
            debug!("resume splice consumed at level {}", level + 1);
            return Ok(StepOutcome::Continue);
        }
    }

    let (callee, args) = {
        let stack = handle.borrow();
        let frame = stack.frame(level);
        (frame.stack[a].clone(), gather_args(frame, a, b))
    };

    match call_value(vm, handle, callee, args, mode) {
        Ok(Flow::Values(results)) => {
            let mut stack = handle.borrow_mut();
            stack.current_level -= 1;
            let frame = stack.frame_mut(level);
            install_results(frame, a, c, results);
            Ok(StepOutcome::Continue)
        }
        Ok(Flow::Suspend) => {
            // The pending call keeps its depth; frames stay pushed.
            trace!("suspension passing through level {}", level);
            Ok(StepOutcome::Suspend)
        }
        Ok(Flow::TailCall(..)) => unreachable!("call_value resolves trampolines"),
        Err(e) => {
            handle.borrow_mut().current_level -= 1;
            Err(e)
        }
    }
}

/// OP_TFORCALL A _ C: the iterator call of a generic for. Same splice and
/// suspension contract as OP_CALL, with C results landing at R[A+3..].
pub fn op_tforcall(
    vm: &LuaVM,
    handle: &StackHandle,
    level: usize,
    mode: CallMode,
    inst: Instruction,
) -> LuaResult<StepOutcome> {
    let a = inst.a();
    let c = inst.c();

    {
        let mut stack = handle.borrow_mut();
        stack.current_level += 1;
        if stack.current_level == stack.host_level {
            let value = stack.take_return_value();
            stack.host_level = HOST_LEVEL_NONE;
            let frame = stack.frame_mut(level);
            install_tfor_results(frame, a, c, Varargs::One(value));
            stack.current_level -= 1;
            debug!("resume splice consumed at iterator level {}", level + 1);
            return Ok(StepOutcome::Continue);
        }
    }

    let (callee, args) = {
        let stack = handle.borrow();
        let frame = stack.frame(level);
        (
            frame.stack[a].clone(),
            Varargs::many(vec![
                frame.stack[a + 1].clone(),
                frame.stack[a + 2].clone(),
            ]),
        )
    };

    match call_value(vm, handle, callee, args, mode) {
        Ok(Flow::Values(results)) => {
            let mut stack = handle.borrow_mut();
            stack.current_level -= 1;
            let frame = stack.frame_mut(level);
            install_tfor_results(frame, a, c, results);
            Ok(StepOutcome::Continue)
        }
        Ok(Flow::Suspend) => Ok(StepOutcome::Suspend),
        Ok(Flow::TailCall(..)) => unreachable!("call_value resolves trampolines"),
        Err(e) => {
            handle.borrow_mut().current_level -= 1;
            Err(e)
        }
    }
}

/// Install call results per the C operand: C=0 leaves them as the pending
/// multi-result (`v`/`top` protocol), C>0 materializes C-1 registers.
pub(crate) fn install_results(frame: &mut LuaFrame, a: usize, c: usize, results: Varargs) {
    if c == 0 {
        frame.top = a + results.narg();
        frame.v = results;
    } else {
        for j in 1..c {
            frame.stack[a + j - 1] = results.arg(j);
        }
        frame.v = Varargs::None;
    }
}

fn install_tfor_results(frame: &mut LuaFrame, a: usize, c: usize, results: Varargs) {
    for j in 1..=c {
        frame.stack[a + 2 + j] = results.arg(j);
    }
    frame.v = Varargs::None;
}

/// Generic callee dispatch: Lua closures get the execution-stack handle
/// propagated and enter through the mode's raw entry; host callables run
/// in a HostScope; tables and userdata chase `__call`. Tail-call
/// trampolines are evaluated here until a concrete result emerges.
pub(crate) fn call_value(
    vm: &LuaVM,
    handle: &StackHandle,
    callee: LuaValue,
    args: Varargs,
    mode: CallMode,
) -> LuaResult<Flow> {
    let mut callee = callee;
    let mut args = args;
    // Bounded __call chase plus trampoline evaluation.
    for _ in 0..100 {
        match &callee {
            LuaValue::Function(LuaFunction::Lua(closure)) => {
                let closure = closure.clone();
                closure.attach_stack(handle.clone());
                let flow = match mode {
                    CallMode::Sync => closure.on_invoke(vm, args)?,
                    CallMode::Suspendable => closure.on_suspendable_invoke(vm, args)?,
                };
                match flow {
                    Flow::TailCall(next, next_args) => {
                        callee = next;
                        args = next_args;
                        continue;
                    }
                    concrete => return Ok(concrete),
                }
            }
            LuaValue::Function(LuaFunction::Host(host)) => {
                let host = host.clone();
                let mut scope = HostScope {
                    vm,
                    stack: handle.clone(),
                    args,
                };
                return match host.invoke(&mut scope) {
                    Ok(HostReturn::Values(values)) => Ok(Flow::Values(values)),
                    Ok(HostReturn::Suspend) => match mode {
                        CallMode::Suspendable => {
                            debug!("host '{}' suspended the runtime", host.name());
                            Ok(Flow::Suspend)
                        }
                        CallMode::Sync => Err(LuaError::new(
                            "attempt to suspend a non-suspendable call",
                        )),
                    },
                    Err(e) => Err(e),
                };
            }
            other => {
                // `__call` makes tables and userdata callable; the callee
                // itself becomes the first argument.
                let meta = table_ops::call_metamethod(other);
                match meta {
                    Some(handler) => {
                        let mut full = vec![other.clone()];
                        full.extend(args.to_vec());
                        callee = handler;
                        args = Varargs::many(full);
                        continue;
                    }
                    None => {
                        return Err(LuaError::new(format!(
                            "attempt to call a {} value",
                            other.type_name()
                        )));
                    }
                }
            }
        }
    }
    Err(LuaError::new("'__call' chain too long; possible loop"))
}
