/*----------------------------------------------------------------------
  Instruction interpreter over the Lua 5.2 opcode set.

  One loop serves both dispatch flavors: CallMode::Sync refuses host
  suspension at the call boundary, CallMode::Suspendable lets it yield.
  The only opcodes that consult the mode are CALL, TAILCALL and TFORCALL
  - the engine's only suspension points.

  The frame being advanced lives inside the shared execution stack, so
  every register access goes through a short-lived borrow. Nothing holds
  a borrow across a nested call: a suspending host callable can take a
  clean borrow of the whole chain to serialize it.
----------------------------------------------------------------------*/

mod call;
mod table_ops;

pub(crate) use call::call_value;

use std::rc::Rc;

use crate::lua_value::{Buffer, LuaValue, Varargs};
use crate::lua_vm::upvalue::{upvalue_get, upvalue_set};
use crate::lua_vm::{
    CallMode, Flow, Instruction, LuaClosure, LuaError, LuaFrame, LuaResult, LuaVM, OpCode,
    StackHandle,
};

use call::{op_call, op_tforcall, StepOutcome};

/// Run the frame at `level` until it returns, tail-calls out, suspends or
/// raises. Errors pick up the frame's source position on the way through.
pub fn execute(
    vm: &LuaVM,
    handle: &StackHandle,
    level: usize,
    mode: CallMode,
) -> LuaResult<Flow> {
    match run_frame(vm, handle, level, mode) {
        Err(mut e) => {
            let stack = handle.borrow();
            if let Some(frame) = stack.frames.get(level) {
                let where_ = frame.closure.proto.fileline(frame.pc);
                e.stamp_fileline(where_.clone());
                e.push_traceback(format!("{}: in function", where_));
            }
            Err(e)
        }
        ok => ok,
    }
}

fn run_frame(
    vm: &LuaVM,
    handle: &StackHandle,
    level: usize,
    mode: CallMode,
) -> LuaResult<Flow> {
    let (closure, mut pc) = {
        let stack = handle.borrow();
        let frame = stack.frame(level);
        (frame.closure.clone(), frame.pc)
    };
    let proto = closure.proto.clone();
    let code = &proto.code;
    let k = &proto.constants;

    loop {
        if pc >= code.len() {
            return Err(LuaError::new(format!(
                "pc {} out of range in {}",
                pc, proto.source
            )));
        }
        // Keep the persisted pc on the instruction being executed: the
        // snapshot and the error path both read it.
        handle.borrow_mut().frame_mut(level).pc = pc;

        let inst = Instruction(code[pc]);
        let op = inst
            .opcode()
            .ok_or_else(|| illegal_opcode(inst, &proto.source))?;

        match op {
            OpCode::Move => {
                let value = reg(handle, level, inst.b());
                set_reg(handle, level, inst.a(), value);
            }
            OpCode::LoadK => {
                set_reg(handle, level, inst.a(), constant(k, inst.bx())?);
            }
            OpCode::LoadKX => {
                let next = Instruction(*code.get(pc + 1).ok_or_else(|| {
                    LuaError::new("LOADKX without EXTRAARG")
                })?);
                if next.opcode() != Some(OpCode::ExtraArg) {
                    return Err(LuaError::new("LOADKX without EXTRAARG"));
                }
                set_reg(handle, level, inst.a(), constant(k, next.ax())?);
                pc += 1;
            }
            OpCode::LoadBool => {
                set_reg(handle, level, inst.a(), LuaValue::Boolean(inst.b() != 0));
                if inst.c() != 0 {
                    pc += 1;
                }
            }
            OpCode::LoadNil => {
                let a = inst.a();
                let mut stack = handle.borrow_mut();
                let frame = stack.frame_mut(level);
                for r in a..=a + inst.b() {
                    frame.stack[r] = LuaValue::Nil;
                }
            }
            OpCode::GetUpval => {
                let cell = upvalue_cell(&closure, inst.b())?;
                set_reg(handle, level, inst.a(), upvalue_get(handle, &cell));
            }
            OpCode::SetUpval => {
                let cell = upvalue_cell(&closure, inst.b())?;
                upvalue_set(handle, &cell, reg(handle, level, inst.a()));
            }
            OpCode::GetTabUp => {
                let cell = upvalue_cell(&closure, inst.b())?;
                let table = upvalue_get(handle, &cell);
                let key = rk(handle, level, k, inst.c())?;
                let value = table_ops::index_value(vm, handle, table, key)?;
                set_reg(handle, level, inst.a(), value);
            }
            OpCode::GetTable => {
                let table = reg(handle, level, inst.b());
                let key = rk(handle, level, k, inst.c())?;
                let value = table_ops::index_value(vm, handle, table, key)?;
                set_reg(handle, level, inst.a(), value);
            }
            OpCode::SetTabUp => {
                let cell = upvalue_cell(&closure, inst.a())?;
                let table = upvalue_get(handle, &cell);
                let key = rk(handle, level, k, inst.b())?;
                let value = rk(handle, level, k, inst.c())?;
                table_ops::newindex_value(vm, handle, table, key, value)?;
            }
            OpCode::SetTable => {
                let table = reg(handle, level, inst.a());
                let key = rk(handle, level, k, inst.b())?;
                let value = rk(handle, level, k, inst.c())?;
                table_ops::newindex_value(vm, handle, table, key, value)?;
            }
            OpCode::NewTable => {
                let table = LuaValue::table(crate::lua_value::LuaTable::new(
                    fb2int(inst.b()),
                    fb2int(inst.c()),
                ));
                set_reg(handle, level, inst.a(), table);
            }
            OpCode::SelfOp => {
                let obj = reg(handle, level, inst.b());
                let key = rk(handle, level, k, inst.c())?;
                let method = table_ops::index_value(vm, handle, obj.clone(), key)?;
                let a = inst.a();
                let mut stack = handle.borrow_mut();
                let frame = stack.frame_mut(level);
                frame.stack[a + 1] = obj;
                frame.stack[a] = method;
            }
            OpCode::Add => arith_arm(handle, level, k, inst, LuaValue::add)?,
            OpCode::Sub => arith_arm(handle, level, k, inst, LuaValue::sub)?,
            OpCode::Mul => arith_arm(handle, level, k, inst, LuaValue::mul)?,
            OpCode::Div => arith_arm(handle, level, k, inst, LuaValue::div)?,
            OpCode::Mod => arith_arm(handle, level, k, inst, LuaValue::modulo)?,
            OpCode::Pow => arith_arm(handle, level, k, inst, LuaValue::pow)?,
            OpCode::Unm => {
                let value = reg(handle, level, inst.b()).unm()?;
                set_reg(handle, level, inst.a(), value);
            }
            OpCode::Not => {
                let value = reg(handle, level, inst.b()).not();
                set_reg(handle, level, inst.a(), value);
            }
            OpCode::Len => {
                let value = reg(handle, level, inst.b()).len()?;
                set_reg(handle, level, inst.a(), value);
            }
            OpCode::Concat => {
                let mut buffer = Buffer::new();
                for r in inst.b()..=inst.c() {
                    let value = reg(handle, level, r);
                    buffer.push(&value)?;
                }
                set_reg(handle, level, inst.a(), buffer.value());
            }
            OpCode::Jmp => {
                let a = inst.a();
                if a > 0 {
                    handle
                        .borrow_mut()
                        .frame_mut(level)
                        .close_upvalues_from(a - 1);
                }
                pc = offset_pc(pc, inst.sbx());
            }
            OpCode::Eq => {
                let lhs = rk(handle, level, k, inst.b())?;
                let rhs = rk(handle, level, k, inst.c())?;
                if lhs.lua_eq(&rhs) != (inst.a() != 0) {
                    pc += 1;
                }
            }
            OpCode::Lt => {
                let lhs = rk(handle, level, k, inst.b())?;
                let rhs = rk(handle, level, k, inst.c())?;
                if lhs.lt(&rhs)? != (inst.a() != 0) {
                    pc += 1;
                }
            }
            OpCode::Le => {
                let lhs = rk(handle, level, k, inst.b())?;
                let rhs = rk(handle, level, k, inst.c())?;
                if lhs.le(&rhs)? != (inst.a() != 0) {
                    pc += 1;
                }
            }
            OpCode::Test => {
                if reg(handle, level, inst.a()).to_boolean() != (inst.c() != 0) {
                    pc += 1;
                }
            }
            OpCode::TestSet => {
                let value = reg(handle, level, inst.b());
                if value.to_boolean() == (inst.c() != 0) {
                    set_reg(handle, level, inst.a(), value);
                } else {
                    pc += 1;
                }
            }
            OpCode::Call => match op_call(vm, handle, level, mode, inst)? {
                StepOutcome::Continue => {}
                StepOutcome::Suspend => return Ok(Flow::Suspend),
            },
            OpCode::TailCall => {
                let (callee, args) = {
                    let stack = handle.borrow();
                    let frame = stack.frame(level);
                    let a = inst.a();
                    let callee = frame.stack[a].clone();
                    let args = gather_args(frame, a, inst.b());
                    (callee, args)
                };
                // The trampoline is evaluated by the caller after this
                // frame is gone; its locals do not survive the tail call.
                return Ok(Flow::TailCall(callee, args));
            }
            OpCode::Return => {
                let stack = handle.borrow();
                let frame = stack.frame(level);
                let a = inst.a();
                let result = match inst.b() {
                    0 => open_list(frame, a),
                    1 => Varargs::None,
                    2 => Varargs::One(frame.stack[a].clone()),
                    b => {
                        let mut values = Vec::with_capacity(b - 1);
                        for r in a..a + b - 1 {
                            values.push(frame.stack[r].clone());
                        }
                        Varargs::many(values)
                    }
                };
                return Ok(Flow::Values(result));
            }
            OpCode::ForPrep => {
                let a = inst.a();
                let (init, limit, step) = {
                    let stack = handle.borrow();
                    let frame = stack.frame(level);
                    (
                        frame.stack[a].check_for_number("initial value")?,
                        frame.stack[a + 1].check_for_number("limit")?,
                        frame.stack[a + 2].check_for_number("step")?,
                    )
                };
                let start = init.sub(&step)?;
                let mut stack = handle.borrow_mut();
                let frame = stack.frame_mut(level);
                frame.stack[a] = start;
                frame.stack[a + 1] = limit;
                frame.stack[a + 2] = step;
                drop(stack);
                pc = offset_pc(pc, inst.sbx());
            }
            OpCode::ForLoop => {
                let a = inst.a();
                let (idx, limit, step) = {
                    let stack = handle.borrow();
                    let frame = stack.frame(level);
                    (
                        frame.stack[a].clone(),
                        frame.stack[a + 1].clone(),
                        frame.stack[a + 2].clone(),
                    )
                };
                let next = idx.add(&step)?;
                let positive = step.to_number().unwrap_or(0.0) > 0.0;
                let cont = if positive {
                    next.le(&limit)?
                } else {
                    next.gteq_b(&limit)?
                };
                if cont {
                    let mut stack = handle.borrow_mut();
                    let frame = stack.frame_mut(level);
                    frame.stack[a] = next.clone();
                    frame.stack[a + 3] = next;
                    drop(stack);
                    pc = offset_pc(pc, inst.sbx());
                }
            }
            OpCode::TForCall => match op_tforcall(vm, handle, level, mode, inst)? {
                StepOutcome::Continue => {}
                StepOutcome::Suspend => return Ok(Flow::Suspend),
            },
            OpCode::TForLoop => {
                let a = inst.a();
                let control = reg(handle, level, a + 1);
                if !control.is_nil() {
                    set_reg(handle, level, a, control);
                    pc = offset_pc(pc, inst.sbx());
                }
            }
            OpCode::SetList => {
                pc = op_setlist(handle, level, code, pc, inst)?;
            }
            OpCode::Closure => {
                let child = proto
                    .protos
                    .get(inst.bx())
                    .cloned()
                    .ok_or_else(|| illegal_opcode(inst, &proto.source))?;
                let mut ups = Vec::with_capacity(child.upvalue_descs.len());
                {
                    let mut stack = handle.borrow_mut();
                    let frame = stack.frame_mut(level);
                    for desc in &child.upvalue_descs {
                        if desc.instack {
                            ups.push(frame.find_upvalue(level, desc.idx as usize));
                        } else {
                            ups.push(
                                closure
                                    .upvalues
                                    .get(desc.idx as usize)
                                    .cloned()
                                    .ok_or_else(|| LuaError::new("No space for upvalue"))?,
                            );
                        }
                    }
                }
                let new_closure = LuaClosure::new(child, closure.env.clone(), ups);
                set_reg(handle, level, inst.a(), LuaValue::closure(new_closure));
            }
            OpCode::Vararg => {
                let a = inst.a();
                let b = inst.b();
                let mut stack = handle.borrow_mut();
                let frame = stack.frame_mut(level);
                if b == 0 {
                    frame.v = frame.varargs.clone();
                    frame.top = a + frame.v.narg();
                } else {
                    for j in 1..b {
                        frame.stack[a + j - 1] = frame.varargs.arg(j);
                    }
                }
            }
            OpCode::ExtraArg => {
                // Only ever consumed by LOADKX / SETLIST.
                return Err(illegal_opcode(inst, &proto.source));
            }
        }

        pc += 1;
    }
}

// ============ Register & operand helpers ============

fn reg(handle: &StackHandle, level: usize, index: usize) -> LuaValue {
    handle.borrow().frame(level).stack[index].clone()
}

fn set_reg(handle: &StackHandle, level: usize, index: usize, value: LuaValue) {
    handle.borrow_mut().frame_mut(level).stack[index] = value;
}

fn constant(k: &[LuaValue], index: usize) -> LuaResult<LuaValue> {
    k.get(index)
        .cloned()
        .ok_or_else(|| LuaError::new("constant index out of range"))
}

/// RK operand: bit 8 selects the constant pool.
fn rk(handle: &StackHandle, level: usize, k: &[LuaValue], x: usize) -> LuaResult<LuaValue> {
    if Instruction::rk_is_constant(x) {
        constant(k, Instruction::rk_index(x))
    } else {
        Ok(reg(handle, level, x))
    }
}

fn arith_arm(
    handle: &StackHandle,
    level: usize,
    k: &[LuaValue],
    inst: Instruction,
    op: fn(&LuaValue, &LuaValue) -> LuaResult<LuaValue>,
) -> LuaResult<()> {
    let lhs = rk(handle, level, k, inst.b())?;
    let rhs = rk(handle, level, k, inst.c())?;
    set_reg(handle, level, inst.a(), op(&lhs, &rhs)?);
    Ok(())
}

fn offset_pc(pc: usize, sbx: i32) -> usize {
    (pc as i64 + sbx as i64) as usize
}

fn upvalue_cell(
    closure: &Rc<LuaClosure>,
    index: usize,
) -> LuaResult<crate::lua_vm::UpvalueCell> {
    closure
        .upvalues
        .get(index)
        .cloned()
        .ok_or_else(|| LuaError::new("No space for upvalue"))
}

fn illegal_opcode(inst: Instruction, source: &str) -> LuaError {
    LuaError::new(format!(
        "illegal opcode 0x{:02x} in {}",
        inst.raw_opcode(),
        source
    ))
}

/// Floating-point-byte decode for NEWTABLE size hints.
fn fb2int(x: usize) -> usize {
    if x < 8 {
        x
    } else {
        ((x & 7) + 8) << ((x >> 3) - 1)
    }
}

/// The open-ended value list starting at register `from`: materialized
/// registers up to `top - v.narg()`, then the pending multi-result `v`.
pub(crate) fn open_list(frame: &LuaFrame, from: usize) -> Varargs {
    let head_end = frame.top.saturating_sub(frame.v.narg());
    let mut values = Vec::new();
    let mut r = from;
    while r < head_end {
        values.push(frame.stack[r].clone());
        r += 1;
    }
    Varargs::of(values, frame.v.clone())
}

/// Call/tailcall argument gather for operand B.
pub(crate) fn gather_args(frame: &LuaFrame, a: usize, b: usize) -> Varargs {
    if b == 0 {
        open_list(frame, a + 1)
    } else {
        let mut values = Vec::with_capacity(b - 1);
        for r in a + 1..a + b {
            values.push(frame.stack[r].clone());
        }
        Varargs::many(values)
    }
}

fn op_setlist(
    handle: &StackHandle,
    level: usize,
    code: &[u32],
    pc: usize,
    inst: Instruction,
) -> LuaResult<usize> {
    const FIELDS_PER_FLUSH: usize = 50;

    let a = inst.a();
    let b = inst.b();
    let mut pc = pc;
    let c = if inst.c() != 0 {
        inst.c()
    } else {
        // Extra arg in the next instruction word; the loop's normal
        // advance then steps past it (net pc advance of 2).
        let next = Instruction(
            *code
                .get(pc + 1)
                .ok_or_else(|| LuaError::new("SETLIST without EXTRAARG"))?,
        );
        if next.opcode() != Some(OpCode::ExtraArg) {
            return Err(LuaError::new("SETLIST without EXTRAARG"));
        }
        pc += 1;
        next.ax()
    };

    let (table, values) = {
        let stack = handle.borrow();
        let frame = stack.frame(level);
        let values = if b == 0 {
            open_list(frame, a + 1)
        } else {
            let mut vals = Vec::with_capacity(b);
            for r in a + 1..=a + b {
                vals.push(frame.stack[r].clone());
            }
            Varargs::many(vals)
        };
        (frame.stack[a].clone(), values)
    };

    let Some(table) = table.as_table().cloned() else {
        return Err(LuaError::new(format!(
            "attempt to index a {} value",
            table.type_name()
        )));
    };
    let offset = (c - 1) * FIELDS_PER_FLUSH;
    let n = values.narg();
    {
        let mut t = table.borrow_mut();
        t.presize(offset + n);
        for j in 1..=n {
            t.raw_seti((offset + j) as i64, values.arg(j));
        }
    }
    Ok(pc)
}
