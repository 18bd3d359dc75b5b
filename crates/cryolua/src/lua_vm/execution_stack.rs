// ExecutionStack - the full call chain plus resume bookkeeping.
//
// Shared behind a handle between the root closure and every closure the
// dispatch loop enters, so a suspending host callable can capture and
// serialize the live chain, and so resumption can re-descend through it.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use crate::lua_value::LuaValue;
use crate::lua_vm::LuaFrame;

/// Sentinel: no host splice pending.
pub const HOST_LEVEL_NONE: usize = usize::MAX;

pub type StackHandle = Rc<RefCell<ExecutionStack>>;

pub struct ExecutionStack {
    pub frames: Vec<LuaFrame>,
    /// Index of the frame currently being advanced.
    pub current_level: usize,
    /// Depth at which a host call is pending: on resume, the OP_CALL at
    /// this level splices `return_value` instead of dispatching.
    pub host_level: usize,
    /// Value the host supplies for resumption.
    pub return_value: LuaValue,
    /// Cooperative stop request.
    pub user_end_call: bool,
    /// Epoch seconds when this chain was created.
    pub script_start_time: i64,
}

impl ExecutionStack {
    pub fn new() -> ExecutionStack {
        ExecutionStack {
            frames: Vec::new(),
            current_level: 0,
            host_level: HOST_LEVEL_NONE,
            return_value: LuaValue::Nil,
            user_end_call: false,
            script_start_time: chrono::Utc::now().timestamp(),
        }
    }

    pub fn new_handle() -> StackHandle {
        Rc::new(RefCell::new(ExecutionStack::new()))
    }

    pub fn frame(&self, level: usize) -> &LuaFrame {
        &self.frames[level]
    }

    pub fn frame_mut(&mut self, level: usize) -> &mut LuaFrame {
        &mut self.frames[level]
    }

    /// Register read through an open upvalue's (level, slot) alias.
    pub fn register(&self, level: usize, slot: usize) -> LuaValue {
        self.frames[level].stack.get(slot).cloned().unwrap_or(LuaValue::Nil)
    }

    pub fn set_register(&mut self, level: usize, slot: usize, value: LuaValue) {
        if let Some(r) = self.frames[level].stack.get_mut(slot) {
            *r = value;
        }
    }

    /// One-shot consumption of the host-supplied resume value.
    pub fn take_return_value(&mut self) -> LuaValue {
        std::mem::replace(&mut self.return_value, LuaValue::Nil)
    }

    /// Normalize levels after a suspension has unwound to the root, so the
    /// splice engages at the deepest frame on the next entry. A snapshot
    /// taken inside the suspending callable has already done this; the
    /// sentinel check keeps the normalization single-shot.
    pub fn mark_suspended(&mut self) {
        if self.host_level == HOST_LEVEL_NONE {
            self.host_level = self.current_level;
            self.current_level = 0;
            debug!(
                "suspended: host_level={} frames={}",
                self.host_level,
                self.frames.len()
            );
        }
    }

    /// Stop protocol: flag the chain and park every frame on its RETURN
    /// epilogue so one resume unwinds the whole chain.
    pub fn stop(&mut self) {
        self.user_end_call = true;
        for frame in &mut self.frames {
            frame.force_return_pc();
        }
        debug!("stop requested: {} frames parked on epilogue", self.frames.len());
    }
}

impl Default for ExecutionStack {
    fn default() -> Self {
        ExecutionStack::new()
    }
}

impl std::fmt::Debug for ExecutionStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStack")
            .field("frames", &self.frames.len())
            .field("current_level", &self.current_level)
            .field(
                "host_level",
                &(if self.host_level == HOST_LEVEL_NONE {
                    None
                } else {
                    Some(self.host_level)
                }),
            )
            .field("user_end_call", &self.user_end_call)
            .finish()
    }
}
