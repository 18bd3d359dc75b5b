// Snapshot serializer: close-on-serialize, level normalization, then an
// identity-preserving flatten of everything reachable from the frames.
//
// Identity is tracked per aggregate by pointer; the first visit
// pre-registers a placeholder record before descending, so recursive
// structures (a closure whose upvalue holds the closure itself, a table
// containing itself) terminate and flatten into plain index links.

use std::collections::HashMap;
use std::rc::Rc;

use log::debug;

use crate::lua_value::{LuaFunction, LuaUserData, LuaTable, LuaValue, Prototype};
use crate::lua_vm::upvalue::UpValue;
use crate::lua_vm::{LuaClosure, LuaFrame, StackHandle, UpvalueCell, HOST_LEVEL_NONE};
use crate::snapshot::graph::{
    ClosureRec, FrameRec, ProtoRec, SnapshotGraph, TableRec, UpvalueDescRec, UpvalueRec,
    UserDataRec, ValueRec, SNAPSHOT_VERSION,
};
use crate::snapshot::SnapshotError;

use std::cell::RefCell;

/// Serialize a live execution stack to snapshot bytes.
///
/// Mutates the stack first, as the snapshot contract requires: every open
/// upvalue cell is closed (preserving value identity across the
/// snapshot), then `host_level` is pointed at the pending host call and
/// `current_level` reset so resumption re-descends from the root.
pub fn serialize_execution_context(handle: &StackHandle) -> Result<Vec<u8>, SnapshotError> {
    {
        let mut stack = handle.borrow_mut();
        for frame in stack.frames.iter_mut() {
            frame.close_all_upvalues();
        }
        if stack.host_level == HOST_LEVEL_NONE {
            stack.host_level = stack.current_level;
            stack.current_level = 0;
        }
    }

    let stack = handle.borrow();
    let mut flat = Flattener::default();
    let mut frames = Vec::with_capacity(stack.frames.len());
    for frame in &stack.frames {
        frames.push(flat.frame_rec(frame)?);
    }
    let return_value = flat.value_rec(&stack.return_value)?;

    let graph = SnapshotGraph {
        version: SNAPSHOT_VERSION,
        protos: flat.protos,
        tables: flat.tables,
        userdata: flat.userdata,
        upvalues: flat.upvalues,
        closures: flat.closures,
        frames,
        current_level: stack.current_level as u64,
        host_level: stack.host_level as u64,
        return_value,
        user_end_call: stack.user_end_call,
        script_start_time: stack.script_start_time,
    };

    let bytes = bincode::serialize(&graph).map_err(SnapshotError::Encode)?;
    debug!(
        "snapshot written: {} frames, {} closures, {} tables, {} bytes",
        graph.frames.len(),
        graph.closures.len(),
        graph.tables.len(),
        bytes.len()
    );
    Ok(bytes)
}

#[derive(Default)]
struct Flattener {
    protos: Vec<ProtoRec>,
    proto_ids: HashMap<usize, u32>,
    tables: Vec<TableRec>,
    table_ids: HashMap<usize, u32>,
    userdata: Vec<UserDataRec>,
    userdata_ids: HashMap<usize, u32>,
    upvalues: Vec<UpvalueRec>,
    upvalue_ids: HashMap<usize, u32>,
    closures: Vec<ClosureRec>,
    closure_ids: HashMap<usize, u32>,
}

impl Flattener {
    fn value_rec(&mut self, value: &LuaValue) -> Result<ValueRec, SnapshotError> {
        Ok(match value {
            LuaValue::Nil => ValueRec::Nil,
            LuaValue::Boolean(b) => ValueRec::Bool(*b),
            LuaValue::Integer(i) => ValueRec::Int(*i),
            LuaValue::Number(n) => ValueRec::Num(*n),
            LuaValue::String(s) => ValueRec::Str(s.to_string()),
            LuaValue::Table(t) => ValueRec::Table(self.table_id(t)?),
            LuaValue::Function(LuaFunction::Lua(c)) => ValueRec::Closure(self.closure_id(c)?),
            LuaValue::Function(LuaFunction::Host(h)) => ValueRec::Host(h.name().to_string()),
            LuaValue::UserData(u) => ValueRec::UserData(self.userdata_id(u)?),
        })
    }

    fn table_id(&mut self, table: &Rc<RefCell<LuaTable>>) -> Result<u32, SnapshotError> {
        let key = Rc::as_ptr(table) as usize;
        if let Some(id) = self.table_ids.get(&key) {
            return Ok(*id);
        }
        let id = self.tables.len() as u32;
        self.tables.push(TableRec::default());
        self.table_ids.insert(key, id);

        let (entries, metatable) = {
            let t = table.borrow();
            (t.entries(), t.metatable())
        };
        let mut rec_entries = Vec::with_capacity(entries.len());
        for (k, v) in entries {
            rec_entries.push((self.value_rec(&k)?, self.value_rec(&v)?));
        }
        let metatable = match metatable {
            Some(mt) => Some(self.value_rec(&mt)?),
            None => None,
        };
        self.tables[id as usize] = TableRec {
            entries: rec_entries,
            metatable,
        };
        Ok(id)
    }

    fn userdata_id(&mut self, ud: &Rc<LuaUserData>) -> Result<u32, SnapshotError> {
        let key = Rc::as_ptr(ud) as usize;
        if let Some(id) = self.userdata_ids.get(&key) {
            return Ok(*id);
        }
        let id = self.userdata.len() as u32;
        self.userdata.push(UserDataRec::default());
        self.userdata_ids.insert(key, id);

        let metatable = match ud.metatable.borrow().clone() {
            Some(mt) => Some(self.value_rec(&mt)?),
            None => None,
        };
        self.userdata[id as usize] = UserDataRec {
            name: ud.name.to_string(),
            metatable,
        };
        Ok(id)
    }

    fn closure_id(&mut self, closure: &Rc<LuaClosure>) -> Result<u32, SnapshotError> {
        let key = Rc::as_ptr(closure) as usize;
        if let Some(id) = self.closure_ids.get(&key) {
            return Ok(*id);
        }
        let id = self.closures.len() as u32;
        self.closures.push(ClosureRec::default());
        self.closure_ids.insert(key, id);

        let proto = self.proto_id(&closure.proto)?;
        let env = self.value_rec(&closure.env)?;
        let mut upvalues = Vec::with_capacity(closure.upvalues.len());
        for cell in &closure.upvalues {
            upvalues.push(self.upvalue_id(cell)?);
        }
        self.closures[id as usize] = ClosureRec {
            proto,
            env,
            upvalues,
        };
        Ok(id)
    }

    fn upvalue_id(&mut self, cell: &UpvalueCell) -> Result<u32, SnapshotError> {
        let key = Rc::as_ptr(cell) as usize;
        if let Some(id) = self.upvalue_ids.get(&key) {
            return Ok(*id);
        }
        let id = self.upvalues.len() as u32;
        self.upvalues.push(UpvalueRec {
            value: ValueRec::Nil,
        });
        self.upvalue_ids.insert(key, id);

        let value = match &*cell.borrow() {
            // close-on-serialize ran over every frame; a still-open cell
            // would alias a register the snapshot cannot express.
            UpValue::Open { .. } => return Err(SnapshotError::OpenUpvalue),
            UpValue::Closed(v) => v.clone(),
        };
        let value = self.value_rec(&value)?;
        self.upvalues[id as usize].value = value;
        Ok(id)
    }

    fn proto_id(&mut self, proto: &Rc<Prototype>) -> Result<u32, SnapshotError> {
        let key = Rc::as_ptr(proto) as usize;
        if let Some(id) = self.proto_ids.get(&key) {
            return Ok(*id);
        }
        let id = self.protos.len() as u32;
        self.protos.push(ProtoRec::default());
        self.proto_ids.insert(key, id);

        let mut constants = Vec::with_capacity(proto.constants.len());
        for k in &proto.constants {
            match k {
                LuaValue::Nil
                | LuaValue::Boolean(_)
                | LuaValue::Integer(_)
                | LuaValue::Number(_)
                | LuaValue::String(_) => constants.push(self.value_rec(k)?),
                _ => return Err(SnapshotError::BadConstant),
            }
        }
        let mut children = Vec::with_capacity(proto.protos.len());
        for child in &proto.protos {
            children.push(self.proto_id(child)?);
        }
        self.protos[id as usize] = ProtoRec {
            code: proto.code.clone(),
            constants,
            protos: children,
            upvalue_descs: proto
                .upvalue_descs
                .iter()
                .map(|d| UpvalueDescRec {
                    name: d.name.to_string(),
                    instack: d.instack,
                    idx: d.idx,
                })
                .collect(),
            num_params: proto.num_params,
            is_vararg: proto.is_vararg,
            max_stack_size: proto.max_stack_size,
            source: proto.source.to_string(),
            line_defined: proto.line_defined,
            last_line_defined: proto.last_line_defined,
            line_info: proto.line_info.clone(),
            locals: proto
                .locals
                .iter()
                .map(|l| (l.name.to_string(), l.start_pc, l.end_pc))
                .collect(),
        };
        Ok(id)
    }

    fn frame_rec(&mut self, frame: &LuaFrame) -> Result<FrameRec, SnapshotError> {
        let closure = self.closure_id(&frame.closure)?;
        let mut registers = Vec::with_capacity(frame.stack.len());
        for r in &frame.stack {
            registers.push(self.value_rec(r)?);
        }
        let mut pending = Vec::new();
        for v in frame.v.to_vec() {
            pending.push(self.value_rec(&v)?);
        }
        let mut varargs = Vec::new();
        for v in frame.varargs.to_vec() {
            varargs.push(self.value_rec(&v)?);
        }
        Ok(FrameRec {
            closure,
            pc: frame.pc as u64,
            registers,
            top: frame.top as u64,
            pending,
            varargs,
        })
    }
}
