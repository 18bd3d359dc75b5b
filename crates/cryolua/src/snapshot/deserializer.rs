// Snapshot deserializer: rebuild the object graph in dependency order,
// then reattach the execution stack to the root closure.
//
// Order matters because closures are immutable once built: prototypes
// first (children on demand), then empty table and userdata shells and
// nil-filled upvalue cells, then closures (which only need references),
// and only then the contents of tables and cells - which may point back
// at any closure or table.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;
use smol_str::SmolStr;

use crate::lua_value::{LocalVar, LuaTable, LuaUserData, LuaValue, Prototype, UpvalueDesc, Varargs};
use crate::lua_vm::upvalue::UpValue;
use crate::lua_vm::{
    ExecutionStack, LuaClosure, LuaFrame, LuaVM, UpvalueCell,
};
use crate::snapshot::graph::{SnapshotGraph, ValueRec, SNAPSHOT_VERSION};
use crate::snapshot::SnapshotError;

pub fn deserialize_execution_context(
    bytes: &[u8],
    vm: &LuaVM,
) -> Result<Rc<LuaClosure>, SnapshotError> {
    let graph: SnapshotGraph = bincode::deserialize(bytes).map_err(SnapshotError::Decode)?;
    if graph.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(graph.version));
    }
    if graph.frames.is_empty() {
        return Err(SnapshotError::EmptyStack);
    }

    let mut builder = Rebuilder::new(vm, &graph);
    builder.build_protos()?;
    builder.build_shells();
    builder.build_closures()?;
    builder.fill_tables()?;
    builder.fill_userdata()?;
    builder.fill_upvalues()?;
    let stack = builder.build_stack()?;

    let root = stack.borrow().frames[0].closure.clone();
    root.attach_stack(stack.clone());
    debug!(
        "snapshot restored: {} frames, host_level={}",
        stack.borrow().frames.len(),
        graph.host_level
    );
    Ok(root)
}

struct Rebuilder<'a> {
    vm: &'a LuaVM,
    graph: &'a SnapshotGraph,
    protos: Vec<Option<Rc<Prototype>>>,
    tables: Vec<Rc<RefCell<LuaTable>>>,
    userdata: Vec<Rc<LuaUserData>>,
    upvalues: Vec<UpvalueCell>,
    closures: Vec<Rc<LuaClosure>>,
}

impl<'a> Rebuilder<'a> {
    fn new(vm: &'a LuaVM, graph: &'a SnapshotGraph) -> Rebuilder<'a> {
        Rebuilder {
            vm,
            graph,
            protos: vec![None; graph.protos.len()],
            tables: Vec::new(),
            userdata: Vec::new(),
            upvalues: Vec::new(),
            closures: Vec::new(),
        }
    }

    fn build_protos(&mut self) -> Result<(), SnapshotError> {
        for idx in 0..self.graph.protos.len() {
            self.build_proto(idx)?;
        }
        Ok(())
    }

    /// Memoized depth-first build; the prototype tree is acyclic.
    fn build_proto(&mut self, idx: usize) -> Result<Rc<Prototype>, SnapshotError> {
        if let Some(p) = self.protos.get(idx).and_then(|p| p.clone()) {
            return Ok(p);
        }
        let rec = self.graph.protos.get(idx).ok_or(SnapshotError::BadReference)?;

        let mut constants = Vec::with_capacity(rec.constants.len());
        for k in &rec.constants {
            constants.push(match k {
                ValueRec::Nil => LuaValue::Nil,
                ValueRec::Bool(b) => LuaValue::Boolean(*b),
                ValueRec::Int(i) => LuaValue::Integer(*i),
                ValueRec::Num(n) => LuaValue::Number(*n),
                ValueRec::Str(s) => LuaValue::string(s.as_str()),
                _ => return Err(SnapshotError::BadConstant),
            });
        }
        let mut children = Vec::with_capacity(rec.protos.len());
        for child in &rec.protos {
            children.push(self.build_proto(*child as usize)?);
        }
        let proto = Rc::new(Prototype {
            code: rec.code.clone(),
            constants,
            protos: children,
            upvalue_descs: rec
                .upvalue_descs
                .iter()
                .map(|d| UpvalueDesc {
                    name: SmolStr::new(&d.name),
                    instack: d.instack,
                    idx: d.idx,
                })
                .collect(),
            num_params: rec.num_params,
            is_vararg: rec.is_vararg,
            max_stack_size: rec.max_stack_size,
            source: SmolStr::new(&rec.source),
            line_defined: rec.line_defined,
            last_line_defined: rec.last_line_defined,
            line_info: rec.line_info.clone(),
            locals: rec
                .locals
                .iter()
                .map(|(name, start_pc, end_pc)| LocalVar {
                    name: SmolStr::new(name),
                    start_pc: *start_pc,
                    end_pc: *end_pc,
                })
                .collect(),
        });
        self.protos[idx] = Some(proto.clone());
        Ok(proto)
    }

    fn build_shells(&mut self) {
        self.tables = (0..self.graph.tables.len())
            .map(|_| Rc::new(RefCell::new(LuaTable::new(0, 0))))
            .collect();
        self.userdata = self
            .graph
            .userdata
            .iter()
            .map(|rec| {
                Rc::new(LuaUserData {
                    name: SmolStr::new(&rec.name),
                    metatable: RefCell::new(None),
                })
            })
            .collect();
        self.upvalues = (0..self.graph.upvalues.len())
            .map(|_| UpValue::closed_cell(LuaValue::Nil))
            .collect();
    }

    fn build_closures(&mut self) -> Result<(), SnapshotError> {
        for rec in &self.graph.closures {
            let proto = self
                .protos
                .get(rec.proto as usize)
                .and_then(|p| p.clone())
                .ok_or(SnapshotError::BadReference)?;
            let env = self.resolve_shallow(&rec.env)?;
            let mut upvalues = Vec::with_capacity(rec.upvalues.len());
            for id in &rec.upvalues {
                upvalues.push(
                    self.upvalues
                        .get(*id as usize)
                        .cloned()
                        .ok_or(SnapshotError::BadReference)?,
                );
            }
            self.closures.push(LuaClosure::new(proto, env, upvalues));
        }
        Ok(())
    }

    fn fill_tables(&mut self) -> Result<(), SnapshotError> {
        for (idx, rec) in self.graph.tables.iter().enumerate() {
            let table = self.tables[idx].clone();
            let mut t = table.borrow_mut();
            for (k, v) in &rec.entries {
                let key = self.resolve(k)?;
                let value = self.resolve(v)?;
                // Keys in a snapshot were valid when written; re-insertion
                // cannot produce nil or NaN keys.
                let _ = t.raw_set(key, value);
            }
            if let Some(mt) = &rec.metatable {
                t.set_metatable(Some(self.resolve(mt)?));
            }
        }
        Ok(())
    }

    fn fill_userdata(&mut self) -> Result<(), SnapshotError> {
        for (idx, rec) in self.graph.userdata.iter().enumerate() {
            if let Some(mt) = &rec.metatable {
                let resolved = self.resolve(mt)?;
                *self.userdata[idx].metatable.borrow_mut() = Some(resolved);
            }
        }
        Ok(())
    }

    fn fill_upvalues(&mut self) -> Result<(), SnapshotError> {
        for (idx, rec) in self.graph.upvalues.iter().enumerate() {
            let value = self.resolve(&rec.value)?;
            *self.upvalues[idx].borrow_mut() = UpValue::Closed(value);
        }
        Ok(())
    }

    fn build_stack(&mut self) -> Result<crate::lua_vm::StackHandle, SnapshotError> {
        let mut frames = Vec::with_capacity(self.graph.frames.len());
        for rec in &self.graph.frames {
            let closure = self
                .closures
                .get(rec.closure as usize)
                .cloned()
                .ok_or(SnapshotError::BadReference)?;
            let mut registers = Vec::with_capacity(rec.registers.len());
            for r in &rec.registers {
                registers.push(self.resolve(r)?);
            }
            let mut pending = Vec::with_capacity(rec.pending.len());
            for v in &rec.pending {
                pending.push(self.resolve(v)?);
            }
            let mut varargs = Vec::with_capacity(rec.varargs.len());
            for v in &rec.varargs {
                varargs.push(self.resolve(v)?);
            }
            frames.push(LuaFrame {
                closure,
                pc: rec.pc as usize,
                stack: registers,
                top: rec.top as usize,
                v: Varargs::many(pending),
                varargs: Varargs::many(varargs),
                open_upvalues: Vec::new(),
            });
        }

        let mut stack = ExecutionStack::new();
        stack.frames = frames;
        stack.current_level = self.graph.current_level as usize;
        stack.host_level = self.graph.host_level as usize;
        stack.return_value = self.resolve(&self.graph.return_value)?;
        stack.user_end_call = self.graph.user_end_call;
        stack.script_start_time = self.graph.script_start_time;
        Ok(Rc::new(RefCell::new(stack)))
    }

    /// Resolve a record once every pool is populated.
    fn resolve(&self, rec: &ValueRec) -> Result<LuaValue, SnapshotError> {
        self.resolve_shallow(rec)
    }

    /// Resolve against the reference pools; valid as soon as shells and
    /// closures exist, since only identities are needed.
    fn resolve_shallow(&self, rec: &ValueRec) -> Result<LuaValue, SnapshotError> {
        Ok(match rec {
            ValueRec::Nil => LuaValue::Nil,
            ValueRec::Bool(b) => LuaValue::Boolean(*b),
            ValueRec::Int(i) => LuaValue::Integer(*i),
            ValueRec::Num(n) => LuaValue::Number(*n),
            ValueRec::Str(s) => LuaValue::string(s.as_str()),
            ValueRec::Table(id) => LuaValue::Table(
                self.tables
                    .get(*id as usize)
                    .cloned()
                    .ok_or(SnapshotError::BadReference)?,
            ),
            ValueRec::Closure(id) => LuaValue::closure(
                self.closures
                    .get(*id as usize)
                    .cloned()
                    .ok_or(SnapshotError::BadReference)?,
            ),
            ValueRec::Host(name) => LuaValue::host_function(
                self.vm
                    .host_lookup(name)
                    .ok_or_else(|| SnapshotError::UnknownHost(name.clone()))?,
            ),
            ValueRec::UserData(id) => LuaValue::UserData(
                self.userdata
                    .get(*id as usize)
                    .cloned()
                    .ok_or(SnapshotError::BadReference)?,
            ),
        })
    }
}
