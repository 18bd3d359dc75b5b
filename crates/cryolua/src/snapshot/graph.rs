// Flattened snapshot records. Aggregates reference each other by index
// into the per-kind pools, never by pointer, so the container round-trips
// through any serde format; bincode is the one the engine ships.

use serde::{Deserialize, Serialize};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ValueRec {
    Nil,
    Bool(bool),
    Int(i64),
    Num(f64),
    Str(String),
    Table(u32),
    Closure(u32),
    /// Host callable, rebound by registered name on restore.
    Host(String),
    UserData(u32),
}

impl Default for ValueRec {
    fn default() -> Self {
        ValueRec::Nil
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProtoRec {
    pub code: Vec<u32>,
    pub constants: Vec<ValueRec>,
    /// Child prototype pool indices.
    pub protos: Vec<u32>,
    pub upvalue_descs: Vec<UpvalueDescRec>,
    pub num_params: u8,
    pub is_vararg: u8,
    pub max_stack_size: u8,
    pub source: String,
    pub line_defined: u32,
    pub last_line_defined: u32,
    pub line_info: Vec<u32>,
    pub locals: Vec<(String, u32, u32)>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpvalueDescRec {
    pub name: String,
    pub instack: bool,
    pub idx: u8,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TableRec {
    pub entries: Vec<(ValueRec, ValueRec)>,
    pub metatable: Option<ValueRec>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UserDataRec {
    pub name: String,
    pub metatable: Option<ValueRec>,
}

/// Upvalue cells are force-closed before serialization, so a record is
/// just the owned value.
#[derive(Debug, Serialize, Deserialize)]
pub struct UpvalueRec {
    pub value: ValueRec,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ClosureRec {
    pub proto: u32,
    pub env: ValueRec,
    /// Upvalue cell pool indices; sharing between sibling closures
    /// survives the round trip.
    pub upvalues: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FrameRec {
    pub closure: u32,
    pub pc: u64,
    pub registers: Vec<ValueRec>,
    pub top: u64,
    pub pending: Vec<ValueRec>,
    pub varargs: Vec<ValueRec>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotGraph {
    pub version: u32,
    pub protos: Vec<ProtoRec>,
    pub tables: Vec<TableRec>,
    pub userdata: Vec<UserDataRec>,
    pub upvalues: Vec<UpvalueRec>,
    pub closures: Vec<ClosureRec>,
    pub frames: Vec<FrameRec>,
    pub current_level: u64,
    pub host_level: u64,
    pub return_value: ValueRec,
    pub user_end_call: bool,
    pub script_start_time: i64,
}
