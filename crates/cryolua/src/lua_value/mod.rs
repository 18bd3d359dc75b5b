// Value model: tagged values, tables, varargs bundles, prototypes and the
// binary chunk loader.

pub mod chunk_loader;
mod lua_table;
mod lua_value;
mod prototype;
mod varargs;

pub use chunk_loader::{dump_chunk, load_chunk, ChunkError};
pub use lua_table::LuaTable;
pub use lua_value::{fmt_number, parse_number, LuaFunction, LuaUserData, LuaValue, LuaValueKind};
pub use prototype::{LocalVar, Prototype, UpvalueDesc};
pub use varargs::{Buffer, Varargs};
