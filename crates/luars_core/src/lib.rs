// Lua Runtime Core
// Values, garbage-collected heap, tables, calls, coroutines and bytecode
// dispatch of a Lua 5.4 virtual machine. Source compilation and the
// standard library live outside this crate and reach it through `LuaVM`.

#[cfg(test)]
mod test;

pub mod gc;
pub mod lua_value;
pub mod lua_vm;

#[cfg(feature = "serde")]
pub mod serde;

pub use gc::{FunctionId, GcKind, GcStats, StringId, TableId, ThreadId, UpvalueId, UserdataId};
pub use lua_value::{Chunk, CoStatus, LuaTable, LuaUserdata, LuaValue};
pub use lua_vm::{
    CFunction, CompareOp, GcOption, Instruction, KFunction, LuaError, LuaResult, LuaStatus, LuaVM, OpCode,
    SafeOption, upvalue_index,
};
