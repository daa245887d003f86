/// Serde serialization support for Lua values
///
/// Conversion goes through `serde_json::Value` and needs the VM for
/// string contents and table traversal, so it is exposed as free
/// functions rather than `Serialize`/`Deserialize` impls on `LuaValue`.
mod deserializer;
mod serializer;

pub use deserializer::{from_str as deserialize_from_json_str, from_value as deserialize_from_json};
pub use serializer::{to_string as serialize_to_json_string, to_value as serialize_to_json};

use crate::lua_value::LuaValue;
use crate::lua_vm::LuaVM;

/// Convert a Lua value to a serde_json::Value
pub fn lua_to_json(vm: &LuaVM, lua_value: &LuaValue) -> Result<serde_json::Value, String> {
    serialize_to_json(vm, lua_value)
}

/// Convert a Lua value to a JSON string
pub fn lua_to_json_string(vm: &LuaVM, lua_value: &LuaValue, pretty: bool) -> Result<String, String> {
    serialize_to_json_string(vm, lua_value, pretty)
}

/// Convert a serde_json::Value to a Lua value. The result is not anchored:
/// push it or store it before the next allocation checkpoint.
pub fn json_to_lua(json_value: &serde_json::Value, vm: &mut LuaVM) -> Result<LuaValue, String> {
    deserialize_from_json(json_value, vm)
}

/// Convert a JSON string to a Lua value
pub fn json_string_to_lua(json_str: &str, vm: &mut LuaVM) -> Result<LuaValue, String> {
    deserialize_from_json_str(json_str, vm)
}
