/// Deserializer for converting serde_json::Value to Lua values
///
/// - null -> nil, booleans -> booleans
/// - numbers that fit an i64 -> integers, others -> floats
/// - strings -> strings
/// - arrays -> tables with keys 1..n, objects -> tables with string keys
use serde_json::Value as JsonValue;

use crate::lua_value::LuaValue;
use crate::lua_vm::LuaVM;

/// Convert a serde_json::Value to a Lua value
pub fn from_value(json_value: &JsonValue, vm: &mut LuaVM) -> Result<LuaValue, String> {
    match json_value {
        JsonValue::Null => Ok(LuaValue::nil()),

        JsonValue::Bool(b) => Ok(LuaValue::boolean(*b)),

        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(LuaValue::float(f))
            } else {
                Err("Invalid JSON number".to_string())
            }
        }

        JsonValue::String(s) => Ok(LuaValue::String(vm.create_string(s.as_bytes()))),

        JsonValue::Array(arr) => json_array_to_lua_table(arr, vm),

        JsonValue::Object(obj) => json_object_to_lua_table(obj, vm),
    }
}

/// Convert a JSON string to a Lua value
pub fn from_str(json_str: &str, vm: &mut LuaVM) -> Result<LuaValue, String> {
    let json_value: JsonValue =
        serde_json::from_str(json_str).map_err(|e| format!("Failed to parse JSON: {}", e))?;

    from_value(&json_value, vm)
}

fn json_array_to_lua_table(arr: &[JsonValue], vm: &mut LuaVM) -> Result<LuaValue, String> {
    let table = vm.pool.create_table(&mut vm.gc, arr.len(), 0);

    for (i, item) in arr.iter().enumerate() {
        let value = from_value(item, vm)?;
        vm.table_raw_set_int(table, i as i64 + 1, value);
    }

    Ok(LuaValue::Table(table))
}

fn json_object_to_lua_table(obj: &serde_json::Map<String, JsonValue>, vm: &mut LuaVM) -> Result<LuaValue, String> {
    let table = vm.pool.create_table(&mut vm.gc, 0, obj.len());

    for (key_str, value_json) in obj {
        let key = LuaValue::String(vm.create_string(key_str.as_bytes()));
        let value = from_value(value_json, vm)?;
        vm.table_raw_set(table, key, value)
            .map_err(|e| format!("Failed to set table field: {}", e))?;
    }

    Ok(LuaValue::Table(table))
}
