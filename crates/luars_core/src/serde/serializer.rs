/// Serializer for converting Lua values to serde_json::Value
///
/// - nil -> null, booleans -> booleans
/// - integers -> JSON integers, floats -> JSON floats (NaN and infinities fail)
/// - strings -> strings (invalid UTF-8 replaced)
/// - tables with keys exactly 1..n -> arrays, other tables -> objects
/// - functions, threads and userdata -> error
use std::collections::HashSet;

use serde_json::{Map, Number, Value as JsonValue};

use crate::gc::TableId;
use crate::lua_value::LuaValue;
use crate::lua_vm::LuaVM;

/// Convert a Lua value to a serde_json::Value
pub fn to_value(vm: &LuaVM, lua_value: &LuaValue) -> Result<JsonValue, String> {
    let mut visited = HashSet::new();
    to_value_internal(vm, lua_value, &mut visited)
}

/// Convert a Lua value to a JSON string
pub fn to_string(vm: &LuaVM, lua_value: &LuaValue, pretty: bool) -> Result<String, String> {
    let json_value = to_value(vm, lua_value)?;

    if pretty {
        serde_json::to_string_pretty(&json_value).map_err(|e| format!("Failed to serialize to JSON: {}", e))
    } else {
        serde_json::to_string(&json_value).map_err(|e| format!("Failed to serialize to JSON: {}", e))
    }
}

fn to_value_internal(vm: &LuaVM, lua_value: &LuaValue, visited: &mut HashSet<TableId>) -> Result<JsonValue, String> {
    match *lua_value {
        LuaValue::Nil => Ok(JsonValue::Null),

        LuaValue::Boolean(b) => Ok(JsonValue::Bool(b)),

        LuaValue::Integer(i) => Ok(JsonValue::Number(Number::from(i))),

        LuaValue::Float(f) => Number::from_f64(f)
            .map(JsonValue::Number)
            .ok_or_else(|| format!("Invalid number: {}", f)),

        LuaValue::String(s) => Ok(JsonValue::String(
            String::from_utf8_lossy(vm.pool().str_bytes(s)).into_owned(),
        )),

        LuaValue::Table(t) => {
            if !visited.insert(t) {
                return Err("Circular reference detected in table".to_string());
            }
            let mut entries = table_entries(vm, t)?;
            let result = if is_array_like(&entries) {
                // hash-part entries come in any order
                entries.sort_unstable_by_key(|(k, _)| k.as_integer().unwrap_or(0));
                entries
                    .iter()
                    .map(|(_, v)| to_value_internal(vm, v, visited))
                    .collect::<Result<Vec<_>, _>>()
                    .map(JsonValue::Array)
            } else {
                table_to_json_object(vm, &entries, visited)
            };
            visited.remove(&t);
            result
        }

        LuaValue::Function(_) | LuaValue::CFunction(_) => Err("Cannot serialize Lua function to JSON".to_string()),

        LuaValue::Thread(_) => Err("Cannot serialize Lua thread to JSON".to_string()),

        LuaValue::Userdata(_) | LuaValue::LightUserdata(_) => {
            Err("Cannot serialize Lua userdata to JSON".to_string())
        }
    }
}

/// Live entries in traversal order
fn table_entries(vm: &LuaVM, t: TableId) -> Result<Vec<(LuaValue, LuaValue)>, String> {
    let pool = &vm.pool().gc_pool;
    let table = pool.table(t).ok_or_else(|| "Dangling table reference".to_string())?;
    let mut entries = Vec::with_capacity(table.count());
    let mut key = LuaValue::Nil;
    while let Some((k, v)) = table.next(&key, pool).map_err(|e| e.message().to_string())? {
        entries.push((k, v));
        key = k;
    }
    Ok(entries)
}

/// Keys are exactly the integers 1..n. An empty table counts as an array.
fn is_array_like(entries: &[(LuaValue, LuaValue)]) -> bool {
    let mut int_keys = Vec::with_capacity(entries.len());
    for (k, _) in entries {
        match k {
            LuaValue::Integer(i) if *i > 0 => int_keys.push(*i),
            _ => return false,
        }
    }
    int_keys.sort_unstable();
    int_keys.iter().enumerate().all(|(i, k)| *k == i as i64 + 1)
}

fn table_to_json_object(
    vm: &LuaVM,
    entries: &[(LuaValue, LuaValue)],
    visited: &mut HashSet<TableId>,
) -> Result<JsonValue, String> {
    let mut object = Map::new();

    for (key, value) in entries {
        let key_str = match key {
            LuaValue::String(_) | LuaValue::Integer(_) | LuaValue::Float(_) | LuaValue::Boolean(_) => {
                vm.display_value(key)
            }
            // keys without a textual form are skipped
            _ => continue,
        };
        let json_value = to_value_internal(vm, value, visited)?;
        object.insert(key_str, json_value);
    }

    Ok(JsonValue::Object(object))
}
