use serde_json::json;

use crate::lua_value::{LUA_TBOOLEAN, LUA_TNIL, LUA_TTABLE};
use crate::serde::{json_string_to_lua, json_to_lua, lua_to_json, lua_to_json_string};
use crate::*;

#[test]
fn test_sequence_becomes_array() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.new_table().unwrap();
    for i in 1..=3 {
        vm.push_integer(i);
        vm.raw_set_i(1, i).unwrap();
    }
    let t = vm.to_value(1);
    assert_eq!(lua_to_json(&vm, &t).unwrap(), json!([1, 2, 3]));
    assert_eq!(lua_to_json_string(&vm, &t, false).unwrap(), "[1,2,3]");
}

#[test]
fn test_record_becomes_object() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.new_table().unwrap();
    vm.push_string("lua").unwrap();
    vm.set_field(1, "name").unwrap();
    vm.push_number(5.4);
    vm.set_field(1, "version").unwrap();
    vm.push_boolean(true);
    vm.set_field(1, "ok").unwrap();
    // a sparse integer key forces an object
    vm.push_integer(7);
    vm.raw_set_i(1, 10).unwrap();

    let t = vm.to_value(1);
    let expected = json!({"name": "lua", "version": 5.4, "ok": true, "10": 7});
    assert_eq!(lua_to_json(&vm, &t).unwrap(), expected);
}

#[test]
fn test_unserializable_values() {
    fn native(_vm: &mut LuaVM) -> LuaResult<usize> {
        Ok(0)
    }
    let mut vm = LuaVM::new(SafeOption::default());
    vm.new_table().unwrap();
    vm.push_value(1);
    vm.set_field(1, "me").unwrap();
    let t = vm.to_value(1);
    let err = lua_to_json(&vm, &t).unwrap_err();
    assert!(err.contains("Circular"), "{}", err);

    vm.push_cfunction(native);
    let f = vm.to_value(-1);
    assert!(lua_to_json(&vm, &f).is_err());
    assert!(lua_to_json(&vm, &LuaValue::float(f64::NAN)).is_err());
}

#[test]
fn test_json_text_to_lua() {
    let mut vm = LuaVM::new(SafeOption::default());
    let v = json_string_to_lua(r#"{"list": [1, 2.5, "x"], "flag": false, "none": null}"#, &mut vm).unwrap();
    vm.state.push(v);

    assert_eq!(vm.get_field(1, "list").unwrap(), LUA_TTABLE as i32);
    assert_eq!(vm.raw_len(-1), 3);
    vm.raw_get_i(-1, 1).unwrap();
    assert_eq!(vm.to_value(-1), LuaValue::Integer(1));
    vm.pop(1);
    vm.raw_get_i(-1, 2).unwrap();
    assert_eq!(vm.to_number(-1), Some(2.5));
    vm.pop(1);
    vm.raw_get_i(-1, 3).unwrap();
    assert_eq!(vm.to_string(-1).as_deref(), Some("x"));
    vm.set_top(1).unwrap();

    assert_eq!(vm.get_field(1, "flag").unwrap(), LUA_TBOOLEAN as i32);
    assert!(!vm.to_boolean(-1));
    assert_eq!(vm.get_field(1, "none").unwrap(), LUA_TNIL as i32);

    assert!(json_string_to_lua("{not json", &mut vm).is_err());
}

#[test]
fn test_json_value_round_trip_through_lua() {
    let mut vm = LuaVM::new(SafeOption::default());
    let doc = json!({"a": [true, null, {"b": "c"}], "n": -3});
    let v = json_to_lua(&doc, &mut vm).unwrap();
    vm.state.push(v);
    // null inside an array leaves a hole, so the array turns into an object
    let back = lua_to_json(&vm, &vm.to_value(1)).unwrap();
    assert_eq!(back["n"], json!(-3));
    assert_eq!(back["a"]["1"], json!(true));
    assert_eq!(back["a"]["3"], json!({"b": "c"}));
}

#[test]
fn test_gc_stats_serialize() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.gc(GcOption::Collect);
    let stats = serde_json::to_value(vm.gc_stats()).unwrap();
    assert!(stats["major_collections"].as_u64().unwrap() >= 1);
    assert_eq!(stats["emergency_collections"], json!(0));
}
