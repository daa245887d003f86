// Stack API: indices, conversions, tables, userdata and the registry
use crate::lua_value::{ArithOp, LUA_TNIL, LUA_TNONE, LUA_TSTRING, LUA_TTABLE, LUA_TTHREAD, LUA_TUSERDATA};
use crate::lua_vm::lua_limits::{LUA_REGISTRYINDEX, LUA_RIDX_GLOBALS};
use crate::*;

fn stack_ints(vm: &LuaVM) -> Vec<i64> {
    (1..=vm.get_top())
        .map(|i| vm.to_integer(i).unwrap_or(-1))
        .collect()
}

#[test]
fn test_stack_manipulation() {
    let mut vm = LuaVM::new(SafeOption::default());
    for i in 1..=5 {
        vm.push_integer(i);
    }
    vm.rotate(2, 1);
    assert_eq!(stack_ints(&vm), vec![1, 5, 2, 3, 4]);
    vm.rotate(2, -1);
    assert_eq!(stack_ints(&vm), vec![1, 2, 3, 4, 5]);
    vm.insert(1);
    assert_eq!(stack_ints(&vm), vec![5, 1, 2, 3, 4]);
    vm.remove(2);
    assert_eq!(stack_ints(&vm), vec![5, 2, 3, 4]);
    vm.replace(1);
    assert_eq!(stack_ints(&vm), vec![4, 2, 3]);
    vm.copy(1, 3);
    assert_eq!(stack_ints(&vm), vec![4, 2, 4]);
    vm.push_value(2);
    assert_eq!(stack_ints(&vm), vec![4, 2, 4, 2]);

    assert_eq!(vm.abs_index(-1), 4);
    assert_eq!(vm.abs_index(2), 2);
    assert_eq!(vm.abs_index(LUA_REGISTRYINDEX), LUA_REGISTRYINDEX);

    vm.set_top(6).unwrap();
    assert_eq!(vm.type_of(6), LUA_TNIL as i32);
    assert_eq!(vm.type_of(7), LUA_TNONE);
    vm.set_top(-3).unwrap();
    assert_eq!(vm.get_top(), 4);
    vm.pop(10);
    assert_eq!(vm.get_top(), 0);
}

#[test]
fn test_conversions() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.push_integer(42);
    vm.push_number(3.0);
    vm.push_number(3.5);
    vm.push_string(" 0x10 ").unwrap();
    vm.push_string("1e2").unwrap();
    vm.push_string("abc").unwrap();
    vm.push_boolean(false);
    vm.push_nil();

    assert_eq!(vm.to_integer(1), Some(42));
    assert_eq!(vm.to_integer(2), Some(3));
    assert_eq!(vm.to_integer(3), None);
    assert_eq!(vm.to_number(3), Some(3.5));
    assert_eq!(vm.to_integer(4), Some(16));
    assert_eq!(vm.to_integer(5), Some(100));
    assert_eq!(vm.to_number(6), None);
    assert!(!vm.to_boolean(7));
    assert!(!vm.to_boolean(8));
    assert!(vm.to_boolean(1));
    assert_eq!(vm.to_string(7), None);
    assert_eq!(vm.type_name(vm.type_of(6)), "string");
}

#[test]
fn test_to_string_converts_numbers_in_place() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.push_integer(42);
    vm.push_number(1.0);
    assert_eq!(vm.to_string(1).as_deref(), Some("42"));
    assert_eq!(vm.type_of(1), LUA_TSTRING as i32);
    assert_eq!(vm.to_string(2).as_deref(), Some("1.0"));
    assert_eq!(vm.type_of(2), LUA_TSTRING as i32);
    // still usable as a number
    assert_eq!(vm.to_integer(1), Some(42));
}

#[test]
fn test_table_access_and_traversal() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.create_table(3, 1).unwrap();
    for i in 1..=3 {
        vm.push_integer(i * 10);
        vm.raw_set_i(1, i).unwrap();
    }
    vm.push_string("v").unwrap();
    vm.set_field(1, "k").unwrap();
    assert_eq!(vm.raw_len(1), 3);

    vm.push_string("k").unwrap();
    assert_eq!(vm.raw_get(1).unwrap(), LUA_TSTRING as i32);
    assert_eq!(vm.to_string(-1).as_deref(), Some("v"));
    vm.pop(1);

    let mut ints = Vec::new();
    let mut others = 0;
    vm.push_nil();
    while vm.next(1).unwrap() {
        match vm.to_value(-2) {
            LuaValue::Integer(k) => ints.push((k, vm.to_integer(-1).unwrap_or(0))),
            _ => others += 1,
        }
        vm.pop(1);
    }
    assert_eq!(ints, vec![(1, 10), (2, 20), (3, 30)]);
    assert_eq!(others, 1);
    assert_eq!(vm.get_top(), 1);

    vm.len(1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(3));
}

fn index_a_number(vm: &mut LuaVM) -> LuaResult<usize> {
    vm.push_integer(1);
    vm.raw_get_i(-1, 1)?;
    Ok(1)
}

#[test]
fn test_raw_access_needs_a_table() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.push_cfunction(index_a_number);
    assert_eq!(vm.pcall(0, 1, 0), LuaStatus::ErrRun);
    assert_eq!(vm.to_string(-1).as_deref(), Some("table expected, got number"));
}

#[test]
fn test_nan_key_is_rejected() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.new_table().unwrap();
    vm.push_number(f64::NAN);
    vm.push_integer(1);
    assert!(vm.raw_set(1).is_err());
}

#[test]
fn test_compare_and_arith() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.push_integer(1);
    vm.push_number(2.5);
    vm.push_number(1.0);
    assert!(vm.compare(1, 2, CompareOp::Lt).unwrap());
    assert!(!vm.compare(2, 1, CompareOp::Le).unwrap());
    assert!(vm.compare(1, 3, CompareOp::Eq).unwrap());
    assert!(vm.raw_equal(1, 3));
    assert!(!vm.compare(1, 9, CompareOp::Eq).unwrap());
    vm.set_top(0).unwrap();

    vm.push_integer(7);
    vm.push_integer(2);
    vm.arith(ArithOp::IDiv).unwrap();
    assert_eq!(vm.to_value(-1), LuaValue::Integer(3));

    vm.push_integer(2);
    vm.arith(ArithOp::Pow).unwrap();
    assert_eq!(vm.to_value(-1), LuaValue::Float(9.0));

    vm.arith(ArithOp::Unm).unwrap();
    assert_eq!(vm.to_value(-1), LuaValue::Float(-9.0));

    vm.push_string("10").unwrap();
    vm.push_integer(1);
    vm.arith(ArithOp::Add).unwrap();
    assert_eq!(vm.to_value(-1), LuaValue::Integer(11));

    vm.push_integer(5);
    vm.push_integer(3);
    vm.arith(ArithOp::BXor).unwrap();
    assert_eq!(vm.to_value(-1), LuaValue::Integer(6));
}

#[test]
fn test_concat() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.concat(0).unwrap();
    assert_eq!(vm.to_string(-1).as_deref(), Some(""));
    vm.pop(1);

    vm.push_string("a").unwrap();
    vm.push_integer(1);
    vm.push_number(2.0);
    vm.concat(3).unwrap();
    assert_eq!(vm.get_top(), 1);
    assert_eq!(vm.to_string(-1).as_deref(), Some("a12.0"));
}

struct Point {
    x: i32,
    y: i32,
}

#[test]
fn test_userdata() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.new_userdata(16, 2).unwrap();
    assert_eq!(vm.type_of(1), LUA_TUSERDATA as i32);
    assert_eq!(vm.raw_len(1), 16);

    vm.push_string("first").unwrap();
    assert!(vm.set_iuservalue(1, 1));
    vm.push_integer(3);
    assert!(!vm.set_iuservalue(1, 3));
    assert_eq!(vm.get_iuservalue(1, 1), LUA_TSTRING as i32);
    assert_eq!(vm.to_string(-1).as_deref(), Some("first"));
    assert_eq!(vm.get_iuservalue(1, 2), LUA_TNIL as i32);
    assert_eq!(vm.get_iuservalue(1, 3), LUA_TNONE);
    vm.set_top(0).unwrap();

    vm.push_userdata(LuaUserdata::with_payload(Point { x: 3, y: 4 }, 0))
        .unwrap();
    let p = vm.userdata_ref::<Point>(-1).unwrap();
    assert_eq!((p.x, p.y), (3, 4));
    assert!(vm.userdata_ref::<String>(-1).is_none());
}

#[test]
fn test_registry_and_globals() {
    let mut vm = LuaVM::new(SafeOption::default());
    assert_eq!(vm.type_of(LUA_REGISTRYINDEX), LUA_TTABLE as i32);
    vm.raw_get_i(LUA_REGISTRYINDEX, LUA_RIDX_GLOBALS).unwrap();
    vm.push_globals();
    assert!(vm.raw_equal(-1, -2));
    vm.set_top(0).unwrap();

    assert!(vm.push_thread());
    assert_eq!(vm.type_of(-1), LUA_TTHREAD as i32);
    vm.pop(1);

    vm.push_string("stored").unwrap();
    let id = vm.reference();
    assert_eq!(vm.get_top(), 0);
    vm.push_ref(id);
    assert_eq!(vm.to_string(-1).as_deref(), Some("stored"));
    vm.unreference(id);
    vm.push_ref(id);
    assert!(!vm.raw_equal(-1, -2));
}

#[test]
fn test_metatable_round_trip() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.new_table().unwrap();
    assert!(!vm.get_metatable(1));
    vm.new_table().unwrap();
    vm.set_metatable(1).unwrap();
    assert!(vm.get_metatable(1));
    assert_eq!(vm.get_top(), 2);
    vm.push_integer(1);
    assert!(vm.set_metatable(1).is_err());
}
