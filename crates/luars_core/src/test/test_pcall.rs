// Protected calls, error objects and to-be-closed variables
use super::builder::*;
use crate::lua_value::{LUA_TBOOLEAN, LUA_TNIL, LUA_TTABLE};
use crate::lua_vm::TmKind;
use crate::*;

fn raise_table(vm: &mut LuaVM) -> LuaResult<usize> {
    vm.new_table()?;
    vm.push_integer(7);
    vm.set_field(-2, "code")?;
    Err(vm.error())
}

fn raise_string(vm: &mut LuaVM) -> LuaResult<usize> {
    vm.push_string("boom")?;
    Err(vm.error())
}

fn decorate(vm: &mut LuaVM) -> LuaResult<usize> {
    let msg = vm.to_string(1).unwrap_or_default();
    vm.push_string(&format!("handled: {}", msg))?;
    Ok(1)
}

fn failing_handler(vm: &mut LuaVM) -> LuaResult<usize> {
    vm.push_string("again")?;
    Err(vm.error())
}

fn sum_args(vm: &mut LuaVM) -> LuaResult<usize> {
    let mut sum = 0;
    for i in 1..=vm.get_top() {
        sum += vm.to_integer(i).unwrap_or(0);
    }
    vm.push_integer(sum);
    Ok(1)
}

#[test]
fn test_pcall_success_keeps_results() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.push_cfunction(sum_args);
    vm.push_integer(1);
    vm.push_integer(2);
    vm.push_integer(3);
    assert_eq!(vm.pcall(3, 2, 0), LuaStatus::Ok);
    assert_eq!(vm.get_top(), 2);
    assert_eq!(vm.to_integer(1), Some(6));
    assert_eq!(vm.type_of(2), LUA_TNIL as i32);
}

#[test]
fn test_error_object_is_any_value() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.push_cfunction(raise_table);
    assert_eq!(vm.pcall(0, 0, 0), LuaStatus::ErrRun);
    assert_eq!(vm.get_top(), 1);
    assert_eq!(vm.type_of(-1), LUA_TTABLE as i32);
    vm.get_field(-1, "code").unwrap();
    assert_eq!(vm.to_integer(-1), Some(7));
}

#[test]
fn test_message_handler_sees_the_error() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.push_cfunction(decorate);
    vm.push_cfunction(raise_string);
    assert_eq!(vm.pcall(0, 0, 1), LuaStatus::ErrRun);
    assert_eq!(vm.to_string(-1).as_deref(), Some("handled: boom"));
    // handler and error object
    assert_eq!(vm.get_top(), 2);
}

#[test]
fn test_failing_handler_is_error_in_error_handling() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.push_cfunction(failing_handler);
    vm.push_cfunction(raise_string);
    assert_eq!(vm.pcall(0, 0, 1), LuaStatus::ErrErr);
    assert_eq!(vm.to_string(-1).as_deref(), Some("error in error handling"));
}

#[test]
fn test_calling_nil_is_an_error() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.push_nil();
    assert_eq!(vm.pcall(0, 0, 0), LuaStatus::ErrRun);
    assert_eq!(vm.to_string(-1).as_deref(), Some("attempt to call a nil value"));
}

fn call_metamethod(vm: &mut LuaVM) -> LuaResult<usize> {
    // self plus the original arguments
    let n = vm.get_top() as i64;
    vm.push_integer(n);
    Ok(1)
}

#[test]
fn test_call_metamethod() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.new_table().unwrap();
    vm.new_table().unwrap();
    vm.push_cfunction(call_metamethod);
    vm.set_field(-2, "__call").unwrap();
    vm.set_metatable(-2).unwrap();
    vm.push_integer(1);
    vm.push_integer(2);
    vm.call(2, 1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(3));
}

#[test]
fn test_unprotected_error_returns_to_the_host() {
    init_logger();
    let mut vm = LuaVM::new(SafeOption::default());
    vm.push_cfunction(raise_string);
    let err = vm.call(0, 0).unwrap_err();
    assert_eq!(err, LuaError::RuntimeError);
    assert_eq!(vm.get_top(), 1);
    assert_eq!(vm.to_string(-1).as_deref(), Some("boom"));
}

fn recurse_natively(vm: &mut LuaVM) -> LuaResult<usize> {
    vm.push_cfunction(recurse_natively);
    vm.call(0, 0)?;
    Ok(0)
}

#[test]
fn test_native_recursion_is_bounded() {
    let mut vm = LuaVM::new(SafeOption {
        max_call_depth: 60,
        ..SafeOption::default()
    });
    vm.push_cfunction(recurse_natively);
    assert_eq!(vm.pcall(0, 0, 0), LuaStatus::ErrRun);
    let msg = vm.to_string(-1).unwrap();
    assert!(msg.contains("C stack overflow"), "{}", msg);
}

fn record_close(vm: &mut LuaVM) -> LuaResult<usize> {
    vm.push_value(2);
    vm.set_global("close_err")?;
    vm.push_boolean(true);
    vm.set_global("closed")?;
    Ok(0)
}

fn closable(vm: &mut LuaVM) {
    vm.new_table().unwrap();
    vm.new_table().unwrap();
    vm.push_cfunction(record_close);
    vm.set_field(-2, "__close").unwrap();
    vm.set_metatable(-2).unwrap();
    vm.set_global("res").unwrap();
}

#[test]
fn test_tbc_closed_on_return() {
    let mut vm = LuaVM::new(SafeOption::default());
    closable(&mut vm);
    // local x <close> = res; return 1
    let mut b = ChunkBuilder::main("tbc");
    let res = b.k_str(&mut vm, "res");
    b.abc(OpCode::GetTabUp, 0, 0, res);
    b.abc(OpCode::Tbc, 0, 0, 0);
    b.asbx(OpCode::LoadI, 1, 1);
    b.abck(OpCode::Return, 1, 2, 0, true);
    push_chunk(&mut vm, b.build());

    vm.call(0, 1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(1));
    assert_eq!(vm.get_global("closed").unwrap(), LUA_TBOOLEAN as i32);
    assert_eq!(vm.get_global("close_err").unwrap(), LUA_TNIL as i32);
}

#[test]
fn test_tbc_closed_on_error() {
    let mut vm = LuaVM::new(SafeOption::default());
    closable(&mut vm);
    let mut b = ChunkBuilder::main("tbcerr");
    let res = b.k_str(&mut vm, "res");
    b.abc(OpCode::GetTabUp, 0, 0, res);
    b.abc(OpCode::Tbc, 0, 0, 0);
    b.asbx(OpCode::LoadI, 1, 1);
    b.asbx(OpCode::LoadI, 2, 0);
    b.abc(OpCode::IDiv, 3, 1, 2);
    b.abc(OpCode::MmBin, 1, 2, TmKind::IDiv as u32);
    b.abck(OpCode::Return, 3, 2, 0, true);
    push_chunk(&mut vm, b.build());

    let msg = run_error(&mut vm);
    assert_eq!(msg, "tbcerr:1: attempt to perform 'n//0'");
    assert!(vm.get_global("closed").is_ok());
    assert!(vm.to_boolean(-1));
    vm.get_global("close_err").unwrap();
    assert_eq!(vm.to_string(-1).as_deref(), Some("tbcerr:1: attempt to perform 'n//0'"));
}

#[test]
fn test_tbc_requires_close_metamethod() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut b = ChunkBuilder::main("notclosable");
    b.abc(OpCode::NewTable, 0, 0, 0);
    b.abc(OpCode::ExtraArg, 0, 0, 0);
    b.abc(OpCode::Tbc, 0, 0, 0);
    b.abc(OpCode::Return0, 0, 1, 1);
    push_chunk(&mut vm, b.build());
    let msg = run_error(&mut vm);
    assert!(msg.ends_with("got a non-closable value"), "{}", msg);
}

#[test]
fn test_native_to_close_runs_on_set_top() {
    fn body(vm: &mut LuaVM) -> LuaResult<usize> {
        vm.get_global("res")?;
        vm.to_close(-1)?;
        vm.set_top(0)?;
        Ok(0)
    }
    let mut vm = LuaVM::new(SafeOption::default());
    closable(&mut vm);
    vm.push_cfunction(body);
    vm.call(0, 0).unwrap();
    vm.get_global("closed").unwrap();
    assert!(vm.to_boolean(-1));
}
