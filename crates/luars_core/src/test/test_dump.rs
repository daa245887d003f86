// Binary chunks through the API: dump, reload, run
use super::builder::*;
use crate::lua_vm::lua_limits::LUA_MULTRET;
use crate::*;

/// local function f() return "hello" end
/// return f(), 2.5, "tail", greeting
fn sample(vm: &mut LuaVM) {
    let mut f = ChunkBuilder::function("sample", 0);
    let hello = f.k_str(vm, "hello");
    f.line(2);
    f.abx(OpCode::LoadK, 0, hello);
    f.abc(OpCode::Return1, 0, 2, 1);

    let mut main = ChunkBuilder::main("sample");
    let p = main.child(f.build());
    let half = main.k(LuaValue::float(2.5));
    let tail = main.k_str(vm, "tail");
    let greeting = main.k_str(vm, "greeting");
    main.abx(OpCode::Closure, 0, p);
    main.abc(OpCode::Call, 0, 1, 2);
    main.abx(OpCode::LoadK, 1, half);
    main.abx(OpCode::LoadK, 2, tail);
    main.abc(OpCode::GetTabUp, 3, 0, greeting);
    main.abc(OpCode::Return, 0, 5, 0);
    push_chunk(vm, main.build());
}

#[test]
fn test_dump_and_reload() {
    init_logger();
    let mut vm = LuaVM::new(SafeOption::default());
    vm.push_string("hi").unwrap();
    vm.set_global("greeting").unwrap();

    sample(&mut vm);
    let bytes = vm.dump_function(-1, false).unwrap();
    assert!(bytes.starts_with(b"\x1bLua"));
    vm.pop(1);

    assert_eq!(vm.load_binary(&bytes, "=dumped"), LuaStatus::Ok);
    vm.call(0, LUA_MULTRET).unwrap();
    assert_eq!(vm.get_top(), 4);
    assert_eq!(vm.to_string(1).as_deref(), Some("hello"));
    assert_eq!(vm.to_number(2), Some(2.5));
    assert_eq!(vm.to_string(3).as_deref(), Some("tail"));
    // the first upvalue of a loaded chunk is the globals table
    assert_eq!(vm.to_string(4).as_deref(), Some("hi"));
}

#[test]
fn test_stripped_dump_is_smaller_and_still_runs() {
    let mut vm = LuaVM::new(SafeOption::default());
    sample(&mut vm);
    let full = vm.dump_function(-1, false).unwrap();
    let stripped = vm.dump_function(-1, true).unwrap();
    assert!(stripped.len() < full.len());
    vm.pop(1);

    assert_eq!(vm.load_binary(&stripped, "=stripped"), LuaStatus::Ok);
    vm.call(0, 1).unwrap();
    assert_eq!(vm.to_string(-1).as_deref(), Some("hello"));
}

#[test]
fn test_truncated_chunk_is_rejected() {
    let mut vm = LuaVM::new(SafeOption::default());
    sample(&mut vm);
    let bytes = vm.dump_function(-1, false).unwrap();
    vm.pop(1);

    let status = vm.load_binary(&bytes[..bytes.len() - 1], "=dumped");
    assert_eq!(status, LuaStatus::ErrSyntax);
    let msg = vm.to_string(-1).unwrap();
    assert!(msg.starts_with("dumped: bad binary format"), "{}", msg);
    assert!(msg.ends_with("(truncated chunk)"), "{}", msg);
}

#[test]
fn test_only_lua_functions_dump() {
    fn native(_vm: &mut LuaVM) -> LuaResult<usize> {
        Ok(0)
    }
    let mut vm = LuaVM::new(SafeOption::default());
    vm.push_cfunction(native);
    assert!(vm.dump_function(-1, false).is_none());
    vm.push_integer(1);
    assert!(vm.dump_function(-1, false).is_none());
}
