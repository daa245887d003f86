// Upvalue sharing and closing, native closures
use super::builder::*;
use crate::lua_value::LUA_TTABLE;
use crate::lua_vm::TmKind;
use crate::*;

/// local x = 1
/// local function inc() x = x + 1 end
/// local function get() return x end
/// inc()
/// return inc, get
fn counter_chunk() -> Chunk {
    let mut inc = ChunkBuilder::function("inc", 0);
    inc.upvalue("x", true, 0);
    inc.abc(OpCode::GetUpval, 0, 0, 0);
    inc.abc(OpCode::AddI, 0, 0, Instruction::int_to_sc(1));
    inc.abck(OpCode::MmBinI, 0, Instruction::int_to_sc(1), TmKind::Add as u32, false);
    inc.abc(OpCode::SetUpval, 0, 0, 0);
    inc.abc(OpCode::Return0, 0, 1, 1);

    let mut get = ChunkBuilder::function("get", 0);
    get.upvalue("x", true, 0);
    get.abc(OpCode::GetUpval, 0, 0, 0);
    get.abc(OpCode::Return1, 0, 2, 1);

    let mut main = ChunkBuilder::main("counter");
    let p_inc = main.child(inc.build());
    let p_get = main.child(get.build());
    main.asbx(OpCode::LoadI, 0, 1);
    main.abx(OpCode::Closure, 1, p_inc);
    main.abx(OpCode::Closure, 2, p_get);
    main.abc(OpCode::Move, 3, 1, 0);
    main.abc(OpCode::Call, 3, 1, 1);
    main.abck(OpCode::Return, 1, 3, 0, true);
    main.build()
}

#[test]
fn test_closures_share_an_upvalue() {
    let mut vm = LuaVM::new(SafeOption::default());
    push_chunk(&mut vm, counter_chunk());
    vm.call(0, 2).unwrap();
    assert_eq!(vm.get_top(), 2);

    // inc ran once inside the chunk
    vm.push_value(2);
    vm.call(0, 1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(2));
    vm.pop(1);

    // the upvalue outlives the frame and is still shared
    vm.push_value(1);
    vm.call(0, 0).unwrap();
    vm.push_value(1);
    vm.call(0, 0).unwrap();
    vm.push_value(2);
    vm.call(0, 1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(4));
}

#[test]
fn test_closed_upvalue_survives_collection() {
    let mut vm = LuaVM::new(SafeOption::default());
    push_chunk(&mut vm, counter_chunk());
    vm.call(0, 2).unwrap();
    vm.gc(GcOption::Collect);
    vm.push_value(2);
    vm.call(0, 1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(2));
}

#[test]
fn test_upvalue_introspection() {
    let mut vm = LuaVM::new(SafeOption::default());
    push_chunk(&mut vm, counter_chunk());
    assert_eq!(vm.get_upvalue_value(1, 1).as_deref(), Some("_ENV"));
    assert_eq!(vm.type_of(-1), LUA_TTABLE as i32);
    vm.pop(1);
    assert_eq!(vm.get_upvalue_value(1, 2), None);

    vm.call(0, 2).unwrap();
    // get's upvalue is x, closed at 2
    assert_eq!(vm.get_upvalue_value(2, 1).as_deref(), Some("x"));
    assert_eq!(vm.to_integer(-1), Some(2));
    vm.pop(1);
    vm.push_integer(40);
    assert_eq!(vm.set_upvalue_value(2, 1).as_deref(), Some("x"));
    vm.push_value(1);
    vm.call(0, 0).unwrap();
    vm.push_value(2);
    vm.call(0, 1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(41));
}

fn count_up(vm: &mut LuaVM) -> LuaResult<usize> {
    let n = vm.to_integer(upvalue_index(1)).unwrap_or(0) + 1;
    vm.push_integer(n);
    vm.copy(-1, upvalue_index(1));
    Ok(1)
}

#[test]
fn test_native_closure_upvalues() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.push_integer(10);
    vm.push_cclosure(count_up, 1).unwrap();
    assert_eq!(vm.get_top(), 1);
    for expected in 11..=13 {
        vm.push_value(1);
        vm.call(0, 1).unwrap();
        assert_eq!(vm.to_integer(-1), Some(expected));
        vm.pop(1);
    }
    assert_eq!(vm.get_upvalue_value(1, 1).as_deref(), Some(""));
    assert_eq!(vm.to_integer(-1), Some(13));
}

#[test]
fn test_closures_over_loop_variable_are_distinct() {
    let mut vm = LuaVM::new(SafeOption::default());
    // local fs = {}
    // for i = 1, 3 do fs[i] = function() return i end end
    // return fs
    let mut get = ChunkBuilder::function("get_i", 0);
    get.upvalue("i", true, 4);
    get.abc(OpCode::GetUpval, 0, 0, 0);
    get.abc(OpCode::Return1, 0, 2, 1);

    let mut main = ChunkBuilder::main("loop");
    let p = main.child(get.build());
    main.abc(OpCode::NewTable, 0, 0, 0);
    main.abc(OpCode::ExtraArg, 0, 0, 0);
    main.asbx(OpCode::LoadI, 1, 1);
    main.asbx(OpCode::LoadI, 2, 3);
    main.asbx(OpCode::LoadI, 3, 1);
    main.abx(OpCode::ForPrep, 1, 3);
    main.abx(OpCode::Closure, 5, p);
    main.abc(OpCode::SetTable, 0, 4, 5);
    main.abc(OpCode::Close, 4, 0, 0);
    main.abx(OpCode::ForLoop, 1, 4);
    main.abc(OpCode::Return1, 0, 2, 1);
    push_chunk(&mut vm, main.build());
    vm.call(0, 1).unwrap();

    for i in 1..=3 {
        vm.get_i(1, i).unwrap();
        vm.call(0, 1).unwrap();
        assert_eq!(vm.to_integer(-1), Some(i));
        vm.pop(1);
    }
}
