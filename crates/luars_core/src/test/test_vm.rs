// Dispatch loop: arithmetic, tables, control flow and metamethods
use super::builder::*;
use crate::lua_value::LUA_TNUMBER;
use crate::lua_vm::TmKind;
use crate::lua_vm::lua_limits::{LUA_MINSTACK, LUA_MULTRET};
use crate::*;

fn tm(t: TmKind) -> u32 {
    t as u32
}

#[test]
fn test_arithmetic_results() {
    init_logger();
    let mut vm = LuaVM::new(SafeOption::default());
    let mut b = ChunkBuilder::main("arith");
    b.asbx(OpCode::LoadI, 0, 7);
    b.asbx(OpCode::LoadI, 1, 2);
    b.asbx(OpCode::LoadI, 10, -7);
    b.asbx(OpCode::LoadI, 11, 3);
    b.abc(OpCode::Add, 2, 0, 1);
    b.abc(OpCode::MmBin, 0, 1, tm(TmKind::Add));
    b.abc(OpCode::Div, 3, 0, 1);
    b.abc(OpCode::MmBin, 0, 1, tm(TmKind::Div));
    b.abc(OpCode::IDiv, 4, 0, 1);
    b.abc(OpCode::MmBin, 0, 1, tm(TmKind::IDiv));
    b.abc(OpCode::Mod, 5, 10, 11);
    b.abc(OpCode::MmBin, 10, 11, tm(TmKind::Mod));
    b.abc(OpCode::Return, 2, 5, 0);
    push_chunk(&mut vm, b.build());

    vm.call(0, 4).unwrap();
    assert_eq!(vm.get_top(), 4);
    assert_eq!(vm.to_integer(1), Some(9));
    assert!(vm.to_value(2).is_float());
    assert_eq!(vm.to_number(2), Some(3.5));
    assert_eq!(vm.to_integer(3), Some(3));
    // floor modulo takes the sign of the divisor
    assert_eq!(vm.to_integer(4), Some(2));
}

#[test]
fn test_integer_division_by_zero() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut b = ChunkBuilder::main("div");
    b.asbx(OpCode::LoadI, 0, 1);
    b.asbx(OpCode::LoadI, 1, 0);
    b.line(3);
    b.abc(OpCode::IDiv, 2, 0, 1);
    b.abc(OpCode::MmBin, 0, 1, tm(TmKind::IDiv));
    b.abc(OpCode::Return0, 0, 1, 1);
    push_chunk(&mut vm, b.build());

    let msg = run_error(&mut vm);
    assert_eq!(msg, "div:3: attempt to perform 'n//0'");
}

#[test]
fn test_arithmetic_on_nil_is_an_error() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut b = ChunkBuilder::main("nilarith");
    b.abc(OpCode::LoadNil, 0, 0, 0);
    b.asbx(OpCode::LoadI, 1, 1);
    b.abc(OpCode::Add, 2, 0, 1);
    b.abc(OpCode::MmBin, 0, 1, tm(TmKind::Add));
    b.abc(OpCode::Return0, 0, 1, 1);
    push_chunk(&mut vm, b.build());

    let msg = run_error(&mut vm);
    assert!(msg.ends_with("attempt to perform arithmetic on a nil value"), "{}", msg);
}

#[test]
fn test_numeric_for_loop() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut b = ChunkBuilder::main("sum");
    b.asbx(OpCode::LoadI, 0, 0);
    b.asbx(OpCode::LoadI, 1, 1);
    b.asbx(OpCode::LoadI, 2, 10);
    b.asbx(OpCode::LoadI, 3, 1);
    b.abx(OpCode::ForPrep, 1, 2);
    b.abc(OpCode::Add, 0, 0, 4);
    b.abc(OpCode::MmBin, 0, 4, tm(TmKind::Add));
    b.abx(OpCode::ForLoop, 1, 3);
    b.abc(OpCode::Return1, 0, 2, 1);
    push_chunk(&mut vm, b.build());

    vm.call(0, 1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(55));
}

#[test]
fn test_float_for_loop() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut b = ChunkBuilder::main("fsum");
    let half = b.k(LuaValue::float(0.5));
    b.asbx(OpCode::LoadF, 0, 0);
    b.asbx(OpCode::LoadI, 1, 1);
    b.asbx(OpCode::LoadI, 2, 2);
    b.abx(OpCode::LoadK, 3, half);
    b.abx(OpCode::ForPrep, 1, 2);
    b.abc(OpCode::Add, 0, 0, 4);
    b.abc(OpCode::MmBin, 0, 4, tm(TmKind::Add));
    b.abx(OpCode::ForLoop, 1, 3);
    b.abc(OpCode::Return1, 0, 2, 1);
    push_chunk(&mut vm, b.build());

    vm.call(0, 1).unwrap();
    // 1 + 1.5 + 2
    assert_eq!(vm.to_number(-1), Some(4.5));
}

#[test]
fn test_for_loop_rejects_zero_step() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut b = ChunkBuilder::main("zstep");
    b.asbx(OpCode::LoadI, 0, 1);
    b.asbx(OpCode::LoadI, 1, 10);
    b.asbx(OpCode::LoadI, 2, 0);
    b.abx(OpCode::ForPrep, 0, 0);
    b.abx(OpCode::ForLoop, 0, 1);
    b.abc(OpCode::Return0, 0, 1, 1);
    push_chunk(&mut vm, b.build());

    let msg = run_error(&mut vm);
    assert_eq!(msg, "zstep:1: 'for' step is zero");
}

#[test]
fn test_table_constructor_and_fields() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut b = ChunkBuilder::main("tables");
    let x = b.k_str(&mut vm, "x");
    b.abc(OpCode::NewTable, 0, 1, 3);
    b.abc(OpCode::ExtraArg, 0, 0, 0);
    b.asbx(OpCode::LoadI, 1, 42);
    b.abck(OpCode::SetField, 0, x, 1, false);
    b.asbx(OpCode::LoadI, 1, 10);
    b.asbx(OpCode::LoadI, 2, 20);
    b.asbx(OpCode::LoadI, 3, 30);
    b.abc(OpCode::SetList, 0, 3, 0);
    b.abc(OpCode::GetField, 4, 0, x);
    b.abc(OpCode::Len, 5, 0, 0);
    b.abc(OpCode::GetI, 6, 0, 2);
    b.abc(OpCode::Return, 4, 4, 0);
    push_chunk(&mut vm, b.build());

    vm.call(0, 3).unwrap();
    assert_eq!(vm.to_integer(1), Some(42));
    assert_eq!(vm.to_integer(2), Some(3));
    assert_eq!(vm.to_integer(3), Some(20));
}

#[test]
fn test_index_nil_is_an_error() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut b = ChunkBuilder::main("index");
    let x = b.k_str(&mut vm, "x");
    b.abc(OpCode::LoadNil, 0, 0, 0);
    b.abc(OpCode::GetField, 1, 0, x);
    b.abc(OpCode::Return0, 0, 1, 1);
    push_chunk(&mut vm, b.build());

    let msg = run_error(&mut vm);
    assert!(msg.contains("attempt to index a nil value"), "{}", msg);
}

#[test]
fn test_globals_through_env_upvalue() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut b = ChunkBuilder::main("globals");
    let answer = b.k_str(&mut vm, "answer");
    let value = b.k(LuaValue::integer(42));
    b.abck(OpCode::SetTabUp, 0, answer, value, true);
    b.abc(OpCode::GetTabUp, 0, 0, answer);
    b.abc(OpCode::Return1, 0, 2, 1);
    push_chunk(&mut vm, b.build());

    vm.call(0, 1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(42));
    vm.pop(1);
    assert_eq!(vm.get_global("answer").unwrap(), LUA_TNUMBER as i32);
    assert_eq!(vm.to_integer(-1), Some(42));
}

/// function(a, b) if a < b then return b end return a end
fn max_chunk() -> Chunk {
    let mut b = ChunkBuilder::function("max", 2);
    b.abck(OpCode::Lt, 0, 1, 0, false);
    let to_a = b.jump();
    b.abc(OpCode::Return1, 1, 2, 1);
    b.patch_to_here(to_a);
    b.abc(OpCode::Return1, 0, 2, 1);
    b.build()
}

#[test]
fn test_comparison_jumps() {
    let mut vm = LuaVM::new(SafeOption::default());
    push_chunk(&mut vm, max_chunk());
    vm.push_integer(3);
    vm.push_number(7.5);
    vm.call(2, 1).unwrap();
    assert_eq!(vm.to_number(-1), Some(7.5));
    vm.pop(1);

    push_chunk(&mut vm, max_chunk());
    vm.push_integer(9);
    vm.push_number(7.5);
    vm.call(2, 1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(9));
    vm.pop(1);

    push_chunk(&mut vm, max_chunk());
    vm.push_string("apple").unwrap();
    vm.push_string("banana").unwrap();
    vm.call(2, 1).unwrap();
    assert_eq!(vm.to_string(-1).as_deref(), Some("banana"));
    vm.pop(1);

    push_chunk(&mut vm, max_chunk());
    vm.push_integer(1);
    vm.push_string("x").unwrap();
    assert_eq!(vm.pcall(2, 1, 0), LuaStatus::ErrRun);
    let msg = vm.to_string(-1).unwrap();
    assert_eq!(msg, "max:1: attempt to compare number with string");
}

#[test]
fn test_concat_converts_numbers() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut b = ChunkBuilder::function("cat", 3);
    b.abc(OpCode::Move, 3, 0, 0);
    b.abc(OpCode::Move, 4, 1, 0);
    b.abc(OpCode::Move, 5, 2, 0);
    b.abc(OpCode::Concat, 3, 3, 0);
    b.abc(OpCode::Return1, 3, 2, 1);
    push_chunk(&mut vm, b.build());
    vm.push_string("x").unwrap();
    vm.push_integer(1);
    vm.push_number(3.0);
    vm.call(3, 1).unwrap();
    assert_eq!(vm.to_string(-1).as_deref(), Some("x13.0"));
}

#[test]
fn test_concat_table_is_an_error() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut b = ChunkBuilder::function("cat", 2);
    b.abc(OpCode::Move, 2, 0, 0);
    b.abc(OpCode::Move, 3, 1, 0);
    b.abc(OpCode::Concat, 2, 2, 0);
    b.abc(OpCode::Return1, 2, 2, 1);
    push_chunk(&mut vm, b.build());
    vm.push_string("x").unwrap();
    vm.new_table().unwrap();
    assert_eq!(vm.pcall(2, 1, 0), LuaStatus::ErrRun);
    let msg = vm.to_string(-1).unwrap();
    assert!(msg.ends_with("attempt to concatenate a table value"), "{}", msg);
}

fn add_metamethod(vm: &mut LuaVM) -> LuaResult<usize> {
    // (table, 1) or (1, table)
    let n = vm.to_integer(1).or_else(|| vm.to_integer(2)).unwrap_or(0);
    vm.push_integer(100 + n);
    Ok(1)
}

#[test]
fn test_binary_metamethod() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut b = ChunkBuilder::function("add", 2);
    b.abc(OpCode::Add, 2, 0, 1);
    b.abc(OpCode::MmBin, 0, 1, tm(TmKind::Add));
    b.abc(OpCode::Return1, 2, 2, 1);
    push_chunk(&mut vm, b.build());

    vm.new_table().unwrap();
    vm.new_table().unwrap();
    vm.push_cfunction(add_metamethod);
    vm.set_field(-2, "__add").unwrap();
    vm.set_metatable(-2).unwrap();
    vm.push_integer(5);
    vm.call(2, 1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(105));
}

#[test]
fn test_index_metamethod_chain() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut b = ChunkBuilder::function("get", 1);
    let x = b.k_str(&mut vm, "x");
    b.abc(OpCode::GetField, 1, 0, x);
    b.abc(OpCode::Return1, 1, 2, 1);
    let get = b.build();

    // base = { x = 5 }, t = setmetatable({}, { __index = base })
    vm.new_table().unwrap();
    vm.push_integer(5);
    vm.set_field(-2, "x").unwrap();
    vm.set_global("base").unwrap();

    push_chunk(&mut vm, get);
    vm.new_table().unwrap();
    vm.new_table().unwrap();
    vm.get_global("base").unwrap();
    vm.set_field(-2, "__index").unwrap();
    vm.set_metatable(-2).unwrap();
    vm.call(1, 1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(5));
}

#[test]
fn test_constants_survive_collection_before_the_closure_exists() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut b = ChunkBuilder::function("get", 1);
    let key = b.k_str(&mut vm, "only_in_the_constants");
    b.abc(OpCode::GetField, 1, 0, key);
    b.abc(OpCode::Return1, 1, 2, 1);
    let get = b.build();

    // clear free slots so the stack holds nothing but live values
    vm.set_top(LUA_MINSTACK as i32).unwrap();
    vm.set_top(0).unwrap();
    vm.gc(GcOption::Collect);

    push_chunk(&mut vm, get);
    vm.new_table().unwrap();
    vm.push_integer(5);
    vm.set_field(-2, "only_in_the_constants").unwrap();
    vm.call(1, 1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(5));
}

#[test]
fn test_newindex_metamethod_redirects() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut b = ChunkBuilder::function("set", 1);
    let y = b.k_str(&mut vm, "y");
    let seven = b.k(LuaValue::integer(7));
    b.abck(OpCode::SetField, 0, y, seven, true);
    b.abc(OpCode::Return0, 0, 1, 1);
    let set = b.build();

    vm.new_table().unwrap();
    vm.set_global("store").unwrap();

    push_chunk(&mut vm, set);
    vm.new_table().unwrap();
    vm.new_table().unwrap();
    vm.get_global("store").unwrap();
    vm.set_field(-2, "__newindex").unwrap();
    vm.set_metatable(-2).unwrap();
    // keep the proxy to check it stayed empty
    vm.push_value(-1);
    vm.insert(1);
    vm.call(1, 0).unwrap();

    vm.push_nil();
    assert!(!vm.next(1).unwrap());
    vm.get_global("store").unwrap();
    vm.get_field(-1, "y").unwrap();
    assert_eq!(vm.to_integer(-1), Some(7));
}

#[test]
fn test_varargs_are_returned() {
    let mut vm = LuaVM::new(SafeOption::default());
    let mut b = ChunkBuilder::function("va", 0);
    b.vararg();
    b.abc(OpCode::Vararg, 0, 0, 0);
    b.abc(OpCode::Return, 0, 0, 1);
    push_chunk(&mut vm, b.build());
    vm.push_integer(1);
    vm.push_integer(2);
    vm.push_integer(3);
    vm.call(3, LUA_MULTRET).unwrap();
    assert_eq!(vm.get_top(), 3);
    assert_eq!(vm.to_integer(1), Some(1));
    assert_eq!(vm.to_integer(3), Some(3));
}

#[test]
fn test_vararg_with_fixed_parameter() {
    let mut vm = LuaVM::new(SafeOption::default());
    // function(a, ...) local x, y = ... return a, y end
    let mut b = ChunkBuilder::function("va", 1);
    b.vararg();
    b.abc(OpCode::Vararg, 1, 0, 3);
    b.abc(OpCode::Move, 3, 0, 0);
    b.abc(OpCode::Move, 4, 2, 0);
    b.abc(OpCode::Return, 3, 3, 2);
    push_chunk(&mut vm, b.build());
    vm.push_string("a").unwrap();
    vm.push_integer(10);
    vm.push_integer(20);
    vm.push_integer(30);
    vm.call(4, LUA_MULTRET).unwrap();
    assert_eq!(vm.get_top(), 2);
    assert_eq!(vm.to_string(1).as_deref(), Some("a"));
    assert_eq!(vm.to_integer(2), Some(20));
}

#[test]
fn test_deep_tail_calls_run_in_constant_stack() {
    let mut vm = LuaVM::new(SafeOption::default());
    // function f(n) if n == 0 then return "done" end return f(n - 1) end
    let mut b = ChunkBuilder::main("countdown");
    b.params(1);
    let done = b.k_str(&mut vm, "done");
    let f = b.k_str(&mut vm, "f");
    b.abck(OpCode::EqI, 0, Instruction::int_to_sc(0), 0, false);
    let recurse = b.jump();
    b.abx(OpCode::LoadK, 1, done);
    b.abc(OpCode::Return1, 1, 2, 1);
    b.patch_to_here(recurse);
    b.abc(OpCode::GetTabUp, 1, 0, f);
    b.abc(OpCode::AddI, 2, 0, Instruction::int_to_sc(-1));
    b.abck(OpCode::MmBinI, 0, Instruction::int_to_sc(1), tm(TmKind::Sub), false);
    b.abck(OpCode::TailCall, 1, 2, 0, false);
    b.abc(OpCode::Return, 1, 0, 0);
    push_chunk(&mut vm, b.build());
    vm.set_global("f").unwrap();

    vm.get_global("f").unwrap();
    vm.push_integer(100_000);
    vm.call(1, 1).unwrap();
    assert_eq!(vm.to_string(-1).as_deref(), Some("done"));
    assert!(vm.state.stack.len() < 1000);
}

#[test]
fn test_lua_recursion_overflows_the_stack() {
    let mut vm = LuaVM::new(SafeOption {
        max_stack_size: 20_000,
        ..SafeOption::default()
    });
    // function f() f() end
    let mut b = ChunkBuilder::main("rec");
    let f = b.k_str(&mut vm, "f");
    b.abc(OpCode::GetTabUp, 0, 0, f);
    b.abc(OpCode::Call, 0, 1, 1);
    b.abc(OpCode::Return0, 0, 1, 1);
    push_chunk(&mut vm, b.build());
    vm.set_global("f").unwrap();

    vm.get_global("f").unwrap();
    let msg = run_error(&mut vm);
    assert!(msg.contains("stack overflow"), "{}", msg);
    // the thread is usable again
    vm.push_integer(1);
    assert_eq!(vm.get_top(), 1);
}

fn iter_pairs(vm: &mut LuaVM) -> LuaResult<usize> {
    let i = vm.to_integer(2).unwrap_or(0);
    if i >= 3 {
        vm.push_nil();
        return Ok(1);
    }
    vm.push_integer(i + 1);
    vm.push_integer((i + 1) * 10);
    Ok(2)
}

#[test]
fn test_generic_for_with_native_iterator() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.push_cfunction(iter_pairs);
    vm.set_global("iter").unwrap();

    // local sum = 0; for i, v in iter, nil, 0 do sum = sum + v end; return sum
    let mut b = ChunkBuilder::main("gfor");
    let iter = b.k_str(&mut vm, "iter");
    b.asbx(OpCode::LoadI, 0, 0);
    b.abc(OpCode::GetTabUp, 1, 0, iter);
    b.abc(OpCode::LoadNil, 2, 0, 0);
    b.asbx(OpCode::LoadI, 3, 0);
    b.abc(OpCode::LoadNil, 4, 0, 0);
    b.abx(OpCode::TForPrep, 1, 2);
    b.abc(OpCode::Add, 0, 0, 6);
    b.abc(OpCode::MmBin, 0, 6, tm(TmKind::Add));
    b.abc(OpCode::TForCall, 1, 0, 2);
    b.abx(OpCode::TForLoop, 1, 4);
    b.abc(OpCode::Return1, 0, 2, 1);
    push_chunk(&mut vm, b.build());

    vm.call(0, 1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(60));
}

fn stop_after_budget(vm: &mut LuaVM) -> LuaResult<()> {
    Err(vm.runtime_error("instruction budget exhausted"))
}

#[test]
fn test_count_hook_interrupts_endless_loop() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.set_instruction_hook(1000, Some(stop_after_budget));
    let mut b = ChunkBuilder::main("spin");
    let top = b.pc();
    b.jump_to(top);
    push_chunk(&mut vm, b.build());

    let msg = run_error(&mut vm);
    assert_eq!(msg, "spin:1: instruction budget exhausted");

    vm.set_instruction_hook(0, None);
    let mut b = ChunkBuilder::main("done");
    b.asbx(OpCode::LoadI, 0, 1);
    b.abc(OpCode::Return1, 0, 2, 1);
    push_chunk(&mut vm, b.build());
    vm.call(0, 1).unwrap();
    assert_eq!(vm.to_integer(-1), Some(1));
}
