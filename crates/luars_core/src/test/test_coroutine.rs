// Coroutines: resume/yield, continuations, status and closing
use super::builder::*;
use crate::*;

fn yield_all(vm: &mut LuaVM) -> LuaResult<usize> {
    let n = vm.get_top() as usize;
    Err(vm.yield_(n))
}

/// function(y) y(1) y(2) return 3 end
fn body_chunk() -> Chunk {
    let mut b = ChunkBuilder::function("body", 1);
    b.abc(OpCode::Move, 1, 0, 0);
    b.asbx(OpCode::LoadI, 2, 1);
    b.abc(OpCode::Call, 1, 2, 1);
    b.abc(OpCode::Move, 1, 0, 0);
    b.asbx(OpCode::LoadI, 2, 2);
    b.abc(OpCode::Call, 1, 2, 1);
    b.asbx(OpCode::LoadI, 1, 3);
    b.abc(OpCode::Return1, 1, 2, 1);
    b.build()
}

#[test]
fn test_yield_sequence() {
    init_logger();
    let mut vm = LuaVM::new(SafeOption::default());
    let co = vm.new_thread();
    push_chunk(&mut vm, body_chunk());
    vm.xmove(co, 1);
    assert_eq!(vm.coroutine_status(co), CoStatus::Suspended);

    vm.push_cfunction(yield_all);
    assert_eq!(vm.resume(co, 1), (LuaStatus::Yield, 1));
    assert_eq!(vm.to_integer(-1), Some(1));
    vm.pop(1);
    assert_eq!(vm.coroutine_status(co), CoStatus::Suspended);

    assert_eq!(vm.resume(co, 0), (LuaStatus::Yield, 1));
    assert_eq!(vm.to_integer(-1), Some(2));
    vm.pop(1);

    assert_eq!(vm.resume(co, 0), (LuaStatus::Ok, 1));
    assert_eq!(vm.to_integer(-1), Some(3));
    vm.pop(1);
    assert_eq!(vm.coroutine_status(co), CoStatus::Dead);

    assert_eq!(vm.resume(co, 0), (LuaStatus::ErrRun, 1));
    assert_eq!(vm.to_string(-1).as_deref(), Some("cannot resume dead coroutine"));
}

fn echo_yield(vm: &mut LuaVM) -> LuaResult<usize> {
    // yields its argument plus one; returns what the next resume passes
    let n = vm.to_integer(1).unwrap_or(0);
    vm.push_integer(n + 1);
    Err(vm.yield_(1))
}

#[test]
fn test_resume_values_become_yield_results() {
    let mut vm = LuaVM::new(SafeOption::default());
    // function(y) return y(10) end
    let mut b = ChunkBuilder::function("echo", 1);
    b.abc(OpCode::Move, 1, 0, 0);
    b.asbx(OpCode::LoadI, 2, 10);
    b.abc(OpCode::Call, 1, 2, 0);
    b.abc(OpCode::Return, 1, 0, 0);
    let co = vm.new_thread();
    push_chunk(&mut vm, b.build());
    vm.xmove(co, 1);

    vm.push_cfunction(echo_yield);
    assert_eq!(vm.resume(co, 1), (LuaStatus::Yield, 1));
    assert_eq!(vm.to_integer(-1), Some(11));
    vm.pop(1);

    vm.push_string("a").unwrap();
    vm.push_string("b").unwrap();
    assert_eq!(vm.resume(co, 2), (LuaStatus::Ok, 2));
    assert_eq!(vm.to_string(-2).as_deref(), Some("a"));
    assert_eq!(vm.to_string(-1).as_deref(), Some("b"));
}

fn check_statuses(vm: &mut LuaVM) -> LuaResult<usize> {
    let me = vm.current_thread();
    let main = vm.main_thread();
    vm.push_boolean(vm.coroutine_status(me) == CoStatus::Running);
    vm.push_boolean(vm.coroutine_status(main) == CoStatus::Normal);
    vm.push_boolean(vm.is_yieldable());
    Ok(3)
}

#[test]
fn test_status_from_inside() {
    let mut vm = LuaVM::new(SafeOption::default());
    assert!(!vm.is_yieldable());
    let co = vm.new_thread();
    vm.push_cfunction(check_statuses);
    vm.xmove(co, 1);
    assert_eq!(vm.resume(co, 0), (LuaStatus::Ok, 3));
    assert!(vm.to_boolean(-3));
    assert!(vm.to_boolean(-2));
    assert!(vm.to_boolean(-1));
    assert_eq!(vm.current_thread(), vm.main_thread());
}

fn yield_with_continuation(vm: &mut LuaVM) -> LuaResult<usize> {
    Err(vm.yield_k(0, 7, Some(continuation)))
}

fn continuation(vm: &mut LuaVM, status: LuaStatus, ctx: isize) -> LuaResult<usize> {
    assert_eq!(status, LuaStatus::Yield);
    // values passed to the resume are on the stack
    let passed = vm.get_top() as i64;
    vm.push_integer(ctx as i64 * 10 + passed);
    Ok(1)
}

#[test]
fn test_yield_continuation() {
    let mut vm = LuaVM::new(SafeOption::default());
    let co = vm.new_thread();
    vm.push_cfunction(yield_with_continuation);
    vm.xmove(co, 1);
    assert_eq!(vm.resume(co, 0), (LuaStatus::Yield, 0));
    vm.push_boolean(true);
    vm.push_boolean(true);
    assert_eq!(vm.resume(co, 2), (LuaStatus::Ok, 1));
    assert_eq!(vm.to_integer(-1), Some(72));
}

fn call_and_yield(vm: &mut LuaVM) -> LuaResult<usize> {
    vm.push_cfunction(yield_all);
    vm.call(0, 0)?;
    Ok(0)
}

#[test]
fn test_yield_across_native_call_fails() {
    let mut vm = LuaVM::new(SafeOption::default());
    let co = vm.new_thread();
    vm.push_cfunction(call_and_yield);
    vm.xmove(co, 1);
    let (status, _) = vm.resume(co, 0);
    assert_eq!(status, LuaStatus::ErrRun);
    assert_eq!(
        vm.to_string(-1).as_deref(),
        Some("attempt to yield across a C-call boundary")
    );
    assert_eq!(vm.coroutine_status(co), CoStatus::Dead);
}

#[test]
fn test_yield_outside_coroutine_fails() {
    let mut vm = LuaVM::new(SafeOption::default());
    vm.push_cfunction(yield_all);
    assert_eq!(vm.pcall(0, 0, 0), LuaStatus::ErrRun);
    assert_eq!(
        vm.to_string(-1).as_deref(),
        Some("attempt to yield from outside a coroutine")
    );
}

#[test]
fn test_error_kills_the_coroutine() {
    fn fail(vm: &mut LuaVM) -> LuaResult<usize> {
        vm.push_string("inside")?;
        Err(vm.error())
    }
    let mut vm = LuaVM::new(SafeOption::default());
    let co = vm.new_thread();
    vm.push_cfunction(fail);
    vm.xmove(co, 1);
    // the error object comes last
    let (status, _) = vm.resume(co, 0);
    assert_eq!(status, LuaStatus::ErrRun);
    assert_eq!(vm.to_string(-1).as_deref(), Some("inside"));
    assert_eq!(vm.coroutine_status(co), CoStatus::Dead);
    assert_eq!(vm.status(co), LuaStatus::ErrRun);
}

#[test]
fn test_close_suspended_coroutine() {
    let mut vm = LuaVM::new(SafeOption::default());
    let co = vm.new_thread();
    push_chunk(&mut vm, body_chunk());
    vm.xmove(co, 1);
    vm.push_cfunction(yield_all);
    assert_eq!(vm.resume(co, 1), (LuaStatus::Yield, 1));
    vm.pop(1);

    assert_eq!(vm.close_thread(co).unwrap(), LuaStatus::Ok);
    assert_eq!(vm.coroutine_status(co), CoStatus::Dead);
    assert_eq!(vm.resume(co, 0), (LuaStatus::ErrRun, 1));
}

#[test]
fn test_suspended_coroutines_survive_collection() {
    let mut vm = LuaVM::new(SafeOption::default());
    let co = vm.new_thread();
    push_chunk(&mut vm, body_chunk());
    vm.xmove(co, 1);
    vm.push_cfunction(yield_all);
    assert_eq!(vm.resume(co, 1), (LuaStatus::Yield, 1));
    vm.pop(1);
    vm.gc(GcOption::Collect);
    assert_eq!(vm.resume(co, 0), (LuaStatus::Yield, 1));
    assert_eq!(vm.to_integer(-1), Some(2));
}
