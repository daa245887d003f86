// Per-thread execution state: value stack, call frames, open upvalues and
// to-be-closed variables (lstate.h / ldo.c stack handling).
//
// Stack slots are addressed by index, so growing the stack never
// invalidates frames or open upvalues.

use crate::gc::{GC, ObjectPool, ThreadId, UpvalueId};
use crate::lua_value::{LuaUpvalue, LuaValue};
use crate::lua_vm::call_info::CallInfo;
use crate::lua_vm::lua_error::LuaStatus;
use crate::lua_vm::lua_limits::{BASIC_STACK_SIZE, ERROR_STACK_EXTRA, EXTRA_STACK, LUA_MINSTACK};

/// Why the stack could not grow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOverflow {
    /// Limit reached; the extra error space was granted
    Overflow,
    /// Already running in the extra error space
    InErrorSpace,
}

pub struct LuaState {
    pub thread_id: ThreadId,
    /// Value stack; the last `EXTRA_STACK` slots are reserve space
    pub stack: Vec<LuaValue>,
    /// First free slot
    pub top: usize,
    /// Frames; entries past `ci` are kept for reuse
    pub call_stack: Vec<CallInfo>,
    /// Index of the running frame (0 is the base frame of the thread)
    pub ci: usize,
    /// Open upvalues ordered by stack index, highest last
    pub open_upvalues: Vec<UpvalueId>,
    /// Stack indices of pending to-be-closed variables, highest last
    pub tbc_list: Vec<usize>,
    /// Error object of the error being propagated
    pub error_value: LuaValue,
    pub status: LuaStatus,
    /// Stack index of the current message handler (0 = none)
    pub errfunc: usize,
    /// Nesting of native calls and non-yieldable Lua calls
    pub n_ccalls: usize,
    /// Number of non-yieldable calls in the stack
    pub nny: usize,
    /// Maximum number of usable stack slots
    pub max_stack: usize,
}

impl LuaState {
    pub fn new(thread_id: ThreadId, max_stack: usize) -> Self {
        let mut state = LuaState {
            thread_id,
            stack: vec![LuaValue::Nil; BASIC_STACK_SIZE + EXTRA_STACK],
            top: 1,
            call_stack: Vec::with_capacity(8),
            ci: 0,
            open_upvalues: Vec::new(),
            tbc_list: Vec::new(),
            error_value: LuaValue::Nil,
            status: LuaStatus::Ok,
            errfunc: 0,
            n_ccalls: 0,
            nny: 0,
            max_stack,
        };
        // base frame: slot 0 stands for the (absent) entry function
        state
            .call_stack
            .push(CallInfo::new_c(0, 1 + LUA_MINSTACK, 0));
        state
    }

    // ============ Frames ============

    #[inline(always)]
    pub fn current_ci(&self) -> &CallInfo {
        &self.call_stack[self.ci]
    }

    #[inline(always)]
    pub fn current_ci_mut(&mut self) -> &mut CallInfo {
        &mut self.call_stack[self.ci]
    }

    /// Pushes a frame, reusing a recycled entry when one is available
    /// (`luaE_extendCI`). Returns the new frame index.
    pub fn push_frame(&mut self, ci: CallInfo) -> usize {
        self.ci += 1;
        if self.ci < self.call_stack.len() {
            self.call_stack[self.ci] = ci;
        } else {
            self.call_stack.push(ci);
        }
        self.ci
    }

    #[inline]
    pub fn pop_frame(&mut self) {
        debug_assert!(self.ci > 0);
        self.ci -= 1;
    }

    /// Number of active frames above the base frame
    #[inline(always)]
    pub fn call_depth(&self) -> usize {
        self.ci
    }

    // ============ Stack ============

    /// Usable stack size (without the reserve slots)
    #[inline(always)]
    pub fn stack_size(&self) -> usize {
        self.stack.len() - EXTRA_STACK
    }

    #[inline]
    pub fn get(&self, index: usize) -> LuaValue {
        self.stack.get(index).copied().unwrap_or_default()
    }

    /// Pushes a value; the caller made room with `check_stack`.
    #[inline]
    pub fn push(&mut self, v: LuaValue) {
        if self.top >= self.stack.len() {
            self.stack.resize(self.top + 1 + EXTRA_STACK, LuaValue::Nil);
        }
        self.stack[self.top] = v;
        self.top += 1;
    }

    #[inline]
    pub fn pop(&mut self) -> LuaValue {
        debug_assert!(self.top > 0);
        self.top -= 1;
        self.stack[self.top]
    }

    /// True when `n` more slots fit without growing
    #[inline(always)]
    pub fn has_room(&self, n: usize) -> bool {
        self.stack_size() > self.top + n
    }

    /// Grows the stack for `n` more slots (`luaD_growstack`). Past the
    /// limit the stack gets `ERROR_STACK_EXTRA` slots so a handler can run.
    pub fn grow_stack(&mut self, n: usize) -> Result<(), StackOverflow> {
        let size = self.stack_size();
        if size > self.max_stack {
            return Err(StackOverflow::InErrorSpace);
        }
        if n < self.max_stack {
            let needed = self.top + n;
            let new_size = (2 * size).min(self.max_stack).max(needed);
            if new_size <= self.max_stack {
                self.realloc_stack(new_size);
                return Ok(());
            }
        }
        self.realloc_stack(self.max_stack + ERROR_STACK_EXTRA);
        Err(StackOverflow::Overflow)
    }

    fn realloc_stack(&mut self, new_size: usize) {
        self.stack.resize(new_size + EXTRA_STACK, LuaValue::Nil);
    }

    /// Slots in use by any active frame (`stackinuse`)
    fn stack_in_use(&self) -> usize {
        let lim = self.call_stack[..=self.ci]
            .iter()
            .map(|ci| ci.top)
            .fold(self.top, usize::max);
        (lim + 1).max(LUA_MINSTACK)
    }

    /// Highest slot the collector must mark
    pub fn gc_mark_top(&self) -> usize {
        self.call_stack[..=self.ci]
            .iter()
            .map(|ci| ci.top)
            .fold(self.top, usize::max)
            .min(self.stack.len())
    }

    /// Releases unused stack and frames (`luaD_shrinkstack`). A stack that
    /// went past the limit drops back once it is no longer needed.
    pub fn shrink_stack(&mut self) {
        let in_use = self.stack_in_use();
        let max = if in_use > self.max_stack {
            self.max_stack + ERROR_STACK_EXTRA
        } else {
            self.max_stack
        };
        let new_size = (in_use * 2).min(max);
        if in_use <= self.max_stack && self.stack_size() > new_size {
            self.realloc_stack(new_size);
        }
        // free half of the recycled frames (`luaE_shrinkCI`)
        let used = self.ci + 1;
        let spare = self.call_stack.len() - used;
        if spare > 1 {
            self.call_stack.truncate(used + spare / 2);
        }
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<LuaState>()
            + self.stack.len() * std::mem::size_of::<LuaValue>()
            + self.call_stack.len() * std::mem::size_of::<CallInfo>()
    }

    // ============ Upvalues ============

    /// Open upvalue for stack slot `level`, created if needed
    /// (`luaF_findupval`).
    pub fn find_upvalue(&mut self, pool: &mut ObjectPool, gc: &mut GC, level: usize) -> UpvalueId {
        let mut pos = self.open_upvalues.len();
        while pos > 0 {
            let uv = self.open_upvalues[pos - 1];
            let index = pool
                .gc_pool
                .upvalue(uv)
                .and_then(|u| u.stack_index())
                .unwrap_or(0);
            if index == level {
                return uv;
            }
            if index < level {
                break;
            }
            pos -= 1;
        }
        let uv = pool.create_upvalue(
            gc,
            LuaUpvalue::Open {
                thread: self.thread_id,
                index: level,
            },
        );
        self.open_upvalues.insert(pos, uv);
        uv
    }

    /// Closes every open upvalue at or above `level`, copying the slot value
    /// into the upvalue (`luaF_closeupval`).
    pub fn close_upvalues(&mut self, pool: &mut ObjectPool, gc: &mut GC, level: usize) {
        while let Some(&uv) = self.open_upvalues.last() {
            let Some(index) = pool.gc_pool.upvalue(uv).and_then(|u| u.stack_index()) else {
                self.open_upvalues.pop();
                continue;
            };
            if index < level {
                break;
            }
            self.open_upvalues.pop();
            let value = self.get(index);
            if let Some(upvalue) = pool.gc_pool.upvalue_mut(uv) {
                upvalue.close(value);
            }
            let Some(h) = pool.gc_pool.header_mut(uv.0) else {
                continue;
            };
            if !h.is_white() {
                // no longer gray: a closed upvalue follows the normal rules
                h.nw2black();
                gc.barrier(&mut pool.gc_pool, uv.0, &value);
            }
        }
    }

    // ============ To-be-closed variables ============

    /// Registers slot `level` as a to-be-closed variable.
    pub fn mark_tbc(&mut self, level: usize) {
        debug_assert!(self.tbc_list.last().is_none_or(|&l| l < level));
        self.tbc_list.push(level);
    }

    /// Highest pending tbc slot at or above `level`
    #[inline]
    pub fn last_tbc_at_or_above(&self, level: usize) -> Option<usize> {
        self.tbc_list.last().copied().filter(|&l| l >= level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::GcRef;
    use crate::lua_vm::lua_limits::LUAI_MAXSTACK;

    fn state() -> LuaState {
        LuaState::new(ThreadId(GcRef::new(0, 0)), LUAI_MAXSTACK)
    }

    #[test]
    fn test_grow_and_overflow() {
        let mut s = LuaState::new(ThreadId(GcRef::new(0, 0)), 100);
        assert!(s.grow_stack(10).is_ok());
        assert!(s.stack_size() >= 11);
        s.top = 90;
        assert!(s.grow_stack(5).is_ok());
        assert_eq!(s.stack_size(), 100);
        assert_eq!(s.grow_stack(20), Err(StackOverflow::Overflow));
        assert_eq!(s.stack_size(), 100 + ERROR_STACK_EXTRA);
        assert_eq!(s.grow_stack(1), Err(StackOverflow::InErrorSpace));
        s.top = 1;
        s.shrink_stack();
        assert!(s.stack_size() <= 100);
    }

    #[test]
    fn test_frames_are_recycled() {
        let mut s = state();
        let a = s.push_frame(CallInfo::new_lua(1, 10, 0));
        let b = s.push_frame(CallInfo::new_lua(2, 20, 0));
        assert_eq!((a, b), (1, 2));
        s.pop_frame();
        s.pop_frame();
        assert_eq!(s.call_stack.len(), 3);
        let c = s.push_frame(CallInfo::new_c(5, 30, -1));
        assert_eq!(c, 1);
        assert!(s.current_ci().is_c());
        assert_eq!(s.gc_mark_top(), 30);
    }

    #[test]
    fn test_upvalues_are_shared_and_closed() {
        let mut gc = GC::new();
        let mut pool = ObjectPool::new(&mut gc, 0);
        let mut s = state();
        s.top = 6;
        s.stack[3] = LuaValue::Integer(7);
        let u1 = s.find_upvalue(&mut pool, &mut gc, 3);
        let u2 = s.find_upvalue(&mut pool, &mut gc, 5);
        assert_eq!(s.find_upvalue(&mut pool, &mut gc, 3), u1);
        let u0 = s.find_upvalue(&mut pool, &mut gc, 1);
        assert_eq!(s.open_upvalues, vec![u0, u1, u2]);
        s.close_upvalues(&mut pool, &mut gc, 2);
        assert_eq!(s.open_upvalues, vec![u0]);
        match pool.gc_pool.upvalue(u1) {
            Some(LuaUpvalue::Closed(v)) => assert_eq!(*v, LuaValue::Integer(7)),
            _ => panic!("upvalue should be closed"),
        }
    }
}
