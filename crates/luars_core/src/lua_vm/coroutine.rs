// Coroutines (ldo.c resume/yield and lcorolib.c status rules).
//
// A running coroutine's state is checked out of its thread object into
// `LuaVM::state`; the resumer waits on `LuaVM::resumers` until the coroutine
// yields, returns or fails. A yield is `Err(LuaError::Yield)` travelling up
// to `resume`; resuming finishes the interrupted native frame and then
// unrolls the remaining frames.

use crate::gc::ThreadId;
use crate::lua_value::{CoStatus, LuaThread, LuaValue};
use crate::lua_vm::call_info::call_status::{self, CIST_C, CIST_CLSRET, CIST_YPCALL};
use crate::lua_vm::lua_limits::{LUA_MINSTACK, LUA_MULTRET};
use crate::lua_vm::{KFunction, LuaError, LuaResult, LuaState, LuaStatus, LuaVM};

impl LuaVM {
    /// Creates a coroutine and pushes it (`lua_newthread`)
    pub fn new_thread(&mut self) -> ThreadId {
        self.lock();
        let id = self
            .pool
            .create_thread(&mut self.gc, LuaThread { state: None });
        let state = LuaState::new(id, self.safe_option.max_stack_size);
        if let Some(thread) = self.pool.gc_pool.thread_mut(id) {
            thread.state = Some(Box::new(state));
        }
        self.state.push(LuaValue::Thread(id));
        self.unlock();
        id
    }

    /// True if the running code may yield (`lua_isyieldable`)
    pub fn is_yieldable(&self) -> bool {
        self.state.nny == 0
    }

    /// Raw status of a thread (`lua_status`)
    pub fn status(&self, thread: ThreadId) -> LuaStatus {
        self.thread_state(thread)
            .map_or(LuaStatus::Ok, |s| s.status)
    }

    /// Status of `co` as seen from the running thread
    pub fn coroutine_status(&self, co: ThreadId) -> CoStatus {
        if co == self.state.thread_id {
            return CoStatus::Running;
        }
        if self.resumers.iter().any(|s| s.thread_id == co) {
            return CoStatus::Normal;
        }
        let Some(state) = self.thread_state(co) else {
            return CoStatus::Dead;
        };
        match state.status {
            LuaStatus::Yield => CoStatus::Suspended,
            LuaStatus::Ok if state.ci > 0 => CoStatus::Normal,
            LuaStatus::Ok if state.top == 1 => CoStatus::Dead,
            LuaStatus::Ok => CoStatus::Suspended,
            _ => CoStatus::Dead,
        }
    }

    /// Starts or continues coroutine `co` with the `nargs` values on top of
    /// the running stack (`lua_resume`). The arguments are popped; the
    /// values yielded or returned (or the error object) are pushed, and
    /// their count is returned with the status.
    pub fn resume(&mut self, co: ThreadId, nargs: usize) -> (LuaStatus, usize) {
        self.lock();
        let result = match self.check_resumable(co) {
            Ok(co_state) => self.run_coroutine(co, co_state, nargs),
            Err(msg) => {
                self.state.top -= nargs;
                let s = self.create_string(msg.as_bytes());
                self.state.push(LuaValue::String(s));
                (LuaStatus::ErrRun, 1)
            }
        };
        self.unlock();
        result
    }

    /// Takes the state of `co` out of its thread object if it can be resumed
    fn check_resumable(&mut self, co: ThreadId) -> Result<Box<LuaState>, &'static str> {
        if self.state.n_ccalls >= self.safe_option.max_call_depth {
            return Err("C stack overflow");
        }
        let thread = self
            .pool
            .gc_pool
            .thread_mut(co)
            .ok_or("cannot resume dead coroutine")?;
        let Some(state) = thread.state.as_ref() else {
            // running, or waiting on a coroutine it resumed
            return Err("cannot resume non-suspended coroutine");
        };
        match state.status {
            LuaStatus::Ok if state.ci != 0 => return Err("cannot resume non-suspended coroutine"),
            LuaStatus::Ok if state.top == 1 => return Err("cannot resume dead coroutine"),
            LuaStatus::Ok | LuaStatus::Yield => {}
            _ => return Err("cannot resume dead coroutine"),
        }
        thread.state.take().ok_or("cannot resume non-suspended coroutine")
    }

    fn run_coroutine(
        &mut self,
        co: ThreadId,
        mut co_state: Box<LuaState>,
        nargs: usize,
    ) -> (LuaStatus, usize) {
        let first = self.state.top - nargs;
        for i in first..self.state.top {
            co_state.push(self.state.stack[i]);
        }
        self.state.top = first;
        let base_ccalls = self.state.n_ccalls + 1;
        co_state.n_ccalls = base_ccalls;
        co_state.nny = 0;
        let caller = std::mem::replace(&mut self.state, co_state);
        self.resumers.push(caller);

        let mut status = match self.resume_body(nargs) {
            Ok(()) => LuaStatus::Ok,
            Err(e) => e.status(),
        };
        // recover errors caught by yieldable pcalls (`precover`)
        while status.is_error() {
            let Some(ci) = self.find_pcall() else {
                break;
            };
            self.state.ci = ci;
            let frame = &mut self.state.call_stack[ci];
            frame.call_status = call_status::set_recst(frame.call_status, status as u8);
            self.state.n_ccalls = base_ccalls;
            self.state.nny = 0;
            status = match self.unroll() {
                Ok(()) => LuaStatus::Ok,
                Err(e) => e.status(),
            };
        }
        if status.is_error() {
            // the coroutine is dead
            self.state.status = status;
            let top = self.state.top;
            self.set_error_obj(status, top);
            let top = self.state.top;
            self.state.current_ci_mut().top = top;
        }
        let nres = if status == LuaStatus::Yield {
            self.state.current_ci().nyield
        } else {
            self.state.top - (self.state.current_ci().func + 1)
        };

        let Some(caller) = self.resumers.pop() else {
            return (status, 0);
        };
        let mut co_state = std::mem::replace(&mut self.state, caller);
        let first = co_state.top - nres;
        for i in first..co_state.top {
            self.state.push(co_state.stack[i]);
        }
        co_state.top = first;
        if let Some(thread) = self.pool.gc_pool.thread_mut(co) {
            thread.state = Some(co_state);
        }
        (status, nres)
    }

    /// `resume` in ldo.c
    fn resume_body(&mut self, nargs: usize) -> LuaResult<()> {
        let first_arg = self.state.top - nargs;
        if self.state.status == LuaStatus::Ok {
            // starting: call the body
            return self.call_body(first_arg - 1, LUA_MULTRET);
        }
        self.state.status = LuaStatus::Ok;
        let ci = self.state.current_ci();
        if ci.is_lua() {
            // yielded inside a hook: just continue the Lua code
            self.state.top = first_arg;
            self.execute()?;
        } else {
            let mut n = nargs;
            if let Some(k) = ci.k {
                let ctx = ci.ctx;
                self.unlock();
                let result = k(self, LuaStatus::Yield, ctx);
                self.lock();
                n = result?;
            }
            self.finish_c_results(n)?;
        }
        self.unroll()
    }

    /// Finishes every frame interrupted by a yield (`unroll`)
    pub(crate) fn unroll(&mut self) -> LuaResult<()> {
        while self.state.ci != 0 {
            if self.state.current_ci().is_c() {
                self.finish_c_call()?;
            } else {
                self.finish_op()?;
                self.execute()?;
            }
        }
        Ok(())
    }

    /// Completes a native frame interrupted by a yield (`finishCcall`)
    fn finish_c_call(&mut self) -> LuaResult<()> {
        let ci = self.state.current_ci();
        let n = if ci.call_status & CIST_CLSRET != 0 {
            // it was closing variables on return: redo the return
            ci.nres
        } else {
            let status = if ci.call_status & CIST_YPCALL != 0 {
                self.finish_pcall_k()?
            } else {
                LuaStatus::Yield
            };
            self.adjust_results(LUA_MULTRET);
            let ci = self.state.current_ci();
            match ci.k {
                Some(k) => {
                    let ctx = ci.ctx;
                    self.unlock();
                    let result = k(self, status, ctx);
                    self.lock();
                    result?
                }
                None => self.state.top - ci.base(),
            }
        };
        self.finish_c_results(n)
    }

    /// Ends an interrupted yieldable pcall: on error, closes its pending
    /// variables and leaves the error object in place of the function
    /// (`finishpcallk`).
    fn finish_pcall_k(&mut self) -> LuaResult<LuaStatus> {
        let ci = self.state.current_ci();
        let recst = call_status::get_recst(ci.call_status);
        let status = if recst == 0 {
            LuaStatus::Yield
        } else {
            let func = ci.funcidx;
            let status = LuaStatus::from_u8(recst);
            self.close_level(func, Some(status), true)?;
            self.set_error_obj(status, func);
            self.state.shrink_stack();
            let ci = self.state.current_ci_mut();
            ci.call_status = call_status::set_recst(ci.call_status, 0);
            status
        };
        let ci = self.state.current_ci_mut();
        ci.call_status &= !CIST_YPCALL;
        let old_errfunc = ci.old_errfunc;
        self.state.errfunc = old_errfunc;
        Ok(status)
    }

    /// Innermost frame running a yieldable pcall (`findpcall`)
    fn find_pcall(&self) -> Option<usize> {
        (0..=self.state.ci)
            .rev()
            .find(|&i| self.state.call_stack[i].call_status & CIST_YPCALL != 0)
    }

    /// Yields the `nresults` values on top of the stack (`lua_yield`). The
    /// native function must return the resulting error:
    /// `return Err(vm.yield_(n))`.
    pub fn yield_(&mut self, nresults: usize) -> LuaError {
        self.yield_k(nresults, 0, None)
    }

    /// Yield with a continuation called on resume (`lua_yieldk`)
    pub fn yield_k(&mut self, nresults: usize, ctx: isize, k: Option<KFunction>) -> LuaError {
        if self.state.nny > 0 {
            let msg = if self.state.thread_id != self.main_thread {
                "attempt to yield across a C-call boundary"
            } else {
                "attempt to yield from outside a coroutine"
            };
            return self.runtime_error(msg);
        }
        self.state.status = LuaStatus::Yield;
        let ci = self.state.current_ci_mut();
        if ci.is_lua() {
            // inside a hook: nothing to hand over
            ci.nyield = 0;
        } else {
            ci.nyield = nresults;
            ci.k = k;
            ci.ctx = ctx;
        }
        LuaError::Yield
    }

    /// Kills a suspended or dead coroutine, closing its pending to-be-closed
    /// variables (`lua_closethread`). On error the error object is pushed.
    pub fn close_thread(&mut self, co: ThreadId) -> LuaResult<LuaStatus> {
        match self.coroutine_status(co) {
            CoStatus::Running => {
                return Err(self.runtime_error("cannot close a running coroutine"));
            }
            CoStatus::Normal => {
                return Err(self.runtime_error("cannot close a normal coroutine"));
            }
            CoStatus::Suspended | CoStatus::Dead => {}
        }
        let Some(mut co_state) = self
            .pool
            .gc_pool
            .thread_mut(co)
            .and_then(|t| t.state.take())
        else {
            return Ok(LuaStatus::Ok);
        };
        self.lock();
        co_state.n_ccalls = self.state.n_ccalls;
        co_state.nny = 0;
        let caller = std::mem::replace(&mut self.state, co_state);
        self.resumers.push(caller);
        let old_status = self.state.status;
        let status = self.reset_thread(old_status);
        let err = self.state.get(1);
        if let Some(caller) = self.resumers.pop() {
            let co_state = std::mem::replace(&mut self.state, caller);
            if let Some(thread) = self.pool.gc_pool.thread_mut(co) {
                thread.state = Some(co_state);
            }
        }
        if status != LuaStatus::Ok {
            self.state.push(err);
        }
        self.unlock();
        Ok(status)
    }

    /// Unwinds every frame of the running thread, closing pending
    /// variables (`luaE_resetthread`). With an error status the error
    /// object ends at stack slot 1.
    pub(crate) fn reset_thread(&mut self, status: LuaStatus) -> LuaStatus {
        self.state.ci = 0;
        self.state.stack[0] = LuaValue::Nil;
        {
            let base = &mut self.state.call_stack[0];
            base.func = 0;
            base.call_status = CIST_C;
        }
        let status = if status == LuaStatus::Yield {
            LuaStatus::Ok
        } else {
            status
        };
        self.state.status = LuaStatus::Ok;
        let status = self.close_protected(1, status);
        if status != LuaStatus::Ok {
            self.set_error_obj(status, 1);
        } else {
            self.state.top = 1;
        }
        let top = self.state.top;
        self.state.call_stack[0].top = top + LUA_MINSTACK;
        self.state.shrink_stack();
        status
    }
}
