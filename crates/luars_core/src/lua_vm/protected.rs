// Protected execution (ldo.c luaD_pcall family) and closing of upvalues and
// to-be-closed variables (lfunc.c luaF_close).
//
// An error leaves the frames of the failed code on the call stack; the
// protected boundary restores its saved frame index, runs pending `__close`
// handlers and leaves the error object where the call used to be.

use crate::lua_value::LuaValue;
use crate::lua_vm::call_info::call_status::CIST_YPCALL;
use crate::lua_vm::execute::metamethod::TmKind;
use crate::lua_vm::{KFunction, LuaError, LuaResult, LuaStatus, LuaVM};

impl LuaVM {
    /// Runs `f` protected. On error the frame stack, the C-call counters and
    /// the message handler are restored, pending to-be-closed variables at
    /// or above `old_top` are closed and the error object is left at
    /// `old_top` (`luaD_pcall`).
    pub(crate) fn pcall_raw<F>(&mut self, old_top: usize, ef: usize, f: F) -> LuaStatus
    where
        F: FnOnce(&mut LuaVM) -> LuaResult<()>,
    {
        let old_ci = self.state.ci;
        let old_nny = self.state.nny;
        let old_n_ccalls = self.state.n_ccalls;
        let old_errfunc = self.state.errfunc;
        self.state.errfunc = ef;
        let mut status = match f(self) {
            Ok(()) => LuaStatus::Ok,
            Err(e) => e.status(),
        };
        if status != LuaStatus::Ok {
            self.state.ci = old_ci;
            self.state.nny = old_nny;
            self.state.n_ccalls = old_n_ccalls;
            status = self.close_protected(old_top, status);
            self.set_error_obj(status, old_top);
            self.state.shrink_stack();
        }
        self.state.errfunc = old_errfunc;
        status
    }

    /// Closes to-be-closed variables down to `level` in protected mode; an
    /// error in a `__close` handler becomes the new error and closing goes
    /// on with the remaining variables (`luaD_closeprotected`).
    pub(crate) fn close_protected(&mut self, level: usize, status: LuaStatus) -> LuaStatus {
        let old_ci = self.state.ci;
        let mut status = status;
        loop {
            let old_nny = self.state.nny;
            let old_n_ccalls = self.state.n_ccalls;
            match self.close_level(level, Some(status), false) {
                Ok(_) => return status,
                Err(e) => {
                    self.state.ci = old_ci;
                    self.state.nny = old_nny;
                    self.state.n_ccalls = old_n_ccalls;
                    status = e.status();
                }
            }
        }
    }

    /// Stores the error object for `status` at `old_top` and sets the top
    /// right above it (`luaD_seterrorobj`).
    pub(crate) fn set_error_obj(&mut self, status: LuaStatus, old_top: usize) {
        let v = match status {
            LuaStatus::Ok => LuaValue::Nil,
            LuaStatus::ErrMem => LuaValue::String(self.pool.mem_err_msg),
            LuaStatus::ErrErr => {
                LuaValue::String(self.create_string(b"error in error handling"))
            }
            _ => self.state.error_value,
        };
        if self.state.stack.len() <= old_top {
            self.state.stack.resize(old_top + 1, LuaValue::Nil);
        }
        self.state.stack[old_top] = v;
        self.state.top = old_top + 1;
    }

    /// Closes upvalues and calls the `__close` handlers of to-be-closed
    /// variables at or above `level`, highest first (`luaF_close`). `status`
    /// is `None` for a normal exit: handlers get a nil error and the top is
    /// kept; otherwise the error object is passed to each handler.
    pub(crate) fn close_level(
        &mut self,
        level: usize,
        status: Option<LuaStatus>,
        yieldable: bool,
    ) -> LuaResult<usize> {
        self.state
            .close_upvalues(&mut self.pool, &mut self.gc, level);
        while let Some(tbc) = self.state.last_tbc_at_or_above(level) {
            self.state.tbc_list.pop();
            self.call_close_method(tbc, status, yieldable)?;
        }
        Ok(level)
    }

    /// `prepcallclosemth`
    fn call_close_method(
        &mut self,
        tbc: usize,
        status: Option<LuaStatus>,
        yieldable: bool,
    ) -> LuaResult<()> {
        let obj = self.state.stack[tbc];
        let err = match status {
            None => LuaValue::Nil,
            Some(st) => {
                self.set_error_obj(st, tbc + 1);
                self.state.stack[tbc + 1]
            }
        };
        let tm = self.get_tm_by_obj(&obj, TmKind::Close);
        let func = self.state.top;
        self.state.push(tm);
        self.state.push(obj);
        self.state.push(err);
        if yieldable {
            self.call_value(func, 0)
        } else {
            self.call_noyield(func, 0)
        }
    }

    /// Calls the message handler for the error being raised
    /// (`luaG_errormsg`). The handler runs before anything is unwound; if
    /// it fails, the result is an error in error handling.
    pub(crate) fn call_message_handler(&mut self) -> LuaError {
        let errfunc = self.state.errfunc;
        let handler = self.state.get(errfunc);
        let err = self.state.error_value;
        let func = self.state.top;
        self.state.push(handler);
        self.state.push(err);
        self.state.errfunc = 0;
        let result = self.call_noyield(func, 1);
        self.state.errfunc = errfunc;
        match result {
            Ok(()) => {
                self.state.error_value = self.state.pop();
                LuaError::RuntimeError
            }
            Err(LuaError::OutOfMemory) => LuaError::OutOfMemory,
            Err(_) => self.error_error(),
        }
    }

    /// Calls the function below the `nargs` arguments on top in protected
    /// mode (`lua_pcall`). `msgh` is the stack index of a message handler,
    /// 0 for none. On error the stack holds just the error object in place
    /// of the function and its arguments.
    pub fn pcall(&mut self, nargs: usize, nresults: i32, msgh: i32) -> LuaStatus {
        // without a continuation the call never yields
        match self.pcall_k(nargs, nresults, msgh, 0, None) {
            Ok(status) => status,
            Err(e) => e.status(),
        }
    }

    /// `lua_pcallk`. Inside a coroutine with a continuation `k`, the called
    /// code may yield; an error is then recovered by the resume that runs
    /// the coroutine, which calls `k` with the error status.
    pub fn pcall_k(
        &mut self,
        nargs: usize,
        nresults: i32,
        msgh: i32,
        ctx: isize,
        k: Option<KFunction>,
    ) -> LuaResult<LuaStatus> {
        self.lock();
        let ef = if msgh == 0 { 0 } else { self.stack_index(msgh) };
        let func = self.state.top - (nargs + 1);
        let status = match k {
            Some(k) if self.state.nny == 0 => {
                let old_errfunc = self.state.errfunc;
                let ci = self.state.current_ci_mut();
                ci.k = Some(k);
                ci.ctx = ctx;
                ci.funcidx = func;
                ci.old_errfunc = old_errfunc;
                ci.call_status |= CIST_YPCALL;
                self.state.errfunc = ef;
                let result = self.call_value(func, nresults);
                if result.is_ok() {
                    let ci = self.state.current_ci_mut();
                    ci.call_status &= !CIST_YPCALL;
                    let old_errfunc = ci.old_errfunc;
                    self.state.errfunc = old_errfunc;
                }
                result?;
                LuaStatus::Ok
            }
            _ => self.pcall_raw(func, ef, |vm| vm.call_noyield(func, nresults)),
        };
        self.adjust_results(nresults);
        self.unlock();
        Ok(status)
    }
}
