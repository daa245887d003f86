// Function calls (ldo.c): frame setup, result moving and the native-call
// boundary. Lua-to-Lua calls never recurse on the Rust stack; only native
// functions and metamethods called from Rust re-enter `execute`.

use crate::lua_value::{FunctionBody, LuaValue};
use crate::lua_vm::call_info::call_status::{CIST_CLSRET, CIST_FRESH};
use crate::lua_vm::lua_limits::{LUA_MINSTACK, LUA_MULTRET};
use crate::lua_vm::{CFunction, CallInfo, LuaResult, LuaVM};

/// What `precall` did with the callee
enum Callee {
    Native(CFunction),
    Lua { fsize: usize, nparams: usize },
}

/// Encodes the expected result count of a frame with pending to-be-closed
/// variables (`codeNresults`).
#[inline]
pub(crate) fn code_nresults(n: i32) -> i32 {
    -n - 3
}

#[inline]
pub(crate) fn decode_nresults(n: i32) -> i32 {
    -n - 3
}

impl LuaVM {
    fn classify_callee(&self, func: usize) -> Option<Callee> {
        match self.state.stack[func] {
            LuaValue::CFunction(f) => Some(Callee::Native(f)),
            LuaValue::Function(id) => match self.pool.gc_pool.function(id)? {
                FunctionBody::C(cl) => Some(Callee::Native(cl.func)),
                FunctionBody::Lua(cl) => Some(Callee::Lua {
                    fsize: cl.chunk.max_stack_size,
                    nparams: cl.chunk.param_count,
                }),
            },
            _ => None,
        }
    }

    /// Prepares the call of the value at `func` with the arguments above it
    /// (`luaD_precall`). Native functions run to completion here and
    /// `Ok(false)` is returned; for a Lua function a new frame is pushed and
    /// the result is `Ok(true)`.
    pub(crate) fn precall(&mut self, func: usize, nresults: i32) -> LuaResult<bool> {
        let mut func = func;
        loop {
            match self.classify_callee(func) {
                Some(Callee::Native(f)) => {
                    self.precall_c(func, nresults, f)?;
                    return Ok(false);
                }
                Some(Callee::Lua { fsize, nparams }) => {
                    let mut narg = self.state.top - func - 1;
                    self.check_stack(fsize)?;
                    self.state
                        .push_frame(CallInfo::new_lua(func, func + 1 + fsize, nresults));
                    // complete missing parameters
                    while narg < nparams {
                        self.state.push(LuaValue::Nil);
                        narg += 1;
                    }
                    return Ok(true);
                }
                None => func = self.try_func_tm(func)?,
            }
        }
    }

    fn precall_c(&mut self, func: usize, nresults: i32, f: CFunction) -> LuaResult<()> {
        self.check_stack(LUA_MINSTACK)?;
        let top = self.state.top;
        self.state
            .push_frame(CallInfo::new_c(func, top + LUA_MINSTACK, nresults));
        self.unlock();
        let result = f(self);
        self.lock();
        let n = result?;
        self.finish_c_results(n)
    }

    /// Moves the `n` results of the native frame on top and pops it
    pub(crate) fn finish_c_results(&mut self, n: usize) -> LuaResult<()> {
        let base = self.state.current_ci().base();
        let n = n.min(self.state.top.saturating_sub(base));
        self.poscall(n)
    }

    /// Finishes the running frame: moves its `nres` results (on top of the
    /// stack) to the place of the function and pops the frame
    /// (`luaD_poscall`).
    pub(crate) fn poscall(&mut self, nres: usize) -> LuaResult<()> {
        let ci = self.state.current_ci();
        let (func, wanted) = (ci.func, ci.nresults);
        self.move_results(func, nres, wanted)?;
        self.state.pop_frame();
        Ok(())
    }

    /// `moveresults`: the common cases of 0 and 1 results avoid the generic
    /// copy.
    fn move_results(&mut self, res: usize, nres: usize, wanted: i32) -> LuaResult<()> {
        let wanted = match wanted {
            0 => {
                self.state.top = res;
                return Ok(());
            }
            1 => {
                let v = if nres == 0 {
                    LuaValue::Nil
                } else {
                    self.state.stack[self.state.top - nres]
                };
                self.state.stack[res] = v;
                self.state.top = res + 1;
                return Ok(());
            }
            LUA_MULTRET => nres,
            w if w < LUA_MULTRET => {
                // the native frame has pending to-be-closed variables
                let ci = self.state.current_ci_mut();
                ci.call_status |= CIST_CLSRET;
                ci.nres = nres;
                self.close_level(res, None, true)?;
                self.state.current_ci_mut().call_status &= !CIST_CLSRET;
                match decode_nresults(w) {
                    LUA_MULTRET => nres,
                    d => d as usize,
                }
            }
            w => w as usize,
        };
        let first = self.state.top - nres;
        let n = nres.min(wanted);
        self.state.stack.copy_within(first..first + n, res);
        if self.state.stack.len() < res + wanted {
            self.state.stack.resize(res + wanted, LuaValue::Nil);
        }
        for slot in &mut self.state.stack[res + n..res + wanted] {
            *slot = LuaValue::Nil;
        }
        self.state.top = res + wanted;
        Ok(())
    }

    /// Calls the value at `func` from Rust (`ccall`). `noyield` marks the
    /// call as a boundary that coroutines cannot yield across.
    fn ccall(&mut self, func: usize, nresults: i32, noyield: bool) -> LuaResult<()> {
        self.state.n_ccalls += 1;
        if noyield {
            self.state.nny += 1;
        }
        let result = self.call_body(func, nresults);
        self.state.n_ccalls -= 1;
        if noyield {
            self.state.nny -= 1;
        }
        result
    }

    /// Calls without touching the C-call counters; the caller accounts for
    /// the nesting.
    pub(crate) fn call_body(&mut self, func: usize, nresults: i32) -> LuaResult<()> {
        if self.state.n_ccalls >= self.safe_option.max_call_depth {
            self.check_stack(0)?;
            self.check_c_stack()?;
        }
        if self.precall(func, nresults)? {
            self.state.current_ci_mut().call_status |= CIST_FRESH;
            self.execute()?;
        }
        Ok(())
    }

    /// `luaE_checkcstack`: the first overflow is a regular error; overflowing
    /// again while handling it is an error in error handling.
    pub(crate) fn check_c_stack(&mut self) -> LuaResult<()> {
        let max = self.safe_option.max_call_depth;
        if self.state.n_ccalls == max {
            Err(self.runtime_error("C stack overflow"))
        } else if self.state.n_ccalls >= max / 10 * 11 {
            Err(self.error_error())
        } else {
            Ok(())
        }
    }

    /// Yieldable call (`luaD_call`)
    pub(crate) fn call_value(&mut self, func: usize, nresults: i32) -> LuaResult<()> {
        self.ccall(func, nresults, false)
    }

    /// Non-yieldable call (`luaD_callnoyield`)
    pub(crate) fn call_noyield(&mut self, func: usize, nresults: i32) -> LuaResult<()> {
        self.ccall(func, nresults, true)
    }

    /// Tail call of the value at `func` from the Lua frame `ci` whose
    /// function sits at `ci.func` (`luaD_pretailcall`). `narg1` counts the
    /// function plus its arguments; `delta` is the vararg shift of the
    /// caller. Returns `Ok(true)` when the frame now runs a Lua function.
    pub(crate) fn pretailcall(&mut self, func: usize, narg1: usize, delta: usize) -> LuaResult<bool> {
        let mut func = func;
        let mut narg1 = narg1;
        loop {
            match self.classify_callee(func) {
                Some(Callee::Native(f)) => {
                    // results stay on top for the caller's `poscall`
                    self.precall_c(func, LUA_MULTRET, f)?;
                    return Ok(false);
                }
                Some(Callee::Lua { fsize, nparams }) => {
                    self.check_stack(fsize.saturating_sub(delta))?;
                    let ci_idx = self.state.ci;
                    let ci_func = self.state.call_stack[ci_idx].func - delta;
                    // move down function and arguments
                    self.state.stack.copy_within(func..func + narg1, ci_func);
                    func = ci_func;
                    while narg1 <= nparams {
                        self.state.stack[func + narg1] = LuaValue::Nil;
                        narg1 += 1;
                    }
                    let ci = &mut self.state.call_stack[ci_idx];
                    ci.func = func;
                    ci.top = func + 1 + fsize;
                    ci.pc = 0;
                    ci.nextraargs = 0;
                    ci.set_tail();
                    self.state.top = func + narg1;
                    return Ok(true);
                }
                None => {
                    func = self.try_func_tm(func)?;
                    narg1 += 1;
                }
            }
        }
    }

    /// Raises the frame top after a call with `LUA_MULTRET` results
    /// (`adjustresults`)
    pub(crate) fn adjust_results(&mut self, nresults: i32) {
        let top = self.state.top;
        let ci = self.state.current_ci_mut();
        if nresults <= LUA_MULTRET && ci.top < top {
            ci.top = top;
        }
    }
}
