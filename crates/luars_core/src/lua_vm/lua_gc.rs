// Collector driver (lgc.c luaC_step / luaC_fullgc and lapi.c lua_gc).
//
// The collector in `gc` only knows the heap. Everything that has to run
// Lua code (finalizers) or consult the VM configuration lives here.

use crate::gc::{G_OLD1, GCSTPGC, GCSTPUSR, GcKind, GcState};
use crate::lua_value::LuaValue;
use crate::lua_vm::call_info::call_status::CIST_FIN;
use crate::lua_vm::execute::metamethod::TmKind;
use crate::lua_vm::lua_limits::{GC_STOPPED_DEBT, GCFINALIZECOST, GCFINMAX, WORK2MEM};
use crate::lua_vm::{LuaResult, LuaStatus, LuaVM};

/// Mode reported by `GcOption::Generational`/`GcOption::Incremental`
pub const LUA_GCGEN: i64 = 10;
pub const LUA_GCINC: i64 = 11;

/// Collector control operations (`lua_gc` options)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOption {
    /// Stop automatic collection
    Stop,
    /// Restart automatic collection
    Restart,
    /// Full collection
    Collect,
    /// Memory in use, in KiB
    Count,
    /// Remainder of memory in use modulo 1024
    CountB,
    /// Collection step worth `n` KiB of allocation (0: one basic step).
    /// Returns 1 when the step finished a cycle.
    Step(i64),
    /// Sets the pause, returns the previous value
    SetPause(i32),
    /// Sets the step multiplier, returns the previous value
    SetStepMul(i32),
    IsRunning,
    /// Switches to generational mode; 0 keeps a parameter unchanged
    Generational { minor_mul: i32, major_mul: i32 },
    /// Switches to incremental mode; 0 keeps a parameter unchanged
    Incremental {
        pause: i32,
        step_mul: i32,
        step_size: i32,
    },
}

impl LuaVM {
    /// Collector control (`lua_gc`). Returns -1 when called while a
    /// finalizer runs.
    pub fn gc(&mut self, option: GcOption) -> i64 {
        if self.gc.gc_stp & GCSTPGC != 0 {
            return -1;
        }
        self.lock();
        let res = match option {
            GcOption::Stop => {
                self.gc.gc_stp = GCSTPUSR;
                0
            }
            GcOption::Restart => {
                self.gc.set_debt(0);
                self.gc.gc_stp = 0;
                0
            }
            GcOption::Collect => {
                self.full_gc(false);
                0
            }
            GcOption::Count => (self.gc.total_memory() >> 10) as i64,
            GcOption::CountB => (self.gc.total_memory() & 0x3ff) as i64,
            GcOption::Step(kib) => {
                let old_stp = self.gc.gc_stp;
                // let the collector run for this step
                self.gc.gc_stp = 0;
                let mut debt: isize = 1;
                if kib == 0 {
                    self.gc.set_debt(0);
                    self.gc_step();
                } else {
                    debt = kib as isize * 1024 + self.gc.gc_debt;
                    self.gc.set_debt(debt);
                    if self.gc.gc_debt > 0 {
                        self.gc_step();
                    }
                }
                self.gc.gc_stp = old_stp;
                i64::from(debt > 0 && self.gc.gc_state == GcState::Pause)
            }
            GcOption::SetPause(pause) => {
                let old = self.gc.gc_pause;
                self.gc.gc_pause = pause;
                old as i64
            }
            GcOption::SetStepMul(mul) => {
                let old = self.gc.gc_stepmul;
                self.gc.gc_stepmul = mul;
                old as i64
            }
            GcOption::IsRunning => i64::from(self.gc.is_running()),
            GcOption::Generational {
                minor_mul,
                major_mul,
            } => {
                let res = self.gc_mode_code();
                if minor_mul != 0 {
                    self.gc.gen_minor_mul = minor_mul;
                }
                if major_mul != 0 {
                    self.gc.gen_major_mul = major_mul;
                }
                self.change_mode(GcKind::Generational);
                res
            }
            GcOption::Incremental {
                pause,
                step_mul,
                step_size,
            } => {
                let res = self.gc_mode_code();
                if pause != 0 {
                    self.gc.gc_pause = pause;
                }
                if step_mul != 0 {
                    self.gc.gc_stepmul = step_mul;
                }
                if step_size != 0 {
                    self.gc.gc_stepsize = step_size;
                }
                self.change_mode(GcKind::Incremental);
                res
            }
        };
        self.unlock();
        res
    }

    fn gc_mode_code(&self) -> i64 {
        if self.gc.is_dec_gc_mode_gen() {
            LUA_GCGEN
        } else {
            LUA_GCINC
        }
    }

    // ============ Checkpoints ============

    /// Allocation checkpoint (`luaC_checkGC`). Enforces the memory ceiling
    /// first: one emergency collection, then an out-of-memory error.
    pub(crate) fn check_gc(&mut self) -> LuaResult<()> {
        if self.gc.total_memory() as isize > self.safe_option.max_memory_limit {
            self.check_memory_limit()?;
        }
        if self.gc.gc_debt > 0 || (self.safe_option.gc_stress && self.gc.is_running()) {
            self.gc_step();
        }
        Ok(())
    }

    fn check_memory_limit(&mut self) -> LuaResult<()> {
        if !self.gc.gc_stopem && !self.gc.gc_emergency {
            log::debug!(
                "memory limit reached ({} bytes), emergency collection",
                self.gc.total_memory()
            );
            self.full_gc(true);
            self.gc.stats.emergency_collections += 1;
        }
        if self.gc.total_memory() as isize > self.safe_option.max_memory_limit {
            return Err(self.memory_error());
        }
        Ok(())
    }

    /// One collector step sized by the current debt (`luaC_step`)
    pub fn gc_step(&mut self) {
        if !self.gc.is_running() {
            self.gc.set_debt(GC_STOPPED_DEBT);
        } else if self.gc.is_dec_gc_mode_gen() {
            self.gen_step();
        } else {
            self.inc_step();
        }
    }

    /// One unit of work, running finalizers in the `CallFin` state
    fn single_step(&mut self) -> usize {
        if self.gc.gc_state == GcState::CallFin
            && self.gc.pending_finalizers() > 0
            && !self.gc.gc_emergency
        {
            return self.run_a_few_finalizers(GCFINMAX) * GCFINALIZECOST;
        }
        self.with_roots(|gc, pool, roots| gc.single_step(pool, roots))
    }

    /// Runs steps until the collector reaches `state`
    /// (`luaC_runtilstate`).
    pub fn run_until_state(&mut self, state: GcState) {
        while self.gc.gc_state != state {
            self.single_step();
        }
    }

    fn atomic(&mut self) -> usize {
        self.with_roots(|gc, pool, roots| gc.atomic(pool, roots))
    }

    /// Incremental step (`incstep`): converts debt into work units and
    /// works until the debt is paid or the cycle ends.
    fn inc_step(&mut self) {
        let stepmul = (self.gc.gc_stepmul.max(0) | 1) as isize;
        let mut debt = (self.gc.gc_debt / WORK2MEM) * stepmul;
        let stepsize = if self.gc.gc_stepsize < (isize::BITS as i32 - 2) {
            ((1isize << self.gc.gc_stepsize.max(0)) / WORK2MEM) * stepmul
        } else {
            isize::MAX
        };
        loop {
            let work = self.single_step();
            debt -= work as isize;
            if debt <= -stepsize || self.gc.gc_state == GcState::Pause {
                break;
            }
        }
        if self.gc.gc_state == GcState::Pause {
            self.gc.set_pause();
        } else {
            let debt = (debt / stepmul) * WORK2MEM;
            self.gc.set_debt(debt);
        }
    }

    /// Generational step (`genstep`): a minor collection, or a major one
    /// when memory grew past `gen_major_mul` percent since the last major.
    fn gen_step(&mut self) {
        if self.gc.last_atomic != 0 {
            self.step_gen_full();
            return;
        }
        let major_base = self.gc.gc_estimate;
        let major_inc = (major_base / 100) * self.gc.gen_major_mul.max(0) as isize;
        let total = self.gc.total_memory() as isize;
        if self.gc.gc_debt > 0 && total > major_base + major_inc {
            let numobjs = self.full_gen();
            if (self.gc.total_memory() as isize) >= major_base + major_inc / 2 {
                // bad collection: wait long for the next major one
                log::debug!("bad generational collection ({} objects marked)", numobjs);
                self.gc.last_atomic = numobjs;
                self.gc.set_pause();
            }
        } else {
            self.young_collection();
            self.gc.set_minor_debt();
            self.gc.gc_estimate = major_base;
        }
    }

    fn young_collection(&mut self) {
        self.with_roots(|gc, pool, roots| gc.young_collection(pool, roots));
        log::trace!("minor collection: {} bytes in use", self.gc.total_memory());
        self.call_pending_finalizers();
    }

    /// Full incremental-style cycle while generational collections keep
    /// being bad (`stepgenfull`).
    fn step_gen_full(&mut self) {
        let last_atomic = self.gc.last_atomic;
        if self.gc.gc_kind == GcKind::Generational {
            self.gc.enter_inc(&mut self.pool);
        }
        self.run_until_state(GcState::Propagate);
        let new_atomic = self.atomic();
        if new_atomic < last_atomic + (last_atomic >> 3) {
            // good collection: back to generational mode
            self.atomic_to_gen();
            self.gc.set_minor_debt();
            log::debug!("generational mode restored");
        } else {
            self.gc.gc_estimate = self.gc.total_memory() as isize;
            self.gc.enter_sweep();
            self.run_until_state(GcState::Pause);
            self.gc.set_pause();
            self.gc.last_atomic = new_atomic;
        }
    }

    fn atomic_to_gen(&mut self) {
        self.gc.atomic_to_gen(&mut self.pool);
        self.call_pending_finalizers();
    }

    /// Starts generational mode with a full mark (`entergen`); returns the
    /// number of objects marked.
    fn enter_gen(&mut self) -> usize {
        self.run_until_state(GcState::Pause);
        self.run_until_state(GcState::Propagate);
        let numobjs = self.atomic();
        self.atomic_to_gen();
        self.gc.set_minor_debt();
        numobjs
    }

    /// Major collection in generational mode (`fullgen`)
    fn full_gen(&mut self) -> usize {
        self.gc.enter_inc(&mut self.pool);
        self.enter_gen()
    }

    /// Full cycle in incremental mode (`fullinc`)
    fn full_inc(&mut self) {
        if self.gc.keep_invariant() {
            // sweep everything to turn black objects white again
            self.gc.enter_sweep();
        }
        self.run_until_state(GcState::Pause);
        self.run_until_state(GcState::CallFin);
        self.run_until_state(GcState::Pause);
        self.gc.set_pause();
    }

    /// Full collection (`luaC_fullgc`). An emergency collection runs no
    /// finalizers and does not shrink stacks.
    pub fn full_gc(&mut self, emergency: bool) {
        self.gc.gc_emergency = emergency;
        if self.gc.gc_kind == GcKind::Incremental {
            self.full_inc();
        } else {
            self.full_gen();
        }
        self.gc.gc_emergency = false;
    }

    /// Switches collector mode (`luaC_changemode`)
    pub fn change_mode(&mut self, mode: GcKind) {
        if mode != self.gc.gc_kind {
            log::debug!("gc mode change: {:?} -> {:?}", self.gc.gc_kind, mode);
            match mode {
                GcKind::Generational => {
                    self.enter_gen();
                }
                GcKind::Incremental => self.gc.enter_inc(&mut self.pool),
            }
        }
        self.gc.last_atomic = 0;
    }

    // ============ Finalizers ============

    fn run_a_few_finalizers(&mut self, max: usize) -> usize {
        let mut n = 0;
        while n < max && self.gc.pending_finalizers() > 0 {
            self.call_gc_tm();
            n += 1;
        }
        n
    }

    fn call_pending_finalizers(&mut self) {
        if self.gc.gc_emergency {
            return;
        }
        while self.gc.pending_finalizers() > 0 {
            self.call_gc_tm();
        }
    }

    /// Calls the `__gc` metamethod of the next object waiting for
    /// finalization (`GCTM`). Errors become warnings.
    fn call_gc_tm(&mut self) {
        let Some(id) = self.gc.tobefnz.pop_front() else {
            return;
        };
        let sweeping = self.gc.gc_state.is_sweep_phase();
        let current_white = self.gc.current_white;
        if let Some(h) = self.pool.gc_pool.header_mut(id.gc_ref()) {
            h.clear_finalized();
            if sweeping {
                h.make_white(current_white);
            } else if h.age() == G_OLD1 {
                self.gc.old1.push(id);
            }
        }
        let obj = LuaValue::from_gc_id(id);
        let tm = self.get_tm_by_obj(&obj, TmKind::Gc);
        if tm.is_nil() {
            return;
        }
        let old_stp = self.gc.gc_stp;
        self.gc.gc_stp |= GCSTPGC;
        let func = self.state.top;
        self.state.push(tm);
        self.state.push(obj);
        self.state.current_ci_mut().call_status |= CIST_FIN;
        let status = self.pcall_raw(func, 0, |vm| vm.call_noyield(func, 0));
        self.state.current_ci_mut().call_status &= !CIST_FIN;
        self.gc.gc_stp = old_stp;
        self.gc.stats.finalizers_called += 1;
        if status != LuaStatus::Ok {
            self.warn_error("__gc");
            self.state.top -= 1;
        }
    }

    /// Reports the error object on top as a warning (`luaE_warnerror`)
    pub(crate) fn warn_error(&mut self, place: &str) {
        let err = self.state.get(self.state.top - 1);
        let msg = match err {
            LuaValue::String(s) => String::from_utf8_lossy(self.pool.str_bytes(s)).into_owned(),
            _ => "error object is not a string".to_string(),
        };
        self.warning("error in ", true);
        self.warning(place, true);
        self.warning(" (", true);
        self.warning(&msg, true);
        self.warning(")", false);
    }
}
