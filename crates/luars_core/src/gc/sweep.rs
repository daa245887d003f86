// Sweep phase over the arena. Slots are walked by index in bounded steps;
// objects with a finalizer are swept separately through `finobj` and
// `tobefnz` (lgc.c: sweeplist, sweepgen, sweep2old, whitelist).

use crate::gc::gc_id::{GcId, GcRef, StringId};
use crate::gc::gc_object::{
    G_NEW, G_OLD, G_OLD0, G_OLD1, G_SURVIVAL, GcBody, GcHeader,
};
use crate::gc::{GC, GcState, ObjectPool};
use crate::lua_value::LuaUpvalue;
use crate::lua_vm::lua_limits::GCSWEEPMAX;

impl GC {
    pub(crate) fn enter_sweep(&mut self) {
        self.gc_state = GcState::SwpAllGc;
        self.sweep_pos = 0;
    }

    /// Releases one object and its bookkeeping (`freeobj`).
    pub(crate) fn free_object(&mut self, pool: &mut ObjectPool, r: GcRef) {
        let Some(obj) = pool.gc_pool.free(r) else {
            return;
        };
        let size = obj.size();
        self.track_free(size);
        self.stats.objects_freed += 1;
        self.stats.bytes_freed += size;
        match obj.body {
            GcBody::String(s) => {
                if s.is_short() {
                    pool.interner.remove(s.hash(), StringId(r));
                }
            }
            GcBody::Thread(thread) => {
                pool.threads.retain(|t| t.0 != r);
                // upvalues still pointing into the dead stack keep their value
                if let Some(state) = thread.state {
                    for uv in &state.open_upvalues {
                        if let Some(upvalue) = pool.gc_pool.upvalue_mut(*uv) {
                            if let LuaUpvalue::Open { index, .. } = *upvalue {
                                let v = state.stack.get(index).copied().unwrap_or_default();
                                upvalue.close(v);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Sweeps up to GCSWEEPMAX slots (`sweepstep` over `allgc`): dead
    /// objects are freed, survivors turn the current white.
    pub(crate) fn sweep_step(&mut self, pool: &mut ObjectPool) -> usize {
        let start = self.sweep_pos;
        let end = (start + GCSWEEPMAX).min(pool.gc_pool.slot_count());
        let other_white = GcHeader::otherwhite(self.current_white);
        let old_debt = self.gc_debt;
        for index in start..end {
            let Some(r) = pool.gc_pool.ref_at(index) else {
                continue;
            };
            let Some(h) = pool.gc_pool.header_mut(r) else {
                continue;
            };
            if h.is_fixed() || h.to_finalize() {
                continue;
            }
            if h.is_dead(other_white) {
                self.free_object(pool, r);
            } else {
                h.make_white(self.current_white);
                h.set_age(G_NEW);
            }
        }
        self.gc_estimate += self.gc_debt - old_debt;
        self.sweep_pos = end;
        if end >= pool.gc_pool.slot_count() {
            self.gc_state = GcState::SwpFinObj;
        }
        end - start
    }

    /// Sweeps `finobj` or `tobefnz`. Objects there are never dead at this
    /// point; they just get the new white.
    pub(crate) fn sweep_finalizable(&mut self, pool: &mut ObjectPool, tobefnz: bool) -> usize {
        let ids: Vec<GcId> = if tobefnz {
            self.tobefnz.iter().copied().collect()
        } else {
            self.finobj.clone()
        };
        let other_white = GcHeader::otherwhite(self.current_white);
        for id in &ids {
            let Some(h) = pool.gc_pool.header_mut(id.gc_ref()) else {
                continue;
            };
            debug_assert!(!h.is_dead(other_white));
            h.make_white(self.current_white);
            h.set_age(G_NEW);
        }
        ids.len()
    }

    /// Sweep of a minor collection (`sweepgen`): young dead objects are
    /// freed and survivors age by one step. Old objects are not visited.
    pub(crate) fn sweep_gen(&mut self, pool: &mut ObjectPool) {
        let current_white = self.current_white;
        let mut new_old1 = Vec::new();
        for index in 0..pool.gc_pool.slot_count() {
            let Some(r) = pool.gc_pool.ref_at(index) else {
                continue;
            };
            let Some(obj) = pool.gc_pool.get_mut(r) else {
                continue;
            };
            let h = &mut obj.header;
            if h.is_fixed() {
                continue;
            }
            match h.age() {
                G_NEW | G_SURVIVAL | G_OLD0 => {}
                _ => continue,
            }
            if h.is_white() {
                self.free_object(pool, r);
                continue;
            }
            if h.age() == G_NEW {
                // new objects go back to white
                h.make_white(current_white);
                h.set_age(G_SURVIVAL);
            } else {
                // the others become old and keep their color
                h.set_age(G_OLD1);
                new_old1.push(obj.to_gc_id(r));
            }
        }
        self.old1 = new_old1;
    }

    /// Frees dead objects and makes all survivors old (`sweep2old`).
    pub(crate) fn sweep_to_old(&mut self, pool: &mut ObjectPool) {
        for index in 0..pool.gc_pool.slot_count() {
            let Some(r) = pool.gc_pool.ref_at(index) else {
                continue;
            };
            let Some(obj) = pool.gc_pool.get_mut(r) else {
                continue;
            };
            if obj.header.is_fixed() {
                continue;
            }
            if obj.header.is_white() {
                self.free_object(pool, r);
                continue;
            }
            obj.header.set_age(G_OLD);
            match &obj.body {
                GcBody::Thread(_) => {
                    // threads must be watched
                    obj.header.make_gray();
                    self.grayagain.push(obj.to_gc_id(r));
                }
                GcBody::Upvalue(uv) if uv.is_open() => obj.header.make_gray(),
                _ => obj.header.nw2black(),
            }
        }
    }

    /// Makes every object white and young again (`whitelist`).
    pub(crate) fn whiten_all(&mut self, pool: &mut ObjectPool) {
        for index in 0..pool.gc_pool.slot_count() {
            let Some(r) = pool.gc_pool.ref_at(index) else {
                continue;
            };
            if let Some(h) = pool.gc_pool.header_mut(r) {
                if !h.is_fixed() {
                    h.make_white(self.current_white);
                    h.set_age(G_NEW);
                }
            }
        }
    }
}
