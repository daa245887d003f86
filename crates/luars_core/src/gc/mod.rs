// Garbage collector of the runtime core, following lgc.c of Lua 5.4.
//
// Two modes share one mark/sweep engine:
// - Incremental: tri-color mark and sweep in bounded steps paid for by
//   allocation debt
// - Generational: minor collections over young objects, with a full
//   (major) collection when memory grows past a threshold
//
// Objects live in an arena (`GcPool`), so the "lists" of the reference
// collector become slot walks plus a few explicit vectors:
// - gray / grayagain: objects waiting for (re)traversal
// - weak / ephemeron / allweak: weak tables to clear in the atomic phase
// - finobj: objects with a finalizer; tobefnz: objects whose finalizer is due
//
// Tri-color invariant: black objects never point to white ones, kept by the
// write barriers below.
//
// Running finalizers needs the interpreter, so the states that call them
// (GCScallfin and the end of a generational cycle) are driven from
// `lua_vm::lua_gc`. Everything else lives here.

mod gc_id;
mod gc_object;
mod mark;
mod object_pool;
mod string_interner;
mod sweep;

use std::collections::VecDeque;

pub use gc_id::*;
pub use gc_object::*;
pub use mark::Heap;
pub use object_pool::*;
pub use string_interner::*;

use crate::lua_value::LuaValue;
use crate::lua_vm::LuaState;
use crate::lua_vm::execute::metamethod::TmKind;
use crate::lua_vm::lua_limits::{
    LUAI_GCMUL, LUAI_GCPAUSE, LUAI_GCSTEPSIZE, LUAI_GENMAJORMUL, LUAI_GENMINORMUL, PAUSEADJ,
};

/// Collector stopped by the user (`collectgarbage("stop")`)
pub const GCSTPUSR: u8 = 1;
/// Collector stopped by itself (while a finalizer runs)
pub const GCSTPGC: u8 = 2;
/// Collector stopped while the state is closing
pub const GCSTPCLS: u8 = 4;

const MAX_LMEM: isize = isize::MAX;

/// GC mode (KGC_INC / KGC_GEN)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    Incremental = 0,
    Generational = 1,
}

/// GC state machine (from lgc.h)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GcState {
    Propagate = 0,   // GCSpropagate
    EnterAtomic = 1, // GCSenteratomic
    Atomic = 2,      // GCSatomic
    SwpAllGc = 3,    // GCSswpallgc - sweep regular objects
    SwpFinObj = 4,   // GCSswpfinobj - sweep objects with finalizers
    SwpToBeFnz = 5,  // GCSswptobefnz - sweep objects to be finalized
    SwpEnd = 6,      // GCSswpend - sweep finished
    CallFin = 7,     // GCScallfin - call finalizers
    Pause = 8,       // GCSpause - between cycles
}

impl GcState {
    pub fn is_sweep_phase(self) -> bool {
        matches!(
            self,
            GcState::SwpAllGc | GcState::SwpFinObj | GcState::SwpToBeFnz | GcState::SwpEnd
        )
    }

    /// Black objects may not point to white ones while this holds.
    pub fn keep_invariant(self) -> bool {
        self <= GcState::Atomic
    }
}

#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GcStats {
    /// Completed major cycles (incremental cycles and full collections)
    pub major_collections: usize,
    pub minor_collections: usize,
    pub emergency_collections: usize,
    pub objects_freed: usize,
    pub bytes_freed: usize,
    pub finalizers_called: usize,
}

/// Everything the collector must treat as reachable besides the arena
/// itself. Thread states that are checked out of the arena (the running
/// one and the chain of resumers) are only reachable through here.
pub struct GcRoots<'a> {
    pub state: &'a mut LuaState,
    pub resumers: &'a mut [Box<LuaState>],
    pub main_thread: ThreadId,
    pub registry: LuaValue,
    pub type_metatables: &'a [Option<TableId>],
}

/// Garbage collector
pub struct GC {
    // === Debt and memory tracking ===
    /// Bytes allocated and not yet compensated by collector work; a step
    /// runs when this becomes positive.
    pub gc_debt: isize,
    /// Total bytes in use minus `gc_debt`
    pub total_bytes: isize,
    /// Estimate of non-garbage memory in use
    pub gc_estimate: isize,
    /// Objects traversed by the last atomic phase when a generational
    /// collection was bad; 0 otherwise
    pub last_atomic: usize,

    // === GC state ===
    pub gc_state: GcState,
    pub gc_kind: GcKind,
    /// Current white (0 or 1); flips in every atomic phase
    pub current_white: u8,
    /// Emergency collections never run finalizers or shrink stacks
    pub gc_emergency: bool,
    /// Stops emergency collections while the collector itself runs
    pub gc_stopem: bool,
    /// Combination of GCSTPUSR / GCSTPGC / GCSTPCLS; 0 means running
    pub gc_stp: u8,

    // === Parameters ===
    /// Pause between cycles, in percent
    pub gc_pause: i32,
    /// Collector speed relative to allocation, in percent
    pub gc_stepmul: i32,
    /// log2 of the step granularity in bytes
    pub gc_stepsize: i32,
    pub gen_minor_mul: i32,
    pub gen_major_mul: i32,

    // === Gray lists ===
    pub(crate) gray: Vec<GcId>,
    pub(crate) grayagain: Vec<GcId>,
    pub(crate) weak: Vec<TableId>,
    pub(crate) ephemeron: Vec<TableId>,
    pub(crate) allweak: Vec<TableId>,

    // === Finalization ===
    /// Objects with a finalizer, oldest first
    pub(crate) finobj: Vec<GcId>,
    /// Unreachable objects whose finalizer must run, next first
    pub(crate) tobefnz: VecDeque<GcId>,

    // === Sweep / generational bookkeeping ===
    pub(crate) sweep_pos: usize,
    /// Objects that turned OLD1 in the last minor collection
    pub(crate) old1: Vec<GcId>,

    pub stats: GcStats,
}

impl GC {
    pub fn new() -> Self {
        GC {
            gc_debt: 0,
            total_bytes: std::mem::size_of::<GC>() as isize,
            gc_estimate: 0,
            last_atomic: 0,
            gc_state: GcState::Pause,
            gc_kind: GcKind::Incremental,
            current_white: 0,
            gc_emergency: false,
            gc_stopem: false,
            gc_stp: 0,
            gc_pause: LUAI_GCPAUSE,
            gc_stepmul: LUAI_GCMUL,
            gc_stepsize: LUAI_GCSTEPSIZE,
            gen_minor_mul: LUAI_GENMINORMUL,
            gen_major_mul: LUAI_GENMAJORMUL,
            gray: Vec::with_capacity(128),
            grayagain: Vec::with_capacity(64),
            weak: Vec::new(),
            ephemeron: Vec::new(),
            allweak: Vec::new(),
            finobj: Vec::new(),
            tobefnz: VecDeque::new(),
            sweep_pos: 0,
            old1: Vec::new(),
            stats: GcStats::default(),
        }
    }

    // ============ Memory accounting ============

    /// Bytes currently in use (`gettotalbytes`)
    #[inline(always)]
    pub fn total_memory(&self) -> usize {
        (self.total_bytes + self.gc_debt).max(0) as usize
    }

    #[inline(always)]
    pub fn track_alloc(&mut self, size: usize) {
        self.gc_debt += size as isize;
    }

    #[inline(always)]
    pub fn track_free(&mut self, size: usize) {
        self.gc_debt -= size as isize;
    }

    /// An object changed its footprint from `old` to `new` bytes.
    #[inline(always)]
    pub fn track_resize(&mut self, old: usize, new: usize) {
        self.gc_debt += new as isize - old as isize;
    }

    #[inline(always)]
    pub fn is_running(&self) -> bool {
        self.gc_stp == 0
    }

    /// Sets the debt keeping the real number of allocated bytes
    /// (`total_bytes + gc_debt`) unchanged (`luaE_setdebt`).
    pub fn set_debt(&mut self, mut debt: isize) {
        let tb = self.total_bytes + self.gc_debt;
        if debt < tb - MAX_LMEM {
            debt = tb - MAX_LMEM;
        }
        self.total_bytes = tb - debt;
        self.gc_debt = debt;
    }

    /// Sets the debt so the next cycle starts when memory use reaches
    /// `estimate * pause / 100` (`setpause`).
    pub fn set_pause(&mut self) {
        let pause = self.gc_pause.max(0) as isize;
        let estimate = (self.gc_estimate / PAUSEADJ).max(1);
        let threshold = if pause < MAX_LMEM / estimate {
            estimate * pause
        } else {
            MAX_LMEM
        };
        let debt = (self.total_memory() as isize - threshold).min(0);
        self.set_debt(debt);
    }

    /// Next minor collection after memory grows `gen_minor_mul` percent.
    pub fn set_minor_debt(&mut self) {
        let debt = (self.total_memory() as isize / 100) * self.gen_minor_mul as isize;
        self.set_debt(-debt);
    }

    /// Generational mode, or incremental mode standing in for it after a bad
    /// major collection (`isdecGCmodegen`).
    #[inline]
    pub fn is_dec_gc_mode_gen(&self) -> bool {
        self.gc_kind == GcKind::Generational || self.last_atomic != 0
    }

    #[inline(always)]
    pub fn keep_invariant(&self) -> bool {
        self.gc_state.keep_invariant()
    }

    /// True while the given object is white with the dead white.
    pub fn is_object_dead(&self, gc_pool: &GcPool, r: GcRef) -> bool {
        gc_pool
            .header(r)
            .is_none_or(|h| h.is_dead(GcHeader::otherwhite(self.current_white)))
    }

    // ============ Write barriers (lgc.c) ============

    /// Forward barrier (`luaC_barrier_`): black `o` now points to `v`.
    pub fn barrier(&mut self, gc_pool: &mut GcPool, o: GcRef, v: &LuaValue) {
        let Some(vid) = v.gc_id() else {
            return;
        };
        let (o_black, o_old) = match gc_pool.header(o) {
            Some(h) => (h.is_black(), h.is_old()),
            None => return,
        };
        if !o_black || !gc_pool.header(vid.gc_ref()).is_some_and(|h| h.is_white()) {
            return;
        }
        if self.keep_invariant() {
            // restore the invariant by marking the new target
            self.mark_object(gc_pool, vid);
            if o_old {
                if let Some(h) = gc_pool.header_mut(vid.gc_ref()) {
                    h.set_age(G_OLD0);
                }
            }
        } else if self.gc_kind == GcKind::Incremental {
            // sweep phase: whiten 'o' to avoid further barriers
            if let Some(h) = gc_pool.header_mut(o) {
                h.make_white(self.current_white);
            }
        }
    }

    /// Backward barrier (`luaC_barrierback_`): black `o` (a table or a
    /// userdata) received `v`; `o` goes back to gray.
    pub fn barrier_back(&mut self, gc_pool: &mut GcPool, o: GcId, v: &LuaValue) {
        let Some(vid) = v.gc_id() else {
            return;
        };
        if !gc_pool.header(o.gc_ref()).is_some_and(|h| h.is_black())
            || !gc_pool.header(vid.gc_ref()).is_some_and(|h| h.is_white())
        {
            return;
        }
        let Some(h) = gc_pool.header_mut(o.gc_ref()) else {
            return;
        };
        if h.age() == G_TOUCHED2 {
            // already in 'grayagain'
            h.make_gray();
        } else {
            h.make_gray();
            self.grayagain.push(o);
        }
        if h.is_old() {
            h.set_age(G_TOUCHED1);
        }
    }

    /// Registers `o` for finalization if its new metatable has `__gc`
    /// (`luaC_checkfinalizer`).
    pub fn check_finalizer(&mut self, pool: &mut ObjectPool, o: GcId, mt: Option<TableId>) {
        let Some(mt) = mt else {
            return;
        };
        let gc_name = pool.tm_name(TmKind::Gc);
        let has_gc = pool
            .gc_pool
            .table(mt)
            .is_some_and(|t| !t.get_str(gc_name, &pool.gc_pool).is_nil());
        if !has_gc || (self.gc_stp & GCSTPCLS) != 0 {
            return;
        }
        let sweeping = self.gc_state.is_sweep_phase();
        let Some(h) = pool.gc_pool.header_mut(o.gc_ref()) else {
            return;
        };
        if h.to_finalize() {
            return;
        }
        if sweeping {
            // "sweep" the object now; the slot walk skips finalizable objects
            h.make_white(self.current_white);
            h.set_age(G_NEW);
        }
        h.set_finalized();
        self.finobj.push(o);
    }

    /// Number of objects waiting for their finalizer
    pub fn pending_finalizers(&self) -> usize {
        self.tobefnz.len()
    }

    pub(crate) fn clear_gray_lists(&mut self) {
        self.gray.clear();
        self.grayagain.clear();
        self.weak.clear();
        self.ephemeron.clear();
        self.allweak.clear();
    }

    // ============ Incremental steps ============

    /// Mark roots and reset gray lists to start a new cycle
    /// (`restartcollection`).
    pub(crate) fn restart_collection(&mut self, pool: &mut ObjectPool, roots: &mut GcRoots) {
        self.clear_gray_lists();
        self.mark_roots(pool, roots);
        self.mark_being_fnz(&mut pool.gc_pool);
    }

    /// One unit of collector work (`singlestep`). In `CallFin` this only
    /// finishes the cycle; the VM driver calls pending finalizers before
    /// reaching here.
    pub fn single_step(&mut self, pool: &mut ObjectPool, roots: &mut GcRoots) -> usize {
        debug_assert!(!self.gc_stopem);
        self.gc_stopem = true;
        let work = match self.gc_state {
            GcState::Pause => {
                self.restart_collection(pool, roots);
                self.gc_state = GcState::Propagate;
                1
            }
            GcState::Propagate => {
                if self.gray.is_empty() {
                    self.gc_state = GcState::EnterAtomic;
                    0
                } else {
                    self.propagate_mark(pool, roots)
                }
            }
            GcState::EnterAtomic | GcState::Atomic => {
                let work = self.atomic(pool, roots);
                self.enter_sweep();
                self.gc_estimate = self.total_memory() as isize;
                work
            }
            GcState::SwpAllGc => self.sweep_step(pool),
            GcState::SwpFinObj => {
                let work = self.sweep_finalizable(pool, false);
                self.gc_state = GcState::SwpToBeFnz;
                work
            }
            GcState::SwpToBeFnz => {
                let work = self.sweep_finalizable(pool, true);
                self.gc_state = GcState::SwpEnd;
                work
            }
            GcState::SwpEnd => {
                self.check_sizes(pool);
                self.gc_state = GcState::CallFin;
                0
            }
            GcState::CallFin => {
                self.gc_state = GcState::Pause;
                self.stats.major_collections += 1;
                log::trace!(
                    "gc cycle done: {} bytes in use, {} objects",
                    self.total_memory(),
                    pool.gc_pool.len()
                );
                0
            }
        };
        self.gc_stopem = false;
        work
    }

    // ============ Mode changes ============

    /// Turns every surviving object old after a full mark
    /// (`atomic2gen`). Finalizers are left to the caller.
    pub(crate) fn atomic_to_gen(&mut self, pool: &mut ObjectPool) {
        self.clear_gray_lists();
        self.gc_state = GcState::SwpAllGc;
        self.sweep_to_old(pool);
        self.old1.clear();
        self.gc_kind = GcKind::Generational;
        self.last_atomic = 0;
        self.gc_estimate = self.total_memory() as isize;
        self.finish_gen_cycle(pool);
    }

    /// Back to incremental mode: everything white, cycle restarts
    /// (`enterinc`).
    pub(crate) fn enter_inc(&mut self, pool: &mut ObjectPool) {
        self.whiten_all(pool);
        self.old1.clear();
        self.gc_state = GcState::Pause;
        self.gc_kind = GcKind::Incremental;
        self.last_atomic = 0;
    }

    /// Minor collection without its trailing finalizer calls
    /// (`youngcollection`).
    pub(crate) fn young_collection(&mut self, pool: &mut ObjectPool, roots: &mut GcRoots) {
        debug_assert_eq!(self.gc_state, GcState::Propagate);
        self.mark_old(pool);
        self.atomic(pool, roots);
        self.gc_state = GcState::SwpAllGc;
        self.sweep_gen(pool);
        self.finish_gen_cycle(pool);
        self.stats.minor_collections += 1;
    }

    fn finish_gen_cycle(&mut self, pool: &mut ObjectPool) {
        self.correct_gray_lists(pool);
        self.check_sizes(pool);
        // skip restart: generational cycles stay in propagate
        self.gc_state = GcState::Propagate;
    }

    fn check_sizes(&mut self, pool: &mut ObjectPool) {
        pool.interner.shrink();
    }
}

impl Default for GC {
    fn default() -> Self {
        Self::new()
    }
}
