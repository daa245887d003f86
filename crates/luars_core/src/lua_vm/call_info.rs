// CallInfo - Information about a single function call
// Equivalent to CallInfo structure in Lua C API (lstate.h)

use crate::lua_vm::KFunction;

/// Call status flags (equivalent to Lua's CIST_* flags)
pub mod call_status {
    /// Call is running a Lua function
    pub const CIST_LUA: u32 = 1 << 0;
    /// Call is running a native function
    pub const CIST_C: u32 = 1 << 1;
    /// Call is on a fresh `execute` invocation (returning ends the loop)
    pub const CIST_FRESH: u32 = 1 << 2;
    /// Call was tail called
    pub const CIST_TAIL: u32 = 1 << 3;
    /// Yieldable protected call (`pcall_k` with a continuation)
    pub const CIST_YPCALL: u32 = 1 << 4;
    /// Call is running a finalizer
    pub const CIST_FIN: u32 = 1 << 5;
    /// Function is closing tbc variables on return
    pub const CIST_CLSRET: u32 = 1 << 6;

    /// Error status recovered by `precover`, bits 7-9
    pub const CIST_RECST: u32 = 7;
    const RECST_MASK: u32 = 7 << CIST_RECST;

    pub fn get_recst(call_status: u32) -> u8 {
        ((call_status & RECST_MASK) >> CIST_RECST) as u8
    }

    pub fn set_recst(call_status: u32, status: u8) -> u32 {
        (call_status & !RECST_MASK) | (((status as u32) << CIST_RECST) & RECST_MASK)
    }
}

/// Information about a single function call on the call stack
/// This is similar to CallInfo in lstate.h
#[derive(Clone, Default)]
pub struct CallInfo {
    /// Stack index of the called function; arguments start right above it
    pub func: usize,

    /// Top of stack for this frame: `func + 1 + maxstacksize` for Lua
    /// functions, `top + LUA_MINSTACK` for native ones
    pub top: usize,

    /// Next instruction to execute (Lua functions only)
    pub pc: usize,

    /// Number of expected results, `LUA_MULTRET` for "all"
    pub nresults: i32,

    /// Call status flags (CIST_*)
    pub call_status: u32,

    /// Extra arguments of a vararg function, stored below `func`
    pub nextraargs: usize,

    /// Continuation of a native function that called a yieldable function
    pub k: Option<KFunction>,
    /// Context passed to `k`
    pub ctx: isize,
    /// Message handler to restore when a yieldable pcall finishes
    pub old_errfunc: usize,
    /// Stack index of the function of a yieldable pcall
    pub funcidx: usize,

    /// Number of values yielded (native functions)
    pub nyield: usize,
    /// Number of values being returned while tbc variables are closed
    pub nres: usize,
}

impl CallInfo {
    /// Create a new call frame for a Lua function
    pub fn new_lua(func: usize, top: usize, nresults: i32) -> Self {
        Self {
            func,
            top,
            nresults,
            call_status: call_status::CIST_LUA,
            ..Self::default()
        }
    }

    /// Create a new call frame for a C function
    pub fn new_c(func: usize, top: usize, nresults: i32) -> Self {
        Self {
            func,
            top,
            nresults,
            call_status: call_status::CIST_C,
            ..Self::default()
        }
    }

    /// First register (Lua) or first argument (native)
    #[inline(always)]
    pub fn base(&self) -> usize {
        self.func + 1
    }

    /// Check if this is a Lua function call
    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        self.call_status & call_status::CIST_LUA != 0
    }

    /// Check if this is a C function call
    #[inline(always)]
    pub fn is_c(&self) -> bool {
        self.call_status & call_status::CIST_C != 0
    }

    #[inline(always)]
    pub fn is_fresh(&self) -> bool {
        self.call_status & call_status::CIST_FRESH != 0
    }

    /// Check if this is a tail call
    #[inline(always)]
    pub fn is_tail(&self) -> bool {
        self.call_status & call_status::CIST_TAIL != 0
    }

    /// Mark as tail call
    #[inline(always)]
    pub fn set_tail(&mut self) {
        self.call_status |= call_status::CIST_TAIL;
    }
}
