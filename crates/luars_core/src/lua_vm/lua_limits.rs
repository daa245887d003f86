//! Centralized VM limits and configuration constants.
//!
//! Mirrors Lua 5.4's `luaconf.h` / `llimits.h` / `lgc.h` tuning knobs.
//! All magic numbers that control VM behavior are collected here.

// ===== Stack =====

/// Extra stack slots above a frame's top for metamethod calls and temporaries.
pub const EXTRA_STACK: usize = 5;

/// Minimum guaranteed stack slots available to native functions.
pub const LUA_MINSTACK: usize = 20;

/// Initial stack size for new states.
pub const BASIC_STACK_SIZE: usize = 2 * LUA_MINSTACK;

/// Default maximum stack size (number of slots).
pub const LUAI_MAXSTACK: usize = 1_000_000;

/// Extra slots granted past the stack limit after an overflow, so error handlers can run.
pub const ERROR_STACK_EXTRA: usize = 200;

/// Maximum depth of nested native calls (and non-tail Lua calls made from Rust).
pub const LUAI_MAXCCALLS: usize = 200;

/// Option for multiple returns in `call`/`pcall`.
pub const LUA_MULTRET: i32 = -1;

// ===== Strings =====

/// Maximum length for "short" strings (interned).
pub const LUAI_MAXSHORTLEN: usize = 40;

// ===== Metamethods =====

/// Maximum depth for __index / __newindex chains.
pub const MAXTAGLOOP: usize = 2000;

// ===== Registry =====

/// Pseudo-index of the registry table.
pub const LUA_REGISTRYINDEX: i32 = -(LUAI_MAXSTACK as i32) - 1000;

/// Registry slot holding the main thread.
pub const LUA_RIDX_MAINTHREAD: i64 = 1;

/// Registry slot holding the globals table.
pub const LUA_RIDX_GLOBALS: i64 = 2;

/// Registry slot heading the free list of `reference` ids.
pub const LUA_RIDX_FREELIST: i64 = 3;

/// Reference value returned for `nil` by `reference`.
pub const LUA_REFNIL: i64 = -1;

/// Reference value that never refers to anything.
pub const LUA_NOREF: i64 = -2;

// ===== GC Defaults (lgc.h, Lua 5.4.4) =====

/// Default pause between cycles, in percent of the memory in use after a collection.
pub const LUAI_GCPAUSE: i32 = 200;

/// Default speed of the collector relative to allocation, in percent.
pub const LUAI_GCMUL: i32 = 100;

/// Default granularity of an incremental step, as log2 of bytes (8 KiB).
pub const LUAI_GCSTEPSIZE: i32 = 13;

/// Default minor-collection multiplier for generational mode, in percent.
pub const LUAI_GENMINORMUL: i32 = 20;

/// Default major-collection multiplier for generational mode, in percent.
pub const LUAI_GENMAJORMUL: i32 = 100;

/// Divisor applied to `GCestimate` before multiplying by the pause.
pub const PAUSEADJ: isize = 100;

/// Bytes of allocation that correspond to one unit of collector work.
pub const WORK2MEM: isize = 16;

/// Maximum number of arena slots visited by a single sweep step.
pub const GCSWEEPMAX: usize = 100;

/// Maximum number of finalizers called in a single step.
pub const GCFINMAX: usize = 10;

/// Cost of calling one finalizer, in work units.
pub const GCFINALIZECOST: usize = 50;

/// Debt assigned while the collector is stopped, to avoid re-checking on every allocation.
pub const GC_STOPPED_DEBT: isize = -2000;
