use crate::lua_vm::lua_limits::{LUAI_MAXCCALLS, LUAI_MAXSTACK};

/// Per-VM resource limits.
#[derive(Debug, Clone)]
pub struct SafeOption {
    /// Maximum number of value-stack slots per thread.
    pub max_stack_size: usize,
    /// Maximum nesting of native calls (Rust frames re-entering the interpreter).
    pub max_call_depth: usize,
    /// Memory ceiling in bytes; exceeding it triggers an emergency collection and then
    /// an out-of-memory error.
    pub max_memory_limit: isize,
    /// Run a collector step at every allocation checkpoint.
    pub gc_stress: bool,
}

impl Default for SafeOption {
    fn default() -> Self {
        Self {
            max_stack_size: LUAI_MAXSTACK,
            max_call_depth: LUAI_MAXCCALLS,
            max_memory_limit: isize::MAX,
            gc_stress: false,
        }
    }
}
