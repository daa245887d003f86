// Lua Virtual Machine
// Runtime context shared by every thread: object heap, collector, registry,
// per-type metatables, limits and embedder hooks. The running thread's
// state is checked out into `state`; threads it resumed from wait on
// `resumers`.

pub mod call_info;
mod coroutine;
pub mod execute;
mod lua_api;
pub mod lua_error;
pub mod lua_gc;
pub mod lua_limits;
mod lua_ref;
pub mod lua_state;
pub mod opcode;
mod protected;
pub mod safe_option;

pub use call_info::{CallInfo, call_status};
pub use execute::metamethod::TmKind;
pub use lua_api::{CompareOp, upvalue_index};
pub use lua_error::{LuaError, LuaResult, LuaStatus};
pub use lua_gc::GcOption;
pub use lua_ref::RefId;
pub use lua_state::LuaState;
pub use opcode::{Instruction, OpCode};
pub use safe_option::SafeOption;

use crate::gc::{GC, GcId, GcRoots, GcStats, ObjectPool, StringId, TableId, ThreadId, UpvalueId};
use crate::lua_value::lua_number::number_to_bytes;
use crate::lua_value::{LUA_NUMTYPES, LuaThread, LuaUpvalue, LuaValue};
use crate::lua_vm::lua_limits::{LUA_RIDX_GLOBALS, LUA_RIDX_MAINTHREAD};
use crate::lua_vm::lua_state::StackOverflow;

/// Native function: arguments are the frame's stack slots, results are the
/// top `n` values when it returns `Ok(n)`.
pub type CFunction = fn(&mut LuaVM) -> LuaResult<usize>;

/// Continuation of a native function interrupted by a yield
/// (`lua_KFunction`). Receives the status (`Yield`, or the error status of
/// a yieldable `pcall_k`) and the saved context.
pub type KFunction = fn(&mut LuaVM, LuaStatus, isize) -> LuaResult<usize>;

/// Count hook run between instructions. Returning an error unwinds the
/// running code like any runtime error.
pub type HookFunction = fn(&mut LuaVM) -> LuaResult<()>;

/// Receives warning pieces; `tocont` is true while more pieces follow.
pub type WarnFunction = Box<dyn FnMut(&str, bool)>;

/// Embedder lock called around API entry points (`lua_lock`/`lua_unlock`)
pub type LockFunction = Box<dyn Fn()>;

pub(crate) struct InstructionHook {
    pub func: HookFunction,
    pub count: u32,
    pub remaining: u32,
}

pub(crate) struct LockHooks {
    pub lock: LockFunction,
    pub unlock: LockFunction,
}

/// Main Lua VM state
pub struct LuaVM {
    // === Heap ===
    pub(crate) pool: ObjectPool,
    pub(crate) gc: GC,

    // === Threads ===
    /// State of the running thread
    pub(crate) state: Box<LuaState>,
    /// States of the threads waiting on a `resume`, innermost last
    pub(crate) resumers: Vec<Box<LuaState>>,
    pub(crate) main_thread: ThreadId,

    // === Global state ===
    pub(crate) registry: TableId,
    /// Metatables for non-table, non-userdata types
    pub(crate) type_metatables: [Option<TableId>; LUA_NUMTYPES],
    /// Fixed "__name" key used for type names in messages
    pub(crate) name_key: StringId,
    pub(crate) safe_option: SafeOption,

    // === Hooks ===
    pub(crate) panic_hook: Option<CFunction>,
    pub(crate) lock_hooks: Option<LockHooks>,
    pub(crate) instruction_hook: Option<InstructionHook>,
    /// Cleared while the instruction hook runs so it does not re-enter
    pub(crate) allow_hook: bool,
    pub(crate) warn_function: Option<WarnFunction>,
    /// Pieces of the warning being assembled by the default handler
    pub(crate) warn_buffer: String,
    pub(crate) warnings_on: bool,
}

impl LuaVM {
    pub fn new(option: SafeOption) -> Box<LuaVM> {
        let mut gc = GC::new();
        let seed = ahash::RandomState::new().hash_one(0x4c75_6173u64) as u32;
        let mut pool = ObjectPool::new(&mut gc, seed);
        let main_thread = pool.create_thread(&mut gc, LuaThread { state: None });
        let mut state = Box::new(LuaState::new(main_thread, option.max_stack_size));
        // the main thread can never yield
        state.nny = 1;
        let registry = pool.create_table(&mut gc, 2, 0);
        let globals = pool.create_table(&mut gc, 0, 0);
        let name_key = pool.create_str(&mut gc, "__name");
        pool.fix(name_key.into());

        let mut vm = Box::new(LuaVM {
            pool,
            gc,
            state,
            resumers: Vec::new(),
            main_thread,
            registry,
            type_metatables: [None; LUA_NUMTYPES],
            name_key,
            safe_option: option,
            panic_hook: None,
            lock_hooks: None,
            instruction_hook: None,
            allow_hook: true,
            warn_function: None,
            warn_buffer: String::new(),
            warnings_on: false,
        });
        vm.table_raw_set_int(registry, LUA_RIDX_MAINTHREAD, LuaValue::Thread(main_thread));
        vm.table_raw_set_int(registry, LUA_RIDX_GLOBALS, LuaValue::Table(globals));
        log::debug!("new VM: {} bytes after bootstrap", vm.gc.total_memory());
        vm
    }

    // ===== Accessors =====

    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    /// Thread whose code is running
    pub fn current_thread(&self) -> ThreadId {
        self.state.thread_id
    }

    pub fn registry(&self) -> TableId {
        self.registry
    }

    /// Globals table (`registry[LUA_RIDX_GLOBALS]`)
    pub fn globals(&self) -> Option<TableId> {
        self.table_raw_get_int(self.registry, LUA_RIDX_GLOBALS)
            .as_table_id()
    }

    pub fn pool(&self) -> &ObjectPool {
        &self.pool
    }

    pub fn gc_stats(&self) -> &GcStats {
        &self.gc.stats
    }

    pub fn gc_state(&self) -> &GC {
        &self.gc
    }

    pub fn safe_option(&self) -> &SafeOption {
        &self.safe_option
    }

    /// Creates (or finds the interned copy of) a string. Allocation is only
    /// accounted here; the collector runs at the next checkpoint.
    pub fn create_string(&mut self, bytes: &[u8]) -> StringId {
        self.pool.create_string(&mut self.gc, bytes)
    }

    /// Bytes of a string value
    pub fn string_bytes(&self, v: &LuaValue) -> Option<&[u8]> {
        match v {
            LuaValue::String(s) => Some(self.pool.str_bytes(*s)),
            _ => None,
        }
    }

    /// Readable form of a value for messages and logs
    pub fn display_value(&self, v: &LuaValue) -> String {
        let mut buf = Vec::new();
        if number_to_bytes(v, &mut buf) {
            return String::from_utf8_lossy(&buf).into_owned();
        }
        match v {
            LuaValue::String(s) => String::from_utf8_lossy(self.pool.str_bytes(*s)).into_owned(),
            LuaValue::Nil => "nil".to_string(),
            LuaValue::Boolean(b) => b.to_string(),
            _ => format!("{}: {:?}", self.obj_type_name(v), v),
        }
    }

    /// Runs `f` with the collector, the heap and the root set borrowed
    /// together.
    pub(crate) fn with_roots<R>(
        &mut self,
        f: impl FnOnce(&mut GC, &mut ObjectPool, &mut GcRoots) -> R,
    ) -> R {
        let mut roots = GcRoots {
            state: &mut self.state,
            resumers: &mut self.resumers,
            main_thread: self.main_thread,
            registry: LuaValue::Table(self.registry),
            type_metatables: &self.type_metatables,
        };
        f(&mut self.gc, &mut self.pool, &mut roots)
    }

    // ===== Threads =====

    /// State of `thread` wherever it lives: running, parked on a resume,
    /// or stored in its thread object.
    pub(crate) fn thread_state(&self, thread: ThreadId) -> Option<&LuaState> {
        if self.state.thread_id == thread {
            return Some(&self.state);
        }
        if let Some(s) = self.resumers.iter().find(|s| s.thread_id == thread) {
            return Some(s);
        }
        self.pool.gc_pool.thread(thread)?.state.as_deref()
    }

    pub(crate) fn thread_state_mut(&mut self, thread: ThreadId) -> Option<&mut LuaState> {
        if self.state.thread_id == thread {
            return Some(&mut self.state);
        }
        if let Some(s) = self.resumers.iter_mut().find(|s| s.thread_id == thread) {
            return Some(s);
        }
        self.pool.gc_pool.thread_mut(thread)?.state.as_deref_mut()
    }

    // ===== Errors =====

    /// Raises `msg` as a runtime error, prefixed with "chunk:line:" when a
    /// Lua function is running (`luaG_runerror`).
    pub fn runtime_error(&mut self, msg: impl Into<String>) -> LuaError {
        let mut msg = msg.into();
        if let Some(prefix) = self.where_prefix() {
            msg.insert_str(0, &prefix);
        }
        let s = self.create_string(msg.as_bytes());
        self.throw(LuaValue::String(s))
    }

    /// Position of the running Lua instruction (`luaG_addinfo`)
    fn where_prefix(&self) -> Option<String> {
        let ci = self.state.current_ci();
        if !ci.is_lua() {
            return None;
        }
        let fid = self.state.stack.get(ci.func)?.as_function_id()?;
        let chunk = self.pool.gc_pool.function(fid)?.chunk()?;
        let line = chunk.line_at(ci.pc.saturating_sub(1)).unwrap_or(-1);
        let source = match &chunk.source {
            Some(src) => chunk_id(src),
            None => "?".to_string(),
        };
        Some(format!("{}:{}: ", source, line))
    }

    /// Raises `v` as the error object (`luaG_errormsg`). With a message
    /// handler installed, it runs now, before any frame is unwound.
    pub fn throw(&mut self, v: LuaValue) -> LuaError {
        self.state.error_value = v;
        if self.state.errfunc != 0 {
            return self.call_message_handler();
        }
        LuaError::RuntimeError
    }

    /// Memory error with the pre-allocated message (`luaM_error`)
    pub(crate) fn memory_error(&mut self) -> LuaError {
        self.state.error_value = LuaValue::String(self.pool.mem_err_msg);
        LuaError::OutOfMemory
    }

    /// Error while handling an error (`LUA_ERRERR`)
    pub(crate) fn error_error(&mut self) -> LuaError {
        let s = self.create_string(b"error in error handling");
        self.state.error_value = LuaValue::String(s);
        LuaError::ErrorInErrorHandling
    }

    /// Makes room for `n` more slots (`luaD_checkstack`). A native frame
    /// also gets its top raised so the new slots count as in use.
    pub fn check_stack(&mut self, n: usize) -> LuaResult<()> {
        if !self.state.has_room(n) {
            match self.state.grow_stack(n) {
                Ok(()) => {}
                Err(StackOverflow::Overflow) => return Err(self.runtime_error("stack overflow")),
                Err(StackOverflow::InErrorSpace) => return Err(self.error_error()),
            }
        }
        let top = self.state.top;
        let ci = self.state.current_ci_mut();
        if ci.is_c() && ci.top < top + n {
            ci.top = top + n;
        }
        Ok(())
    }

    // ===== Upvalues =====

    pub(crate) fn upvalue_get(&self, uv: UpvalueId) -> LuaValue {
        match self.pool.gc_pool.upvalue(uv) {
            Some(LuaUpvalue::Closed(v)) => *v,
            Some(LuaUpvalue::Open { thread, index }) => self
                .thread_state(*thread)
                .map(|s| s.get(*index))
                .unwrap_or_default(),
            None => LuaValue::Nil,
        }
    }

    pub(crate) fn upvalue_set(&mut self, uv: UpvalueId, v: LuaValue) {
        let open = match self.pool.gc_pool.upvalue_mut(uv) {
            Some(LuaUpvalue::Closed(slot)) => {
                *slot = v;
                None
            }
            Some(LuaUpvalue::Open { thread, index }) => Some((*thread, *index)),
            None => return,
        };
        match open {
            None => self.gc.barrier(&mut self.pool.gc_pool, uv.0, &v),
            Some((thread, index)) => {
                if let Some(slot) = self
                    .thread_state_mut(thread)
                    .and_then(|s| s.stack.get_mut(index))
                {
                    *slot = v;
                }
            }
        }
    }

    // ===== Metatables =====

    /// Metatable of any value: per object for tables and full userdata,
    /// per type otherwise.
    pub(crate) fn metatable_of(&self, v: &LuaValue) -> Option<TableId> {
        match v {
            LuaValue::Table(id) => self.pool.gc_pool.table(*id)?.metatable,
            LuaValue::Userdata(id) => self.pool.gc_pool.userdata(*id)?.metatable,
            _ => self.type_metatables[v.base_type() as usize],
        }
    }

    /// Sets the metatable of any value (`lua_setmetatable`)
    pub(crate) fn set_metatable_of(&mut self, v: &LuaValue, mt: Option<TableId>) {
        let target: GcId = match v {
            LuaValue::Table(id) => {
                if let Some(t) = self.pool.gc_pool.table_mut(*id) {
                    t.metatable = mt;
                }
                (*id).into()
            }
            LuaValue::Userdata(id) => {
                if let Some(u) = self.pool.gc_pool.userdata_mut(*id) {
                    u.metatable = mt;
                }
                (*id).into()
            }
            _ => {
                self.type_metatables[v.base_type() as usize] = mt;
                return;
            }
        };
        if let Some(mt) = mt {
            self.gc
                .barrier(&mut self.pool.gc_pool, target.gc_ref(), &LuaValue::Table(mt));
            self.gc.check_finalizer(&mut self.pool, target, Some(mt));
        }
    }

    // ===== Raw table access =====

    pub(crate) fn table_raw_get(&self, t: TableId, key: &LuaValue) -> LuaValue {
        self.pool
            .gc_pool
            .table(t)
            .map(|table| table.get(key, &self.pool.gc_pool))
            .unwrap_or_default()
    }

    pub(crate) fn table_raw_get_int(&self, t: TableId, key: i64) -> LuaValue {
        self.pool
            .gc_pool
            .table(t)
            .map(|table| table.get_int(key))
            .unwrap_or_default()
    }

    /// Raw `t[key] = value` with barrier and size accounting
    pub(crate) fn table_raw_set(&mut self, t: TableId, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        let Some((table, strings)) = self.pool.gc_pool.table_split_mut(t) else {
            return Ok(());
        };
        let old = table.mem_size();
        let result = table.set(key, value, &strings);
        let new = table.mem_size();
        if let Err(e) = result {
            return Err(self.runtime_error(e.message()));
        }
        self.table_resized(t, old, new);
        self.gc.barrier_back(&mut self.pool.gc_pool, t.into(), &key);
        self.gc.barrier_back(&mut self.pool.gc_pool, t.into(), &value);
        Ok(())
    }

    pub(crate) fn table_raw_set_int(&mut self, t: TableId, key: i64, value: LuaValue) {
        let Some((table, strings)) = self.pool.gc_pool.table_split_mut(t) else {
            return;
        };
        let old = table.mem_size();
        table.set_int(key, value, &strings);
        let new = table.mem_size();
        self.table_resized(t, old, new);
        self.gc.barrier_back(&mut self.pool.gc_pool, t.into(), &value);
    }

    /// `SETLIST`: stores the `n` values above `ra` at `t[last - n + 1 ..= last]`,
    /// growing the array part first when they do not fit.
    pub(crate) fn table_set_list(&mut self, t: TableId, ra: usize, n: usize, last: usize) {
        let Some((table, strings)) = self.pool.gc_pool.table_split_mut(t) else {
            return;
        };
        let old = table.mem_size();
        if last > table.array_len() {
            let nhsize = table.hash_len();
            table.resize(last, nhsize, &strings);
        }
        let first = last - n;
        for i in 1..=n {
            table.set_int((first + i) as i64, self.state.stack[ra + i], &strings);
        }
        let new = table.mem_size();
        self.table_resized(t, old, new);
        for i in 1..=n {
            let v = self.state.stack[ra + i];
            self.gc.barrier_back(&mut self.pool.gc_pool, t.into(), &v);
        }
    }

    pub(crate) fn table_resized(&mut self, t: TableId, old: usize, new: usize) {
        if old == new {
            return;
        }
        if let Some(h) = self.pool.gc_pool.header_mut(t.0) {
            h.size = new as u32;
        }
        self.gc.track_resize(old, new);
    }

    // ===== Hooks =====

    /// Installs the function called on an unprotected error (`lua_atpanic`).
    /// Returns the previous one.
    pub fn at_panic(&mut self, f: Option<CFunction>) -> Option<CFunction> {
        std::mem::replace(&mut self.panic_hook, f)
    }

    pub fn set_lock_hooks(&mut self, lock: LockFunction, unlock: LockFunction) {
        self.lock_hooks = Some(LockHooks { lock, unlock });
    }

    #[inline]
    pub(crate) fn lock(&self) {
        if let Some(h) = &self.lock_hooks {
            (h.lock)();
        }
    }

    #[inline]
    pub(crate) fn unlock(&self) {
        if let Some(h) = &self.lock_hooks {
            (h.unlock)();
        }
    }

    /// Runs `f` every `count` instructions; `count == 0` or `None` removes
    /// the hook.
    pub fn set_instruction_hook(&mut self, count: u32, f: Option<HookFunction>) {
        self.instruction_hook = match f {
            Some(func) if count > 0 => Some(InstructionHook {
                func,
                count,
                remaining: count,
            }),
            _ => None,
        };
    }

    /// Replaces the warning handler (`lua_setwarnf`). `None` restores the
    /// default, which logs through `log::warn!` once "@on" was sent.
    pub fn set_warn_function(&mut self, f: Option<WarnFunction>) {
        self.warn_function = f;
    }

    /// Emits a warning piece (`lua_warning`)
    pub fn warning(&mut self, msg: &str, tocont: bool) {
        if let Some(f) = self.warn_function.as_mut() {
            f(msg, tocont);
            return;
        }
        if !tocont && self.warn_buffer.is_empty() && msg.starts_with('@') {
            match msg {
                "@on" => self.warnings_on = true,
                "@off" => self.warnings_on = false,
                _ => {}
            }
            return;
        }
        self.warn_buffer.push_str(msg);
        if !tocont {
            let text = std::mem::take(&mut self.warn_buffer);
            if self.warnings_on {
                log::warn!("Lua warning: {}", text);
            }
        }
    }
}

/// Printable chunk name (`luaO_chunkid`): "=name" and "@file" drop their
/// prefix, anything else reads as `[string "first line..."]`.
pub fn chunk_id(source: &str) -> String {
    const IDSIZE: usize = 60;
    const RETS: &str = "...";
    if let Some(rest) = source.strip_prefix('=') {
        return truncate_chars(rest, IDSIZE - 1).to_string();
    }
    if let Some(rest) = source.strip_prefix('@') {
        if rest.len() < IDSIZE {
            return rest.to_string();
        }
        let keep = IDSIZE - 1 - RETS.len();
        let mut start = rest.len() - keep;
        while !rest.is_char_boundary(start) {
            start += 1;
        }
        return format!("{}{}", RETS, &rest[start..]);
    }
    // room left after `[string "` + `..."]`
    let avail = IDSIZE - ("[string \"".len() + RETS.len() + "\"]".len()) - 1;
    let first_line = source.split('\n').next().unwrap_or_default();
    if first_line.len() == source.len() && source.len() < avail {
        format!("[string \"{}\"]", source)
    } else {
        format!("[string \"{}{}\"]", truncate_chars(first_line, avail), RETS)
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
