// Embedding API (lapi.c)
//
// Stack-based access to the running thread in the style of the Lua C API.
// Valid indices: positive ones count from the current frame's base,
// negative ones from the top, `LUA_REGISTRYINDEX` names the registry and
// `upvalue_index(n)` the n-th upvalue of the running native closure.
// Functions that allocate run a collector checkpoint before returning.

use std::rc::Rc;

use crate::gc::{TableId, ThreadId, UserdataId};
use crate::lua_value::chunk_serializer::{dump_chunk, undump_chunk};
use crate::lua_value::lua_number::{ArithOp, F2I};
use crate::lua_value::{FunctionBody, LUA_TNONE, LuaUpvalue, LuaUserdata, LuaValue, type_name_of};
use crate::lua_vm::execute::call::code_nresults;
use crate::lua_vm::lua_limits::{LUA_MULTRET, LUA_REGISTRYINDEX, LUA_RIDX_GLOBALS};
use crate::lua_vm::{CFunction, KFunction, LuaError, LuaResult, LuaStatus, LuaVM};

/// Pseudo-index of upvalue `n` (1-based) of the running native closure
#[inline]
pub const fn upvalue_index(n: i32) -> i32 {
    LUA_REGISTRYINDEX - n
}

/// Operators of `LuaVM::compare`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Lt,
    Le,
}

impl LuaVM {
    // ===== Index translation =====

    /// Absolute stack slot of an acceptable stack index
    pub(crate) fn stack_index(&self, idx: i32) -> usize {
        if idx > 0 {
            self.state.current_ci().func + idx as usize
        } else {
            self.state.top.saturating_sub(idx.unsigned_abs() as usize)
        }
    }

    /// Value at a valid index; `nil` for an empty slot above the top
    pub(crate) fn index2value(&self, idx: i32) -> LuaValue {
        if idx > LUA_REGISTRYINDEX {
            let slot = self.stack_index(idx);
            if idx > 0 && slot >= self.state.top {
                return LuaValue::Nil;
            }
            return self.state.stack.get(slot).copied().unwrap_or_default();
        }
        if idx == LUA_REGISTRYINDEX {
            return LuaValue::Table(self.registry);
        }
        let n = (LUA_REGISTRYINDEX - idx) as usize;
        let func = self.state.stack[self.state.current_ci().func];
        match func {
            LuaValue::Function(fid) => match self.pool.gc_pool.function(fid) {
                Some(FunctionBody::C(cl)) => cl.upvalues.get(n - 1).copied().unwrap_or_default(),
                _ => LuaValue::Nil,
            },
            // light native functions have no upvalues
            _ => LuaValue::Nil,
        }
    }

    /// True when `idx` refers to an existing value (not `LUA_TNONE`)
    fn is_valid_index(&self, idx: i32) -> bool {
        if idx > 0 {
            return self.stack_index(idx) < self.state.top;
        }
        if idx > LUA_REGISTRYINDEX {
            return true;
        }
        if idx == LUA_REGISTRYINDEX {
            return true;
        }
        let n = (LUA_REGISTRYINDEX - idx) as usize;
        match self.state.stack[self.state.current_ci().func] {
            LuaValue::Function(fid) => matches!(
                self.pool.gc_pool.function(fid),
                Some(FunctionBody::C(cl)) if n <= cl.upvalues.len()
            ),
            _ => false,
        }
    }

    /// Stores `v` at a stack index or an upvalue pseudo-index
    fn set_index_value(&mut self, idx: i32, v: LuaValue) {
        if idx > LUA_REGISTRYINDEX {
            let slot = self.stack_index(idx);
            self.state.stack[slot] = v;
            return;
        }
        if idx == LUA_REGISTRYINDEX {
            return;
        }
        let n = (LUA_REGISTRYINDEX - idx) as usize;
        let LuaValue::Function(fid) = self.state.stack[self.state.current_ci().func] else {
            return;
        };
        let stored = match self.pool.gc_pool.function_mut(fid) {
            Some(FunctionBody::C(cl)) => cl.upvalues.get_mut(n - 1).map(|slot| *slot = v).is_some(),
            _ => false,
        };
        if stored {
            self.gc.barrier(&mut self.pool.gc_pool, fid.0, &v);
        }
    }

    fn table_at(&mut self, idx: i32) -> LuaResult<TableId> {
        match self.index2value(idx) {
            LuaValue::Table(t) => Ok(t),
            other => {
                let msg = format!("table expected, got {}", self.obj_type_name(&other));
                Err(self.runtime_error(msg))
            }
        }
    }

    // ===== Basic stack manipulation =====

    /// Index of the top element, i.e. the number of values in the frame
    pub fn get_top(&self) -> i32 {
        (self.state.top - (self.state.current_ci().func + 1)) as i32
    }

    /// Sets the top; new slots are nil. Lowering the top past pending
    /// to-be-closed slots of the native frame closes them.
    pub fn set_top(&mut self, idx: i32) -> LuaResult<()> {
        self.lock();
        let ci = self.state.current_ci();
        let (func, nresults) = (ci.func, ci.nresults);
        let new_top = if idx >= 0 {
            func + 1 + idx as usize
        } else {
            self.state.top.saturating_sub((-idx - 1) as usize)
        };
        while self.state.top < new_top {
            self.state.push(LuaValue::Nil);
        }
        if new_top < self.state.top && nresults < LUA_MULTRET {
            self.close_level(new_top, None, false)?;
        }
        self.state.top = new_top;
        self.unlock();
        Ok(())
    }

    /// Pops `n` values. The popped slots must not hold to-be-closed
    /// variables; use `set_top` for those.
    pub fn pop(&mut self, n: usize) {
        let base = self.state.current_ci().func + 1;
        self.state.top = self.state.top.saturating_sub(n).max(base);
    }

    /// Acceptable index turned into an absolute one
    pub fn abs_index(&self, idx: i32) -> i32 {
        if idx > 0 || idx <= LUA_REGISTRYINDEX {
            idx
        } else {
            (self.state.top - self.state.current_ci().func) as i32 + idx
        }
    }

    /// Rotates the values between `idx` and the top `n` positions towards
    /// the top (away from it when `n` is negative).
    pub fn rotate(&mut self, idx: i32, n: i32) {
        let start = self.stack_index(idx);
        let top = self.state.top;
        if start >= top {
            return;
        }
        let seg = &mut self.state.stack[start..top];
        let len = seg.len();
        if n >= 0 {
            seg.rotate_right(n as usize % len);
        } else {
            seg.rotate_left(n.unsigned_abs() as usize % len);
        }
    }

    /// Moves the top value into `idx`, shifting up the values above it
    pub fn insert(&mut self, idx: i32) {
        self.rotate(idx, 1);
    }

    /// Removes the value at `idx`, shifting down the values above it
    pub fn remove(&mut self, idx: i32) {
        self.rotate(idx, -1);
        self.pop(1);
    }

    /// Pops the top value into `idx`
    pub fn replace(&mut self, idx: i32) {
        self.copy(-1, idx);
        self.pop(1);
    }

    pub fn copy(&mut self, from: i32, to: i32) {
        let v = self.index2value(from);
        self.set_index_value(to, v);
    }

    /// Pushes a copy of the value at `idx`
    pub fn push_value(&mut self, idx: i32) {
        let v = self.index2value(idx);
        self.state.push(v);
    }

    /// Moves the top `n` values of the running thread to `to`
    pub fn xmove(&mut self, to: ThreadId, n: usize) {
        if n == 0 || to == self.state.thread_id {
            return;
        }
        let first = self.state.top.saturating_sub(n);
        let values = self.state.stack[first..self.state.top].to_vec();
        self.state.top = first;
        if let Some(target) = self.thread_state_mut(to) {
            for v in values {
                target.push(v);
            }
        }
    }

    // ===== Push =====

    pub fn push_nil(&mut self) {
        self.state.push(LuaValue::Nil);
    }

    pub fn push_boolean(&mut self, b: bool) {
        self.state.push(LuaValue::Boolean(b));
    }

    pub fn push_integer(&mut self, i: i64) {
        self.state.push(LuaValue::Integer(i));
    }

    pub fn push_number(&mut self, n: f64) {
        self.state.push(LuaValue::Float(n));
    }

    pub fn push_string(&mut self, s: &str) -> LuaResult<()> {
        self.push_bytes(s.as_bytes())
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> LuaResult<()> {
        self.lock();
        let s = self.create_string(bytes);
        self.state.push(LuaValue::String(s));
        let result = self.check_gc();
        self.unlock();
        result
    }

    pub fn push_cfunction(&mut self, f: CFunction) {
        self.state.push(LuaValue::CFunction(f));
    }

    /// Pops `n` values and pushes a native closure capturing them as its
    /// upvalues. With no upvalues a light function is pushed instead.
    pub fn push_cclosure(&mut self, f: CFunction, n: usize) -> LuaResult<()> {
        if n == 0 {
            self.push_cfunction(f);
            return Ok(());
        }
        self.lock();
        let first = self.state.top - n;
        let upvalues = self.state.stack[first..self.state.top].to_vec();
        let id = self.pool.create_c_closure(&mut self.gc, f, upvalues);
        self.state.top = first;
        self.state.push(LuaValue::Function(id));
        let result = self.check_gc();
        self.unlock();
        result
    }

    pub fn push_light_userdata(&mut self, p: usize) {
        self.state.push(LuaValue::LightUserdata(p));
    }

    /// Pushes the running thread; true if it is the main thread
    pub fn push_thread(&mut self) -> bool {
        let id = self.state.thread_id;
        self.state.push(LuaValue::Thread(id));
        id == self.main_thread
    }

    pub fn push_globals(&mut self) {
        let g = self.table_raw_get_int(self.registry, LUA_RIDX_GLOBALS);
        self.state.push(g);
    }

    // ===== Read =====

    /// Base type tag of the value at `idx`, `LUA_TNONE` for an invalid index
    pub fn type_of(&self, idx: i32) -> i32 {
        if !self.is_valid_index(idx) {
            return LUA_TNONE;
        }
        self.index2value(idx).base_type() as i32
    }

    pub fn type_name(&self, tag: i32) -> &'static str {
        type_name_of(tag)
    }

    pub fn to_boolean(&self, idx: i32) -> bool {
        !self.index2value(idx).is_falsy()
    }

    /// Integer value, converting numeric strings and integral floats
    pub fn to_integer(&self, idx: i32) -> Option<i64> {
        self.to_integer_mode(&self.index2value(idx), F2I::Eq)
    }

    pub fn to_number(&self, idx: i32) -> Option<f64> {
        self.to_float(&self.index2value(idx))
    }

    /// String value; a number in a stack slot is converted in place
    /// (`lua_tolstring`).
    pub fn to_string(&mut self, idx: i32) -> Option<String> {
        let v = self.index2value(idx);
        let v = if v.is_number() && idx > LUA_REGISTRYINDEX {
            let slot = self.stack_index(idx);
            self.to_string_in_place(slot);
            self.state.stack[slot]
        } else {
            v
        };
        if v.is_number() {
            // pseudo-index: convert without storing
            return Some(self.display_value(&v));
        }
        self.string_bytes(&v)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Raw length: bytes of a string or userdata, border of a table
    pub fn raw_len(&self, idx: i32) -> u64 {
        match self.index2value(idx) {
            LuaValue::String(s) => self.pool.str_bytes(s).len() as u64,
            LuaValue::Table(t) => self.pool.gc_pool.table(t).map_or(0, |t| t.len()),
            LuaValue::Userdata(u) => self.pool.gc_pool.userdata(u).map_or(0, |u| u.block.len() as u64),
            _ => 0,
        }
    }

    pub fn to_value(&self, idx: i32) -> LuaValue {
        self.index2value(idx)
    }

    // ===== Tables =====

    pub fn new_table(&mut self) -> LuaResult<()> {
        self.create_table(0, 0)
    }

    /// Pushes a table preallocated for `narr` array and `nrec` hash entries
    pub fn create_table(&mut self, narr: usize, nrec: usize) -> LuaResult<()> {
        self.lock();
        let t = self.pool.create_table(&mut self.gc, narr, nrec);
        self.state.push(LuaValue::Table(t));
        let result = self.check_gc();
        self.unlock();
        result
    }

    /// `t[k]` with `t` at `idx` and `k` on top; the key is replaced by the
    /// result. Returns the result's type.
    pub fn get_table(&mut self, idx: i32) -> LuaResult<i32> {
        let t = self.index2value(idx);
        let key = self.state.stack[self.state.top - 1];
        let v = self.get_index(t, key)?;
        let top = self.state.top;
        self.state.stack[top - 1] = v;
        Ok(v.base_type() as i32)
    }

    /// Pushes `t[k]` for a string key
    pub fn get_field(&mut self, idx: i32, k: &str) -> LuaResult<i32> {
        let t = self.index2value(idx);
        self.get_str_key(t, k)
    }

    pub fn get_i(&mut self, idx: i32, n: i64) -> LuaResult<i32> {
        let t = self.index2value(idx);
        let v = self.get_index(t, LuaValue::Integer(n))?;
        self.state.push(v);
        Ok(v.base_type() as i32)
    }

    pub fn get_global(&mut self, name: &str) -> LuaResult<i32> {
        let g = self.table_raw_get_int(self.registry, LUA_RIDX_GLOBALS);
        self.get_str_key(g, name)
    }

    fn get_str_key(&mut self, t: LuaValue, k: &str) -> LuaResult<i32> {
        let key = LuaValue::String(self.create_string(k.as_bytes()));
        // anchor the key while metamethods run
        self.state.push(key);
        let v = self.get_index(t, key)?;
        let top = self.state.top;
        self.state.stack[top - 1] = v;
        Ok(v.base_type() as i32)
    }

    /// `t[k] = v` with `t` at `idx`, `k` and `v` on top; pops both.
    pub fn set_table(&mut self, idx: i32) -> LuaResult<()> {
        let t = self.index2value(idx);
        let top = self.state.top;
        let (key, v) = (self.state.stack[top - 2], self.state.stack[top - 1]);
        self.set_index(t, key, v)?;
        self.state.top -= 2;
        Ok(())
    }

    /// `t[k] = v` for a string key, `v` on top; pops the value.
    pub fn set_field(&mut self, idx: i32, k: &str) -> LuaResult<()> {
        let t = self.index2value(idx);
        self.set_str_key(t, k)
    }

    pub fn set_i(&mut self, idx: i32, n: i64) -> LuaResult<()> {
        let t = self.index2value(idx);
        let v = self.state.stack[self.state.top - 1];
        self.set_index(t, LuaValue::Integer(n), v)?;
        self.state.top -= 1;
        Ok(())
    }

    pub fn set_global(&mut self, name: &str) -> LuaResult<()> {
        let g = self.table_raw_get_int(self.registry, LUA_RIDX_GLOBALS);
        self.set_str_key(g, name)
    }

    fn set_str_key(&mut self, t: LuaValue, k: &str) -> LuaResult<()> {
        let key = LuaValue::String(self.create_string(k.as_bytes()));
        let v = self.state.stack[self.state.top - 1];
        self.state.push(key);
        self.set_index(t, key, v)?;
        self.state.top -= 2;
        Ok(())
    }

    /// Raw `t[k]` with `k` on top, replaced by the result
    pub fn raw_get(&mut self, idx: i32) -> LuaResult<i32> {
        let t = self.table_at(idx)?;
        let top = self.state.top;
        let v = self.table_raw_get(t, &self.state.stack[top - 1]);
        self.state.stack[top - 1] = v;
        Ok(v.base_type() as i32)
    }

    pub fn raw_get_i(&mut self, idx: i32, n: i64) -> LuaResult<i32> {
        let t = self.table_at(idx)?;
        let v = self.table_raw_get_int(t, n);
        self.state.push(v);
        Ok(v.base_type() as i32)
    }

    /// Raw `t[k] = v` with `k` and `v` on top; pops both.
    pub fn raw_set(&mut self, idx: i32) -> LuaResult<()> {
        let t = self.table_at(idx)?;
        let top = self.state.top;
        let (key, v) = (self.state.stack[top - 2], self.state.stack[top - 1]);
        self.lock();
        let result = self.table_raw_set(t, key, v);
        self.state.top -= 2;
        self.unlock();
        result
    }

    pub fn raw_set_i(&mut self, idx: i32, n: i64) -> LuaResult<()> {
        let t = self.table_at(idx)?;
        self.lock();
        let v = self.state.pop();
        self.table_raw_set_int(t, n, v);
        self.unlock();
        Ok(())
    }

    /// Traversal step: pops a key and pushes the next key and value.
    /// Returns false, with nothing pushed, after the last entry.
    pub fn next(&mut self, idx: i32) -> LuaResult<bool> {
        let t = self.table_at(idx)?;
        let key = self.state.stack[self.state.top - 1];
        let step = match self.pool.gc_pool.table(t) {
            Some(table) => table.next(&key, &self.pool.gc_pool),
            None => Ok(None),
        };
        match step {
            Ok(Some((k, v))) => {
                let top = self.state.top;
                self.state.stack[top - 1] = k;
                self.state.push(v);
                Ok(true)
            }
            Ok(None) => {
                self.state.top -= 1;
                Ok(false)
            }
            Err(e) => Err(self.runtime_error(e.message())),
        }
    }

    /// Pushes the metatable of the value at `idx`; false (nothing pushed)
    /// when it has none.
    pub fn get_metatable(&mut self, idx: i32) -> bool {
        let v = self.index2value(idx);
        match self.metatable_of(&v) {
            Some(mt) => {
                self.state.push(LuaValue::Table(mt));
                true
            }
            None => false,
        }
    }

    /// Pops a table (or nil) and makes it the metatable of the value at `idx`
    pub fn set_metatable(&mut self, idx: i32) -> LuaResult<()> {
        let v = self.index2value(idx);
        let mt = match self.state.stack[self.state.top - 1] {
            LuaValue::Nil => None,
            LuaValue::Table(t) => Some(t),
            _ => return Err(self.runtime_error("table expected")),
        };
        self.lock();
        self.set_metatable_of(&v, mt);
        self.state.top -= 1;
        self.unlock();
        Ok(())
    }

    /// Pushes the length of the value at `idx`, honouring `__len`
    pub fn len(&mut self, idx: i32) -> LuaResult<()> {
        let v = self.index2value(idx);
        let r = self.obj_len(v)?;
        self.state.push(r);
        Ok(())
    }

    /// Concatenates the `n` values on top, leaving the result; an empty
    /// string for `n == 0`.
    pub fn concat(&mut self, n: usize) -> LuaResult<()> {
        self.lock();
        if n > 0 {
            self.concat_top(n)?;
        } else {
            let s = self.create_string(b"");
            self.state.push(LuaValue::String(s));
        }
        let result = self.check_gc();
        self.unlock();
        result
    }

    /// Compares the values at two indices, with metamethods. An invalid
    /// index compares false.
    pub fn compare(&mut self, idx1: i32, idx2: i32, op: CompareOp) -> LuaResult<bool> {
        if !self.is_valid_index(idx1) || !self.is_valid_index(idx2) {
            return Ok(false);
        }
        let (a, b) = (self.index2value(idx1), self.index2value(idx2));
        match op {
            CompareOp::Eq => self.equal_obj(a, b),
            CompareOp::Lt => self.less_than(a, b),
            CompareOp::Le => self.less_equal(a, b),
        }
    }

    pub fn raw_equal(&self, idx1: i32, idx2: i32) -> bool {
        if !self.is_valid_index(idx1) || !self.is_valid_index(idx2) {
            return false;
        }
        self.raw_equal_values(&self.index2value(idx1), &self.index2value(idx2))
    }

    /// Pops the operands (one for unary operators) and pushes `a op b`
    pub fn arith(&mut self, op: ArithOp) -> LuaResult<()> {
        if op.is_unary() {
            let v = self.state.stack[self.state.top - 1];
            self.state.push(v);
        }
        let top = self.state.top;
        let (a, b) = (self.state.stack[top - 2], self.state.stack[top - 1]);
        let r = self.arith_values(op, a, b)?;
        let top = self.state.top;
        self.state.stack[top - 2] = r;
        self.state.top = top - 1;
        Ok(())
    }

    // ===== Userdata =====

    /// Pushes a new full userdata with a zeroed block of `size` bytes and
    /// `nuvalue` user values
    pub fn new_userdata(&mut self, size: usize, nuvalue: usize) -> LuaResult<UserdataId> {
        self.push_userdata(LuaUserdata::new(size, nuvalue))
    }

    /// Pushes a full userdata carrying a typed payload
    pub fn push_userdata(&mut self, data: LuaUserdata) -> LuaResult<UserdataId> {
        self.lock();
        let id = self.pool.create_userdata(&mut self.gc, data);
        self.state.push(LuaValue::Userdata(id));
        let result = self.check_gc();
        self.unlock();
        result.map(|()| id)
    }

    /// Pushes user value `n` of the userdata at `idx`; returns `LUA_TNONE`
    /// (pushing nil) when it has no such value.
    pub fn get_iuservalue(&mut self, idx: i32, n: usize) -> i32 {
        let v = match self.index2value(idx) {
            LuaValue::Userdata(u) => self
                .pool
                .gc_pool
                .userdata(u)
                .and_then(|ud| n.checked_sub(1).and_then(|i| ud.user_values.get(i)).copied()),
            _ => None,
        };
        match v {
            Some(v) => {
                self.state.push(v);
                v.base_type() as i32
            }
            None => {
                self.state.push(LuaValue::Nil);
                LUA_TNONE
            }
        }
    }

    /// Pops a value into user value `n` of the userdata at `idx`; false if
    /// the userdata has no such value.
    pub fn set_iuservalue(&mut self, idx: i32, n: usize) -> bool {
        let target = self.index2value(idx);
        let v = self.state.pop();
        let LuaValue::Userdata(u) = target else {
            return false;
        };
        let stored = self
            .pool
            .gc_pool
            .userdata_mut(u)
            .and_then(|ud| n.checked_sub(1).and_then(|i| ud.user_values.get_mut(i)))
            .map(|slot| *slot = v)
            .is_some();
        if stored {
            self.gc.barrier(&mut self.pool.gc_pool, u.0, &v);
        }
        stored
    }

    /// Typed payload of the userdata at `idx`
    pub fn userdata_ref<T: 'static>(&self, idx: i32) -> Option<&T> {
        match self.index2value(idx) {
            LuaValue::Userdata(u) => self.pool.gc_pool.userdata(u)?.downcast_ref::<T>(),
            _ => None,
        }
    }

    // ===== Functions =====

    /// Loads a binary chunk and pushes it as a closure whose first upvalue
    /// is the globals table. On failure the error message is pushed.
    pub fn load_binary(&mut self, data: &[u8], name: &str) -> LuaStatus {
        self.lock();
        let status = match undump_chunk(data, &mut self.pool, &mut self.gc, name) {
            Ok(chunk) => {
                let chunk = Rc::new(chunk);
                let globals = self.table_raw_get_int(self.registry, LUA_RIDX_GLOBALS);
                let mut upvalues = Vec::with_capacity(chunk.upvalue_descs.len());
                for i in 0..chunk.upvalue_descs.len() {
                    let v = if i == 0 { globals } else { LuaValue::Nil };
                    upvalues.push(self.pool.create_upvalue(&mut self.gc, LuaUpvalue::Closed(v)));
                }
                let id = self.pool.create_lua_closure(&mut self.gc, chunk, upvalues);
                self.state.push(LuaValue::Function(id));
                LuaStatus::Ok
            }
            Err(msg) => {
                log::debug!("binary chunk rejected: {}", msg);
                let s = self.create_string(msg.as_bytes());
                self.state.push(LuaValue::String(s));
                LuaStatus::ErrSyntax
            }
        };
        let status = match self.check_gc() {
            Ok(()) => status,
            Err(e) => {
                let top = self.state.top;
                self.set_error_obj(e.status(), top - 1);
                e.status()
            }
        };
        self.unlock();
        status
    }

    /// Binary chunk of the Lua function at `idx`; `None` for any other value
    pub fn dump_function(&self, idx: i32, strip: bool) -> Option<Vec<u8>> {
        let LuaValue::Function(fid) = self.index2value(idx) else {
            return None;
        };
        let chunk = self.pool.gc_pool.function(fid)?.chunk()?;
        Some(dump_chunk(chunk, &self.pool, strip))
    }

    /// Calls the function below the top `nargs` arguments (`lua_call`).
    /// Results replace the function and arguments; `LUA_MULTRET` keeps
    /// them all.
    pub fn call(&mut self, nargs: usize, nresults: i32) -> LuaResult<()> {
        self.call_k(nargs, nresults, 0, None)
    }

    /// `lua_callk`: with a continuation the callee may yield; the
    /// coroutine then resumes in `k` instead of returning here.
    ///
    /// An error with no protected boundary around it runs the panic hook
    /// and leaves the error object in place of the called function.
    pub fn call_k(
        &mut self,
        nargs: usize,
        nresults: i32,
        ctx: isize,
        k: Option<KFunction>,
    ) -> LuaResult<()> {
        self.lock();
        let func = self.state.top - (nargs + 1);
        let unprotected = self.state.ci == 0 && self.resumers.is_empty();
        let (old_nny, old_n_ccalls) = (self.state.nny, self.state.n_ccalls);
        let result = match k {
            Some(k) if self.state.nny == 0 => {
                let ci = self.state.current_ci_mut();
                ci.k = Some(k);
                ci.ctx = ctx;
                self.call_value(func, nresults)
            }
            _ => self.call_noyield(func, nresults),
        };
        match result {
            Ok(()) => {
                self.adjust_results(nresults);
                self.unlock();
                Ok(())
            }
            Err(e) if unprotected && e != LuaError::Yield => {
                self.state.ci = 0;
                self.state.nny = old_nny;
                self.state.n_ccalls = old_n_ccalls;
                let status = self.close_protected(func, e.status());
                self.set_error_obj(status, func);
                self.panic(status);
                self.unlock();
                Err(status.to_error().unwrap_or(e))
            }
            Err(e) => Err(e),
        }
    }

    /// Unprotected error: hands the error object (on top) to the panic hook
    fn panic(&mut self, status: LuaStatus) {
        match self.panic_hook {
            Some(hook) => {
                if hook(self).is_err() {
                    log::warn!("panic hook failed");
                }
            }
            None => {
                let err = self.state.stack[self.state.top - 1];
                let msg = if err.is_string() || err.is_number() {
                    self.display_value(&err)
                } else {
                    format!("error object is a {} value", self.obj_type_name(&err))
                };
                log::error!("unprotected error in call to Lua API ({}) [{:?}]", msg, status);
            }
        }
    }

    /// Raises the value on top as an error (`lua_error`). The fixed memory
    /// error message raises a memory error.
    pub fn error(&mut self) -> LuaError {
        let v = match self.state.top {
            0 => LuaValue::Nil,
            top => self.state.stack[top - 1],
        };
        if let LuaValue::String(s) = v {
            if s == self.pool.mem_err_msg {
                return self.memory_error();
            }
        }
        self.throw(v)
    }

    /// Marks the slot at `idx` as a to-be-closed variable of the running
    /// native function (`lua_toclose`).
    pub fn to_close(&mut self, idx: i32) -> LuaResult<()> {
        let level = self.stack_index(idx);
        let nresults = self.state.current_ci().nresults;
        self.new_tbc_variable(level)?;
        if nresults >= LUA_MULTRET {
            self.state.current_ci_mut().nresults = code_nresults(nresults);
        }
        Ok(())
    }

    /// Pushes upvalue `n` of the closure at `funcidx` and returns its name
    /// ("" for native closures, "(no name)" when stripped).
    pub fn get_upvalue_value(&mut self, funcidx: i32, n: usize) -> Option<String> {
        let LuaValue::Function(fid) = self.index2value(funcidx) else {
            return None;
        };
        let i = n.checked_sub(1)?;
        let (name, v) = match self.pool.gc_pool.function(fid)? {
            FunctionBody::Lua(cl) => {
                let uv = *cl.upvalues.get(i)?;
                let name = cl
                    .chunk
                    .upvalue_descs
                    .get(i)
                    .map(|d| d.name.to_string())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "(no name)".to_string());
                (name, self.upvalue_get(uv))
            }
            FunctionBody::C(cl) => (String::new(), *cl.upvalues.get(i)?),
        };
        self.state.push(v);
        Some(name)
    }

    /// Pops a value into upvalue `n` of the closure at `funcidx`; returns
    /// the upvalue's name, `None` (popping nothing) when there is no such
    /// upvalue.
    pub fn set_upvalue_value(&mut self, funcidx: i32, n: usize) -> Option<String> {
        let LuaValue::Function(fid) = self.index2value(funcidx) else {
            return None;
        };
        let i = n.checked_sub(1)?;
        let v = self.state.stack[self.state.top - 1];
        let (name, lua_uv) = match self.pool.gc_pool.function_mut(fid)? {
            FunctionBody::Lua(cl) => {
                let uv = *cl.upvalues.get(i)?;
                let name = cl
                    .chunk
                    .upvalue_descs
                    .get(i)
                    .map(|d| d.name.to_string())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "(no name)".to_string());
                (name, Some(uv))
            }
            FunctionBody::C(cl) => {
                *cl.upvalues.get_mut(i)? = v;
                (String::new(), None)
            }
        };
        match lua_uv {
            Some(uv) => self.upvalue_set(uv, v),
            None => self.gc.barrier(&mut self.pool.gc_pool, fid.0, &v),
        }
        self.state.top -= 1;
        Some(name)
    }
}
