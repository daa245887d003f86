// Metamethod lookup and invocation (ltm.c) plus the generic index,
// comparison and length protocols of lvm.c that fall back on them.

use crate::gc::TableId;
use crate::lua_value::lua_number::{ArithOp, lt_num, le_num, raw_arith};
use crate::lua_value::LuaValue;
use crate::lua_vm::lua_limits::MAXTAGLOOP;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

/// Tag Method types (TMS from ltm.h)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TmKind {
    Index = 0,
    NewIndex = 1,
    Gc = 2,
    Mode = 3,
    Len = 4,
    Eq = 5,
    Add = 6,
    Sub = 7,
    Mul = 8,
    Mod = 9,
    Pow = 10,
    Div = 11,
    IDiv = 12,
    BAnd = 13,
    BOr = 14,
    BXor = 15,
    Shl = 16,
    Shr = 17,
    Unm = 18,
    BNot = 19,
    Lt = 20,
    Le = 21,
    Concat = 22,
    Call = 23,
    Close = 24,
    N = 25, // number of tag methods
}

/// Event names, indexed by `TmKind`
pub const TM_NAMES: [&str; TmKind::N as usize] = [
    "__index", "__newindex", "__gc", "__mode", "__len", "__eq", "__add", "__sub", "__mul",
    "__mod", "__pow", "__div", "__idiv", "__band", "__bor", "__bxor", "__shl", "__shr", "__unm",
    "__bnot", "__lt", "__le", "__concat", "__call", "__close",
];

impl TmKind {
    pub fn from_u8(v: u8) -> Option<TmKind> {
        use TmKind::*;
        const ALL: [TmKind; TmKind::N as usize] = [
            Index, NewIndex, Gc, Mode, Len, Eq, Add, Sub, Mul, Mod, Pow, Div, IDiv, BAnd, BOr,
            BXor, Shl, Shr, Unm, BNot, Lt, Le, Concat, Call, Close,
        ];
        ALL.get(v as usize).copied()
    }

    /// Event of an arithmetic operator; both enums share the Lua order.
    #[inline]
    pub fn from_arith(op: ArithOp) -> TmKind {
        TmKind::from_u8(TmKind::Add as u8 + op as u8).unwrap_or(TmKind::Add)
    }

    /// Operator of an arithmetic or bitwise event
    #[inline]
    pub fn arith_op(self) -> Option<ArithOp> {
        let v = self as u8;
        if (TmKind::Add as u8..=TmKind::BNot as u8).contains(&v) {
            ArithOp::from_u8(v - TmKind::Add as u8)
        } else {
            None
        }
    }

    /// Events whose absence is cached in the table flags
    #[inline(always)]
    pub fn is_fast(self) -> bool {
        (self as u8) <= TmKind::Eq as u8
    }
}

impl LuaVM {
    // ============ Lookup ============

    /// Metamethod `event` of metatable `mt` (`fasttm`). A miss on one of the
    /// cached events sets its absence bit in the metatable.
    pub(crate) fn fast_tm(&self, mt: Option<TableId>, event: TmKind) -> Option<LuaValue> {
        let table = self.pool.gc_pool.table(mt?)?;
        let bit = 1u8 << (event as u8);
        if event.is_fast() && table.flags.get() & bit != 0 {
            return None;
        }
        let tm = table.get_str(self.pool.tm_name(event), &self.pool.gc_pool);
        if tm.is_nil() {
            if event.is_fast() {
                table.flags.set(table.flags.get() | bit);
            }
            return None;
        }
        Some(tm)
    }

    /// Metamethod `event` of any value (`luaT_gettmbyobj`); nil when absent.
    pub(crate) fn get_tm_by_obj(&self, v: &LuaValue, event: TmKind) -> LuaValue {
        match self.metatable_of(v) {
            Some(mt) => self
                .pool
                .gc_pool
                .table(mt)
                .map(|t| t.get_str(self.pool.tm_name(event), &self.pool.gc_pool))
                .unwrap_or_default(),
            None => LuaValue::Nil,
        }
    }

    /// Type name for messages, honoring a string `__name` in the metatable
    /// of tables and full userdata (`luaT_objtypename`).
    pub fn obj_type_name(&self, v: &LuaValue) -> String {
        let mt = match v {
            LuaValue::Table(_) | LuaValue::Userdata(_) => self.metatable_of(v),
            _ => None,
        };
        if let Some(mt) = mt {
            let name = self
                .pool
                .gc_pool
                .table(mt)
                .map(|t| t.get_str(self.name_key, &self.pool.gc_pool))
                .unwrap_or_default();
            if let LuaValue::String(s) = name {
                return String::from_utf8_lossy(self.pool.str_bytes(s)).into_owned();
            }
        }
        v.type_name().to_string()
    }

    // ============ Invocation ============

    /// Calls `f(p1, p2)` for one result (`luaT_callTMres`). Calls made from
    /// Lua code may yield; finishing such an interrupted call reads the
    /// result from the top of the stack.
    pub(crate) fn call_tm_res(
        &mut self,
        f: LuaValue,
        p1: LuaValue,
        p2: LuaValue,
    ) -> LuaResult<LuaValue> {
        let func = self.state.top;
        self.state.push(f);
        self.state.push(p1);
        self.state.push(p2);
        self.call_from_meta(func, 1)?;
        Ok(self.state.pop())
    }

    /// Calls `f(p1, p2, p3)` discarding results (`luaT_callTM`)
    pub(crate) fn call_tm(
        &mut self,
        f: LuaValue,
        p1: LuaValue,
        p2: LuaValue,
        p3: LuaValue,
    ) -> LuaResult<()> {
        let func = self.state.top;
        self.state.push(f);
        self.state.push(p1);
        self.state.push(p2);
        self.state.push(p3);
        self.call_from_meta(func, 0)
    }

    fn call_from_meta(&mut self, func: usize, nresults: i32) -> LuaResult<()> {
        if self.state.current_ci().is_lua() {
            self.call_value(func, nresults)
        } else {
            self.call_noyield(func, nresults)
        }
    }

    /// Binary metamethod of either operand (`callbinTM`)
    fn bin_tm(&self, p1: &LuaValue, p2: &LuaValue, event: TmKind) -> Option<LuaValue> {
        let tm = self.get_tm_by_obj(p1, event);
        if !tm.is_nil() {
            return Some(tm);
        }
        let tm = self.get_tm_by_obj(p2, event);
        if tm.is_nil() { None } else { Some(tm) }
    }

    /// Arithmetic fallback after the fast paths failed (`luaT_trybinTM`).
    /// Without a metamethod, numeric strings are converted and the operation
    /// is retried; anything else is an error.
    pub(crate) fn try_bin_tm(
        &mut self,
        p1: LuaValue,
        p2: LuaValue,
        event: TmKind,
    ) -> LuaResult<LuaValue> {
        if let Some(tm) = self.bin_tm(&p1, &p2, event) {
            return self.call_tm_res(tm, p1, p2);
        }
        let Some(op) = event.arith_op() else {
            return Err(self.op_int_error(&p1, &p2, "perform arithmetic on"));
        };
        if let (Some(a), Some(b)) = (self.coerce_number(&p1), self.coerce_number(&p2)) {
            match raw_arith(op, &a, &b) {
                Ok(Some(v)) => return Ok(v),
                Ok(None) => {}
                Err(e) => return Err(self.runtime_error(e.message())),
            }
        }
        if op.is_bitwise() {
            if p1.is_number() && p2.is_number() {
                return Err(self.runtime_error("number has no integer representation"));
            }
            return Err(self.op_int_error(&p1, &p2, "perform bitwise operation on"));
        }
        let culprit = if self.coerce_number(&p1).is_none() { p1 } else { p2 };
        Err(self.type_error(&culprit, "perform arithmetic on"))
    }

    /// `luaG_opinterror`: blames the first operand that is not a number.
    fn op_int_error(&mut self, p1: &LuaValue, p2: &LuaValue, msg: &str) -> LuaError {
        let culprit = if p1.is_number() { *p2 } else { *p1 };
        self.type_error(&culprit, msg)
    }

    /// "attempt to <op> a <type> value"
    pub(crate) fn type_error(&mut self, v: &LuaValue, op: &str) -> LuaError {
        let msg = format!("attempt to {} a {} value", op, self.obj_type_name(v));
        self.runtime_error(msg)
    }

    /// Replaces the non-callable value at `func` by its `__call` metamethod,
    /// shifting the arguments up by one (`luaD_tryfuncTM`).
    pub(crate) fn try_func_tm(&mut self, func: usize) -> LuaResult<usize> {
        self.check_stack(1)?;
        let f = self.state.stack[func];
        let tm = self.get_tm_by_obj(&f, TmKind::Call);
        if tm.is_nil() {
            return Err(self.type_error(&f, "call"));
        }
        let top = self.state.top;
        self.state.stack.copy_within(func..top, func + 1);
        self.state.top += 1;
        self.state.stack[func] = tm;
        Ok(func)
    }

    // ============ Indexing ============

    /// `t[key]` with metamethods (`luaV_finishget` after a raw miss)
    pub(crate) fn finish_get(&mut self, t: LuaValue, key: LuaValue) -> LuaResult<LuaValue> {
        let mut t = t;
        for _ in 0..MAXTAGLOOP {
            let tm = match t {
                LuaValue::Table(id) => {
                    let mt = self.pool.gc_pool.table(id).and_then(|t| t.metatable);
                    match self.fast_tm(mt, TmKind::Index) {
                        Some(tm) => tm,
                        None => return Ok(LuaValue::Nil),
                    }
                }
                _ => {
                    let tm = self.get_tm_by_obj(&t, TmKind::Index);
                    if tm.is_nil() {
                        return Err(self.type_error(&t, "index"));
                    }
                    tm
                }
            };
            if tm.is_function() {
                return self.call_tm_res(tm, t, key);
            }
            t = tm;
            if let LuaValue::Table(id) = t {
                let v = self.table_raw_get(id, &key);
                if !v.is_nil() {
                    return Ok(v);
                }
            }
        }
        Err(self.runtime_error("'__index' chain too long; possible loop"))
    }

    /// `t[key] = val` with metamethods (`luaV_finishset` after the fast
    /// path found no existing entry)
    pub(crate) fn finish_set(&mut self, t: LuaValue, key: LuaValue, val: LuaValue) -> LuaResult<()> {
        let mut t = t;
        for _ in 0..MAXTAGLOOP {
            let tm = match t {
                LuaValue::Table(id) => {
                    let mt = self.pool.gc_pool.table(id).and_then(|t| t.metatable);
                    match self.fast_tm(mt, TmKind::NewIndex) {
                        Some(tm) => tm,
                        None => return self.table_raw_set(id, key, val),
                    }
                }
                _ => {
                    let tm = self.get_tm_by_obj(&t, TmKind::NewIndex);
                    if tm.is_nil() {
                        return Err(self.type_error(&t, "index"));
                    }
                    tm
                }
            };
            if tm.is_function() {
                return self.call_tm(tm, t, key, val);
            }
            t = tm;
            if let LuaValue::Table(id) = t {
                if !self.table_raw_get(id, &key).is_nil() {
                    return self.table_raw_set(id, key, val);
                }
            }
        }
        Err(self.runtime_error("'__newindex' chain too long; possible loop"))
    }

    /// `t[key]` (`luaV_gettable`)
    pub(crate) fn get_index(&mut self, t: LuaValue, key: LuaValue) -> LuaResult<LuaValue> {
        if let LuaValue::Table(id) = t {
            let v = self.table_raw_get(id, &key);
            if !v.is_nil() {
                return Ok(v);
            }
        }
        self.finish_get(t, key)
    }

    /// `t[key] = val` (`luaV_settable`)
    pub(crate) fn set_index(&mut self, t: LuaValue, key: LuaValue, val: LuaValue) -> LuaResult<()> {
        if let LuaValue::Table(id) = t {
            if !self.table_raw_get(id, &key).is_nil() {
                return self.table_raw_set(id, key, val);
            }
        }
        self.finish_set(t, key, val)
    }

    // ============ Comparison ============

    /// Raw equality; strings compare by content.
    pub fn raw_equal_values(&self, a: &LuaValue, b: &LuaValue) -> bool {
        match (a, b) {
            (LuaValue::String(x), LuaValue::String(y)) => {
                x == y || self.pool.str_bytes(*x) == self.pool.str_bytes(*y)
            }
            _ => a.raw_identity_eq(b),
        }
    }

    /// `a == b` with `__eq` for tables and full userdata (`luaV_equalobj`)
    pub(crate) fn equal_obj(&mut self, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
        let (mt1, mt2) = match (a, b) {
            (LuaValue::Table(x), LuaValue::Table(y)) => {
                if x == y {
                    return Ok(true);
                }
                let t = &self.pool.gc_pool;
                (
                    t.table(x).and_then(|t| t.metatable),
                    t.table(y).and_then(|t| t.metatable),
                )
            }
            (LuaValue::Userdata(x), LuaValue::Userdata(y)) => {
                if x == y {
                    return Ok(true);
                }
                let t = &self.pool.gc_pool;
                (
                    t.userdata(x).and_then(|u| u.metatable),
                    t.userdata(y).and_then(|u| u.metatable),
                )
            }
            _ => return Ok(self.raw_equal_values(&a, &b)),
        };
        let tm = self
            .fast_tm(mt1, TmKind::Eq)
            .or_else(|| self.fast_tm(mt2, TmKind::Eq));
        match tm {
            None => Ok(false),
            Some(tm) => Ok(!self.call_tm_res(tm, a, b)?.is_falsy()),
        }
    }

    fn string_pair(&self, a: &LuaValue, b: &LuaValue) -> Option<std::cmp::Ordering> {
        match (a, b) {
            (LuaValue::String(x), LuaValue::String(y)) => {
                Some(self.pool.str_bytes(*x).cmp(self.pool.str_bytes(*y)))
            }
            _ => None,
        }
    }

    /// `a < b` (`luaV_lessthan`)
    pub(crate) fn less_than(&mut self, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
        if let Some(r) = lt_num(&a, &b) {
            return Ok(r);
        }
        if let Some(ord) = self.string_pair(&a, &b) {
            return Ok(ord.is_lt());
        }
        self.call_order_tm(a, b, TmKind::Lt)
    }

    /// `a <= b` (`luaV_lessequal`)
    pub(crate) fn less_equal(&mut self, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
        if let Some(r) = le_num(&a, &b) {
            return Ok(r);
        }
        if let Some(ord) = self.string_pair(&a, &b) {
            return Ok(ord.is_le());
        }
        self.call_order_tm(a, b, TmKind::Le)
    }

    /// `luaT_callorderTM`
    pub(crate) fn call_order_tm(&mut self, p1: LuaValue, p2: LuaValue, event: TmKind) -> LuaResult<bool> {
        if let Some(tm) = self.bin_tm(&p1, &p2, event) {
            return Ok(!self.call_tm_res(tm, p1, p2)?.is_falsy());
        }
        let t1 = self.obj_type_name(&p1);
        let t2 = self.obj_type_name(&p2);
        if t1 == t2 {
            Err(self.runtime_error(format!("attempt to compare two {} values", t1)))
        } else {
            Err(self.runtime_error(format!("attempt to compare {} with {}", t1, t2)))
        }
    }

    // ============ Length ============

    /// `#v` (`luaV_objlen`)
    pub(crate) fn obj_len(&mut self, v: LuaValue) -> LuaResult<LuaValue> {
        let tm = match v {
            LuaValue::Table(id) => {
                let mt = self.pool.gc_pool.table(id).and_then(|t| t.metatable);
                match self.fast_tm(mt, TmKind::Len) {
                    Some(tm) => tm,
                    None => {
                        let n = self.pool.gc_pool.table(id).map_or(0, |t| t.len());
                        return Ok(LuaValue::Integer(n as i64));
                    }
                }
            }
            LuaValue::String(s) => {
                return Ok(LuaValue::Integer(self.pool.str_bytes(s).len() as i64));
            }
            _ => {
                let tm = self.get_tm_by_obj(&v, TmKind::Len);
                if tm.is_nil() {
                    return Err(self.type_error(&v, "get length of"));
                }
                tm
            }
        };
        self.call_tm_res(tm, v, v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_order_matches_operators() {
        assert_eq!(TM_NAMES[TmKind::Close as usize], "__close");
        assert_eq!(TM_NAMES[TmKind::BAnd as usize], "__band");
        assert_eq!(TmKind::from_arith(ArithOp::IDiv), TmKind::IDiv);
        assert_eq!(TmKind::from_arith(ArithOp::BNot), TmKind::BNot);
        assert_eq!(TmKind::Shl.arith_op(), Some(ArithOp::Shl));
        assert_eq!(TmKind::Concat.arith_op(), None);
        assert!(TmKind::Eq.is_fast() && !TmKind::Add.is_fast());
    }
}
