// String concatenation over the top of the stack (luaV_concat)

use crate::lua_value::LuaValue;
use crate::lua_vm::execute::metamethod::TmKind;
use crate::lua_vm::{LuaResult, LuaVM};

impl LuaVM {
    /// Concatenates the `total` values on top of the stack, leaving the
    /// result in place of the first one. Runs of strings and numbers are
    /// joined in one pass; anything else goes through `__concat` pairwise
    /// from the right.
    pub(crate) fn concat_top(&mut self, total: usize) -> LuaResult<()> {
        let mut total = total;
        while total > 1 {
            let top = self.state.top;
            let mut n = 2;
            let lhs_ok = self.state.stack[top - 2].is_string() || self.state.stack[top - 2].is_number();
            if !lhs_ok || !self.to_string_in_place(top - 1) {
                self.try_concat_tm()?;
            } else if self.is_empty_string(top - 1) {
                // result is the first operand
                self.to_string_in_place(top - 2);
            } else if self.is_empty_string(top - 2) {
                self.state.stack[top - 2] = self.state.stack[top - 1];
            } else {
                // at least two non-empty strings: take as many as possible
                n = 1;
                while n < total && self.to_string_in_place(top - n - 1) {
                    n += 1;
                }
                let mut buf = Vec::new();
                for idx in top - n..top {
                    if let LuaValue::String(s) = self.state.stack[idx] {
                        buf.extend_from_slice(self.pool.str_bytes(s));
                    }
                }
                let s = self.create_string(&buf);
                self.state.stack[top - n] = LuaValue::String(s);
            }
            total -= n - 1;
            self.state.top -= n - 1;
        }
        Ok(())
    }

    fn is_empty_string(&self, idx: usize) -> bool {
        match self.state.stack[idx] {
            LuaValue::String(s) => self.pool.str_bytes(s).is_empty(),
            _ => false,
        }
    }

    /// `luaT_tryconcatTM`: the result replaces the left operand.
    fn try_concat_tm(&mut self) -> LuaResult<()> {
        let top = self.state.top;
        let p1 = self.state.stack[top - 2];
        let p2 = self.state.stack[top - 1];
        let mut tm = self.get_tm_by_obj(&p1, TmKind::Concat);
        if tm.is_nil() {
            tm = self.get_tm_by_obj(&p2, TmKind::Concat);
        }
        if tm.is_nil() {
            // blame the operand that is neither a string nor a number
            let culprit = if p1.is_string() || p1.is_number() { p2 } else { p1 };
            return Err(self.type_error(&culprit, "concatenate"));
        }
        let v = self.call_tm_res(tm, p1, p2)?;
        self.state.stack[top - 2] = v;
        Ok(())
    }
}
