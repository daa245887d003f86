// Number coercions and the generic arithmetic entry (lvm.c luaV_tonumber_,
// luaV_tointeger, luaO_arith). The dispatch loop only uses `raw_arith`
// directly; everything here may convert strings.

use crate::lua_value::lua_number::{ArithOp, F2I, float_to_integer, number_to_bytes, raw_arith};
use crate::lua_value::{LuaValue, str_to_number};
use crate::lua_vm::execute::metamethod::TmKind;
use crate::lua_vm::{LuaResult, LuaVM};

impl LuaVM {
    /// Number value of `v`, converting numeric strings (`luaV_tonumber_`)
    pub fn coerce_number(&self, v: &LuaValue) -> Option<LuaValue> {
        match v {
            LuaValue::Integer(_) | LuaValue::Float(_) => Some(*v),
            LuaValue::String(s) => str_to_number(self.pool.str_bytes(*s)),
            _ => None,
        }
    }

    /// Float value of `v`, converting numeric strings
    pub(crate) fn to_float(&self, v: &LuaValue) -> Option<f64> {
        self.coerce_number(v)?.as_float()
    }

    /// Integer value of `v` with rounding `mode`, converting numeric strings
    /// (`luaV_tointeger`)
    pub(crate) fn to_integer_mode(&self, v: &LuaValue, mode: F2I) -> Option<i64> {
        match self.coerce_number(v)? {
            LuaValue::Integer(i) => Some(i),
            LuaValue::Float(f) => float_to_integer(f, mode),
            _ => None,
        }
    }

    /// Replaces a number in stack slot `idx` by its string form
    /// (`luaO_tostring`). Returns false if the slot holds neither a string
    /// nor a number.
    pub(crate) fn to_string_in_place(&mut self, idx: usize) -> bool {
        let v = self.state.stack[idx];
        match v {
            LuaValue::String(_) => true,
            LuaValue::Integer(_) | LuaValue::Float(_) => {
                let mut buf = Vec::with_capacity(24);
                number_to_bytes(&v, &mut buf);
                let s = self.create_string(&buf);
                self.state.stack[idx] = LuaValue::String(s);
                true
            }
            _ => false,
        }
    }

    /// `a op b` with full semantics: raw arithmetic first, then
    /// metamethods, then string coercion (`luaO_arith` + `luaT_trybinTM`).
    /// Unary operators take the operand twice.
    pub fn arith_values(&mut self, op: ArithOp, a: LuaValue, b: LuaValue) -> LuaResult<LuaValue> {
        match raw_arith(op, &a, &b) {
            Ok(Some(v)) => Ok(v),
            Ok(None) => self.try_bin_tm(a, b, TmKind::from_arith(op)),
            Err(e) => Err(self.runtime_error(e.message())),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::lua_value::LuaValue;
    use crate::lua_value::lua_number::{ArithOp, F2I};
    use crate::lua_vm::{LuaVM, SafeOption};

    #[test]
    fn test_string_coercion() {
        let mut vm = LuaVM::new(SafeOption::default());
        let s = LuaValue::String(vm.create_string(b" 0x10 "));
        assert!(matches!(vm.coerce_number(&s), Some(LuaValue::Integer(16))));
        let f = LuaValue::String(vm.create_string(b"2.5"));
        assert_eq!(vm.to_integer_mode(&f, F2I::Floor), Some(2));
        assert_eq!(vm.to_integer_mode(&f, F2I::Eq), None);
        let r = vm.arith_values(ArithOp::Add, s, LuaValue::Integer(1));
        assert!(matches!(r, Ok(LuaValue::Integer(17))));
    }

    #[test]
    fn test_arith_errors() {
        let mut vm = LuaVM::new(SafeOption::default());
        assert!(vm
            .arith_values(ArithOp::IDiv, LuaValue::Integer(1), LuaValue::Integer(0))
            .is_err());
        let msg = vm.display_value(&vm.state.error_value);
        assert_eq!(msg, "attempt to perform 'n//0'");
        assert!(vm
            .arith_values(ArithOp::BAnd, LuaValue::Float(1.5), LuaValue::Integer(1))
            .is_err());
        let msg = vm.display_value(&vm.state.error_value);
        assert_eq!(msg, "number has no integer representation");
        assert!(vm
            .arith_values(ArithOp::Add, LuaValue::Boolean(true), LuaValue::Integer(1))
            .is_err());
        let msg = vm.display_value(&vm.state.error_value);
        assert_eq!(msg, "attempt to perform arithmetic on a boolean value");
    }
}
