// Numeric `for` loops (lvm.c forprep / forlimit / floatforloop).
//
// Register layout from `ra`: internal index, limit (an iteration count for
// integer loops), step, control variable.

use crate::lua_value::LuaValue;
use crate::lua_value::lua_number::F2I;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

impl LuaVM {
    fn for_error(&mut self, what: &str) -> LuaError {
        self.runtime_error(format!("'for' {} must be a number", what))
    }

    /// Prepares a numeric loop; `Ok(true)` means the loop runs zero times.
    pub(crate) fn for_prep(&mut self, ra: usize) -> LuaResult<bool> {
        let init = self.state.stack[ra];
        let limit = self.state.stack[ra + 1];
        let step = self.state.stack[ra + 2];
        if let (LuaValue::Integer(init), LuaValue::Integer(step)) = (init, step) {
            if step == 0 {
                return Err(self.runtime_error("'for' step is zero"));
            }
            self.state.stack[ra + 3] = LuaValue::Integer(init);
            let Some(limit) = self.for_limit(init, &limit, step)? else {
                return Ok(true);
            };
            // iteration count, computed without overflow
            let count = if step > 0 {
                let count = (limit as u64).wrapping_sub(init as u64);
                if step != 1 { count / step as u64 } else { count }
            } else {
                // `step + 1` keeps `-step` from overflowing on mininteger
                let count = (init as u64).wrapping_sub(limit as u64);
                count / ((-(step + 1)) as u64 + 1)
            };
            self.state.stack[ra + 1] = LuaValue::Integer(count as i64);
            return Ok(false);
        }
        let Some(flimit) = self.to_float(&limit) else {
            return Err(self.for_error("limit"));
        };
        let Some(fstep) = self.to_float(&step) else {
            return Err(self.for_error("step"));
        };
        let Some(finit) = self.to_float(&init) else {
            return Err(self.for_error("initial value"));
        };
        if fstep == 0.0 {
            return Err(self.runtime_error("'for' step is zero"));
        }
        let skip = if 0.0 < fstep { flimit < finit } else { finit < flimit };
        if skip {
            return Ok(true);
        }
        self.state.stack[ra] = LuaValue::Float(finit);
        self.state.stack[ra + 1] = LuaValue::Float(flimit);
        self.state.stack[ra + 2] = LuaValue::Float(fstep);
        self.state.stack[ra + 3] = LuaValue::Float(finit);
        Ok(false)
    }

    /// Integer limit of a loop starting at `init` (`forlimit`); `None` when
    /// the loop must not run. Float limits out of the integer range are
    /// clipped.
    fn for_limit(&mut self, init: i64, limit: &LuaValue, step: i64) -> LuaResult<Option<i64>> {
        let mode = if step < 0 { F2I::Ceil } else { F2I::Floor };
        let limit = match self.to_integer_mode(limit, mode) {
            Some(l) => l,
            None => {
                let Some(flimit) = self.to_float(limit) else {
                    return Err(self.for_error("limit"));
                };
                if 0.0 < flimit {
                    if step < 0 {
                        return Ok(None);
                    }
                    i64::MAX
                } else {
                    if step > 0 {
                        return Ok(None);
                    }
                    i64::MIN
                }
            }
        };
        let skip = if step > 0 { init > limit } else { init < limit };
        Ok(if skip { None } else { Some(limit) })
    }

    /// One step of a prepared loop; true when the body runs again.
    pub(crate) fn for_loop(&mut self, ra: usize) -> bool {
        let stack = &mut self.state.stack;
        match (stack[ra], stack[ra + 1], stack[ra + 2]) {
            (LuaValue::Integer(idx), LuaValue::Integer(count), LuaValue::Integer(step)) => {
                if count == 0 {
                    return false;
                }
                let idx = idx.wrapping_add(step);
                stack[ra + 1] = LuaValue::Integer((count as u64 - 1) as i64);
                stack[ra] = LuaValue::Integer(idx);
                stack[ra + 3] = LuaValue::Integer(idx);
                true
            }
            (LuaValue::Float(idx), LuaValue::Float(limit), LuaValue::Float(step)) => {
                let idx = idx + step;
                let more = if 0.0 < step { idx <= limit } else { limit <= idx };
                if more {
                    stack[ra] = LuaValue::Float(idx);
                    stack[ra + 3] = LuaValue::Float(idx);
                }
                more
            }
            _ => false,
        }
    }
}
