// Closure creation, vararg frames and to-be-closed variables
// (lvm.c pushclosure, ltm.c luaT_adjustvarargs / luaT_getvarargs,
// lfunc.c luaF_newtbcupval).

use std::rc::Rc;

use crate::gc::FunctionId;
use crate::lua_value::{Chunk, FunctionBody, LuaValue};
use crate::lua_vm::execute::metamethod::TmKind;
use crate::lua_vm::{LuaResult, LuaVM};

impl LuaVM {
    /// Builds a closure of `proto` inside the running function `parent`
    /// and stores it in `ra`. In-stack upvalues are shared with any other
    /// closure over the same slot.
    pub(crate) fn push_closure(&mut self, parent: FunctionId, proto: &Rc<Chunk>, base: usize, ra: usize) {
        let enclosing: &[_] = match self.pool.gc_pool.function(parent) {
            Some(FunctionBody::Lua(cl)) => &cl.upvalues,
            _ => &[],
        };
        let inherited: Vec<_> = proto
            .upvalue_descs
            .iter()
            .map(|desc| {
                if desc.in_stack {
                    None
                } else {
                    enclosing.get(desc.index as usize).copied()
                }
            })
            .collect();
        let mut upvalues = Vec::with_capacity(inherited.len());
        for (desc, inherited) in proto.upvalue_descs.iter().zip(inherited) {
            let uv = match inherited {
                Some(uv) => uv,
                None => {
                    let level = base + desc.index as usize;
                    self.state.find_upvalue(&mut self.pool, &mut self.gc, level)
                }
            };
            upvalues.push(uv);
        }
        let id = self
            .pool
            .create_lua_closure(&mut self.gc, Rc::clone(proto), upvalues);
        self.state.stack[ra] = LuaValue::Function(id);
    }

    /// `VARARGPREP`: copies the function and its fixed parameters above the
    /// actual arguments, so the extra arguments stay below the new frame
    /// base. Returns the new base.
    pub(crate) fn adjust_varargs(&mut self, nfixparams: usize, max_stack: usize) -> LuaResult<usize> {
        let func = self.state.current_ci().func;
        let actual = self.state.top - func - 1;
        let nextra = actual.saturating_sub(nfixparams);
        self.check_stack(max_stack + 1)?;
        let f = self.state.stack[func];
        self.state.push(f);
        for i in 1..=nfixparams {
            let v = self.state.stack[func + i];
            self.state.push(v);
            // the original slot is only reachable as an extra argument now
            self.state.stack[func + i] = LuaValue::Nil;
        }
        let ci = self.state.current_ci_mut();
        ci.nextraargs = nextra;
        ci.func += actual + 1;
        ci.top += actual + 1;
        Ok(ci.func + 1)
    }

    /// `VARARG`: copies `wanted` extra arguments to `ra`, or all of them
    /// when `wanted` is negative (setting the top for the next instruction).
    pub(crate) fn get_varargs(&mut self, ra: usize, wanted: i32) -> LuaResult<()> {
        let ci = self.state.current_ci();
        let (func, nextra) = (ci.func, ci.nextraargs);
        let wanted = if wanted < 0 {
            self.state.top = ra;
            self.check_stack(nextra)?;
            self.state.top = ra + nextra;
            nextra
        } else {
            wanted as usize
        };
        let n = wanted.min(nextra);
        self.state
            .stack
            .copy_within(func - nextra..func - nextra + n, ra);
        for slot in &mut self.state.stack[ra + n..ra + wanted] {
            *slot = LuaValue::Nil;
        }
        Ok(())
    }

    /// Registers stack slot `level` as a to-be-closed variable. `nil` and
    /// `false` need no closing; any other value must have `__close`.
    pub(crate) fn new_tbc_variable(&mut self, level: usize) -> LuaResult<()> {
        let v = self.state.stack[level];
        if v.is_falsy() {
            return Ok(());
        }
        if self.get_tm_by_obj(&v, TmKind::Close).is_nil() {
            let name = self.local_name_at(level).unwrap_or_else(|| "?".to_string());
            return Err(self.runtime_error(format!("variable '{}' got a non-closable value", name)));
        }
        self.state.mark_tbc(level);
        Ok(())
    }

    /// Name of the active local variable living in stack slot `level` of
    /// the running Lua function
    fn local_name_at(&self, level: usize) -> Option<String> {
        let ci = self.state.current_ci();
        if !ci.is_lua() {
            return None;
        }
        let fid = self.state.stack.get(ci.func)?.as_function_id()?;
        let chunk = self.pool.gc_pool.function(fid)?.chunk()?;
        let n = level.checked_sub(ci.func).filter(|&n| n > 0)?;
        chunk
            .local_name(n, ci.pc.saturating_sub(1))
            .map(str::to_string)
    }
}
