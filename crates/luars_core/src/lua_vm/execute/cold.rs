// Completion of an instruction interrupted by a yield inside a metamethod
// or `__close` handler (lvm.c luaV_finishOp). Runs when a coroutine is
// resumed, before the frame goes back to `execute`.

use crate::lua_value::FunctionBody;
use crate::lua_vm::{Instruction, LuaResult, LuaVM, OpCode};

impl LuaVM {
    pub(crate) fn finish_op(&mut self) -> LuaResult<()> {
        let ci = self.state.current_ci();
        let (func, pc) = (ci.func, ci.pc);
        let base = func + 1;
        let Some(fid) = self.state.stack[func].as_function_id() else {
            return Ok(());
        };
        let (inst, prev) = match self.pool.gc_pool.function(fid) {
            Some(FunctionBody::Lua(cl)) => {
                let code = &cl.chunk.code;
                let inst = code.get(pc.wrapping_sub(1)).copied();
                let prev = code.get(pc.wrapping_sub(2)).copied();
                (inst, prev)
            }
            _ => return Ok(()),
        };
        let Some(inst) = inst else {
            return Ok(());
        };
        let Some(op) = inst.get_opcode() else {
            return Ok(());
        };
        match op {
            OpCode::MmBin | OpCode::MmBinI | OpCode::MmBinK => {
                // the result goes to the arithmetic instruction's target
                let target = prev.map_or(0, Instruction::get_a) as usize;
                let v = self.state.pop();
                self.state.stack[base + target] = v;
            }
            OpCode::Unm
            | OpCode::BNot
            | OpCode::Len
            | OpCode::GetTabUp
            | OpCode::GetTable
            | OpCode::GetI
            | OpCode::GetField
            | OpCode::Self_ => {
                let v = self.state.pop();
                self.state.stack[base + inst.get_a() as usize] = v;
            }
            OpCode::Lt
            | OpCode::Le
            | OpCode::LtI
            | OpCode::LeI
            | OpCode::GtI
            | OpCode::GeI
            | OpCode::Eq => {
                let res = !self.state.pop().is_falsy();
                // the next instruction is the jump; skip it when the
                // condition failed
                if res != inst.get_k() {
                    self.state.current_ci_mut().pc += 1;
                }
            }
            OpCode::Concat => {
                // top when the metamethod was called
                let top = self.state.top - 1;
                let a = inst.get_a() as usize;
                let total = top - 1 - (base + a);
                self.state.stack[top - 2] = self.state.stack[top];
                self.state.top = top - 1;
                self.concat_top(total)?;
            }
            OpCode::Close => {
                // repeat to close the remaining variables
                self.state.current_ci_mut().pc -= 1;
            }
            OpCode::Return => {
                let ra = base + inst.get_a() as usize;
                let nres = self.state.current_ci().nres;
                self.state.top = ra + nres;
                self.state.current_ci_mut().pc -= 1;
            }
            // calls and stores leave nothing to finish
            _ => {}
        }
        Ok(())
    }
}
