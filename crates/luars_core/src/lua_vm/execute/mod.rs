/*----------------------------------------------------------------------
  Lua 5.4 VM Execution Engine

  One `match` over the decoded opcode, inside a labeled loop that plays
  the role of lvm.c's `startfunc`/`returning` labels:
  - A Lua-to-Lua call pushes a frame and jumps back to 'startfunc, so
    scripted recursion never grows the Rust stack
  - A return pops the frame; if the frame was entered through `call_body`
    (CIST_FRESH) the loop ends, otherwise the caller resumes

  Frame invariants:
  - Registers are stack slots `base..ci.top`; slots are addressed by index
    so stack reallocation never invalidates a live reference
  - `ci.pc` is saved after every fetch: errors, yields and hooks always
    see the instruction being executed as `pc - 1`
  - `top` is the frame top except between an instruction that leaves a
    variable number of values and the one consuming them
----------------------------------------------------------------------*/

mod arithmetic;
pub(crate) mod call;
mod closure_vararg_ops;
mod cold;
mod concat;
mod loops;
pub mod metamethod;

use crate::gc::{FunctionId, UpvalueId};
use crate::lua_value::lua_number::{ArithOp, raw_arith};
use crate::lua_value::{FunctionBody, LuaValue};
use crate::lua_vm::execute::metamethod::TmKind;
use crate::lua_vm::{HookFunction, Instruction, LuaResult, LuaVM, OpCode};

/// Operator of an arithmetic instruction with a constant operand
fn k_arith_op(op: OpCode) -> ArithOp {
    match op {
        OpCode::AddK => ArithOp::Add,
        OpCode::SubK => ArithOp::Sub,
        OpCode::MulK => ArithOp::Mul,
        OpCode::ModK => ArithOp::Mod,
        OpCode::PowK => ArithOp::Pow,
        OpCode::DivK => ArithOp::Div,
        OpCode::IDivK => ArithOp::IDiv,
        OpCode::BAndK => ArithOp::BAnd,
        OpCode::BOrK => ArithOp::BOr,
        _ => ArithOp::BXor,
    }
}

/// Operator of a register/register arithmetic instruction
fn rr_arith_op(op: OpCode) -> ArithOp {
    match op {
        OpCode::Add => ArithOp::Add,
        OpCode::Sub => ArithOp::Sub,
        OpCode::Mul => ArithOp::Mul,
        OpCode::Mod => ArithOp::Mod,
        OpCode::Pow => ArithOp::Pow,
        OpCode::Div => ArithOp::Div,
        OpCode::IDiv => ArithOp::IDiv,
        OpCode::BAnd => ArithOp::BAnd,
        OpCode::BOr => ArithOp::BOr,
        OpCode::BXor => ArithOp::BXor,
        OpCode::Shl => ArithOp::Shl,
        _ => ArithOp::Shr,
    }
}

impl LuaVM {
    /// Runs Lua frames starting with the current one until a frame marked
    /// CIST_FRESH returns (`luaV_execute`).
    pub(crate) fn execute(&mut self) -> LuaResult<()> {
        'startfunc: loop {
            let ci_idx = self.state.ci;
            let ci = &self.state.call_stack[ci_idx];
            let (func, mut pc, mut ci_top) = (ci.func, ci.pc, ci.top);
            let fid = match self.state.stack[func] {
                LuaValue::Function(fid) => fid,
                _ => return Err(self.runtime_error("attempt to execute a non-Lua function")),
            };
            let chunk = match self.pool.gc_pool.function(fid) {
                Some(FunctionBody::Lua(cl)) => cl.chunk.clone(),
                _ => return Err(self.runtime_error("attempt to execute a non-Lua function")),
            };
            let code = &chunk.code;
            let k = &chunk.constants;
            let mut base = func + 1;

            // take the jump that follows a test instruction
            macro_rules! do_next_jump {
                () => {{
                    let ni = code[pc];
                    pc = (pc as isize + ni.get_sj() as isize + 1) as usize;
                }};
            }
            macro_rules! cond_jump {
                ($instr:expr, $cond:expr) => {{
                    if $cond != $instr.get_k() {
                        pc += 1;
                    } else {
                        do_next_jump!();
                    }
                }};
            }

            loop {
                if let Some(hook) = self.due_hook() {
                    self.run_instruction_hook(hook, ci_top)?;
                }
                let Some(&instr) = code.get(pc) else {
                    return Err(self.runtime_error("program counter out of range"));
                };
                pc += 1;
                self.state.call_stack[ci_idx].pc = pc;
                let Some(op) = instr.get_opcode() else {
                    return Err(self.runtime_error("invalid opcode"));
                };
                // VARARGPREP counts the actual arguments from the top
                if op != OpCode::VarargPrep && !(op.uses_top() && instr.get_b() == 0) {
                    self.state.top = ci_top;
                }
                let ra = base + instr.get_a() as usize;
                let rb = base + instr.get_b() as usize;
                let rc = base + instr.get_c() as usize;

                match op {
                    OpCode::Move => {
                        self.state.stack[ra] = self.state.stack[rb];
                    }
                    OpCode::LoadI => {
                        self.state.stack[ra] = LuaValue::Integer(instr.get_sbx() as i64);
                    }
                    OpCode::LoadF => {
                        self.state.stack[ra] = LuaValue::Float(instr.get_sbx() as f64);
                    }
                    OpCode::LoadK => {
                        self.state.stack[ra] = k[instr.get_bx() as usize];
                    }
                    OpCode::LoadKX => {
                        let ax = code[pc].get_ax() as usize;
                        pc += 1;
                        self.state.stack[ra] = k[ax];
                    }
                    OpCode::LoadFalse => {
                        self.state.stack[ra] = LuaValue::Boolean(false);
                    }
                    OpCode::LFalseSkip => {
                        self.state.stack[ra] = LuaValue::Boolean(false);
                        pc += 1;
                    }
                    OpCode::LoadTrue => {
                        self.state.stack[ra] = LuaValue::Boolean(true);
                    }
                    OpCode::LoadNil => {
                        let b = instr.get_b() as usize;
                        for slot in &mut self.state.stack[ra..=ra + b] {
                            *slot = LuaValue::Nil;
                        }
                    }

                    // ===== Upvalues =====
                    OpCode::GetUpval => {
                        let v = self
                            .closure_upvalue(fid, instr.get_b() as usize)
                            .map_or(LuaValue::Nil, |uv| self.upvalue_get(uv));
                        self.state.stack[ra] = v;
                    }
                    OpCode::SetUpval => {
                        if let Some(uv) = self.closure_upvalue(fid, instr.get_b() as usize) {
                            let v = self.state.stack[ra];
                            self.upvalue_set(uv, v);
                        }
                    }

                    // ===== Table reads =====
                    OpCode::GetTabUp => {
                        let t = self
                            .closure_upvalue(fid, instr.get_b() as usize)
                            .map_or(LuaValue::Nil, |uv| self.upvalue_get(uv));
                        let v = self.get_index(t, k[instr.get_c() as usize])?;
                        self.state.stack[ra] = v;
                    }
                    OpCode::GetTable => {
                        let (t, key) = (self.state.stack[rb], self.state.stack[rc]);
                        let v = self.get_index(t, key)?;
                        self.state.stack[ra] = v;
                    }
                    OpCode::GetI => {
                        let t = self.state.stack[rb];
                        let v = self.get_index(t, LuaValue::Integer(instr.get_c() as i64))?;
                        self.state.stack[ra] = v;
                    }
                    OpCode::GetField => {
                        let t = self.state.stack[rb];
                        let v = self.get_index(t, k[instr.get_c() as usize])?;
                        self.state.stack[ra] = v;
                    }

                    // ===== Table writes =====
                    OpCode::SetTabUp => {
                        let t = self
                            .closure_upvalue(fid, instr.get_a() as usize)
                            .map_or(LuaValue::Nil, |uv| self.upvalue_get(uv));
                        let key = k[instr.get_b() as usize];
                        let v = self.rk_c(instr, base, k);
                        self.set_index(t, key, v)?;
                    }
                    OpCode::SetTable => {
                        let (t, key) = (self.state.stack[ra], self.state.stack[rb]);
                        let v = self.rk_c(instr, base, k);
                        self.set_index(t, key, v)?;
                    }
                    OpCode::SetI => {
                        let t = self.state.stack[ra];
                        let v = self.rk_c(instr, base, k);
                        self.set_index(t, LuaValue::Integer(instr.get_b() as i64), v)?;
                    }
                    OpCode::SetField => {
                        let t = self.state.stack[ra];
                        let v = self.rk_c(instr, base, k);
                        self.set_index(t, k[instr.get_b() as usize], v)?;
                    }
                    OpCode::NewTable => {
                        let mut b = instr.get_b() as usize;
                        if b > 0 {
                            // hash size is 2^(b - 1)
                            b = 1 << (b - 1);
                        }
                        let mut c = instr.get_c() as usize;
                        if instr.get_k() {
                            c += code[pc].get_ax() as usize * (Instruction::MAX_C as usize + 1);
                        }
                        pc += 1;
                        let t = self.pool.create_table(&mut self.gc, c, b);
                        self.state.stack[ra] = LuaValue::Table(t);
                        self.check_gc()?;
                    }
                    OpCode::Self_ => {
                        let obj = self.state.stack[rb];
                        let key = self.rk_c(instr, base, k);
                        self.state.stack[ra + 1] = obj;
                        let v = self.get_index(obj, key)?;
                        self.state.stack[ra] = v;
                    }

                    // ===== Arithmetic fast paths; a miss falls into the MMBIN* that follows =====
                    OpCode::AddI => {
                        let imm = LuaValue::Integer(instr.get_sc() as i64);
                        if let Some(v) = self.arith_fast(ArithOp::Add, self.state.stack[rb], imm)? {
                            self.state.stack[ra] = v;
                            pc += 1;
                        }
                    }
                    OpCode::AddK
                    | OpCode::SubK
                    | OpCode::MulK
                    | OpCode::ModK
                    | OpCode::PowK
                    | OpCode::DivK
                    | OpCode::IDivK
                    | OpCode::BAndK
                    | OpCode::BOrK
                    | OpCode::BXorK => {
                        let kc = k[instr.get_c() as usize];
                        if let Some(v) = self.arith_fast(k_arith_op(op), self.state.stack[rb], kc)? {
                            self.state.stack[ra] = v;
                            pc += 1;
                        }
                    }
                    OpCode::ShrI => {
                        let imm = LuaValue::Integer(instr.get_sc() as i64);
                        if let Some(v) = self.arith_fast(ArithOp::Shr, self.state.stack[rb], imm)? {
                            self.state.stack[ra] = v;
                            pc += 1;
                        }
                    }
                    OpCode::ShlI => {
                        let imm = LuaValue::Integer(instr.get_sc() as i64);
                        if let Some(v) = self.arith_fast(ArithOp::Shl, imm, self.state.stack[rb])? {
                            self.state.stack[ra] = v;
                            pc += 1;
                        }
                    }
                    OpCode::Add
                    | OpCode::Sub
                    | OpCode::Mul
                    | OpCode::Mod
                    | OpCode::Pow
                    | OpCode::Div
                    | OpCode::IDiv
                    | OpCode::BAnd
                    | OpCode::BOr
                    | OpCode::BXor
                    | OpCode::Shl
                    | OpCode::Shr => {
                        let (v1, v2) = (self.state.stack[rb], self.state.stack[rc]);
                        if let Some(v) = self.arith_fast(rr_arith_op(op), v1, v2)? {
                            self.state.stack[ra] = v;
                            pc += 1;
                        }
                    }
                    OpCode::MmBin | OpCode::MmBinI | OpCode::MmBinK => {
                        // result goes to the target of the arithmetic instruction
                        let result = base + code[pc - 2].get_a() as usize;
                        let tm = TmKind::from_u8(instr.get_c() as u8).unwrap_or(TmKind::Add);
                        let p1 = self.state.stack[ra];
                        let (p1, p2) = match op {
                            OpCode::MmBin => (p1, self.state.stack[rb]),
                            _ => {
                                let other = if op == OpCode::MmBinI {
                                    LuaValue::Integer(instr.get_sb() as i64)
                                } else {
                                    k[instr.get_b() as usize]
                                };
                                if instr.get_k() { (other, p1) } else { (p1, other) }
                            }
                        };
                        let v = self.try_bin_tm(p1, p2, tm)?;
                        self.state.stack[result] = v;
                    }

                    // ===== Unary =====
                    OpCode::Unm => {
                        let v = match self.state.stack[rb] {
                            LuaValue::Integer(i) => LuaValue::Integer(i.wrapping_neg()),
                            LuaValue::Float(f) => LuaValue::Float(-f),
                            other => self.try_bin_tm(other, other, TmKind::Unm)?,
                        };
                        self.state.stack[ra] = v;
                    }
                    OpCode::BNot => {
                        let rbv = self.state.stack[rb];
                        let v = match rbv.as_integer() {
                            Some(i) => LuaValue::Integer(!i),
                            None => self.try_bin_tm(rbv, rbv, TmKind::BNot)?,
                        };
                        self.state.stack[ra] = v;
                    }
                    OpCode::Not => {
                        self.state.stack[ra] = LuaValue::Boolean(self.state.stack[rb].is_falsy());
                    }
                    OpCode::Len => {
                        let v = self.obj_len(self.state.stack[rb])?;
                        self.state.stack[ra] = v;
                    }
                    OpCode::Concat => {
                        let n = instr.get_b() as usize;
                        self.state.top = ra + n;
                        self.concat_top(n)?;
                        self.state.top = ci_top;
                        self.check_gc()?;
                    }

                    // ===== Scopes =====
                    OpCode::Close => {
                        self.close_level(ra, None, true)?;
                    }
                    OpCode::Tbc => {
                        self.new_tbc_variable(ra)?;
                    }
                    OpCode::Jmp => {
                        pc = (pc as isize + instr.get_sj() as isize) as usize;
                    }

                    // ===== Comparisons: the next instruction is a jump =====
                    OpCode::Eq => {
                        let (a, b) = (self.state.stack[ra], self.state.stack[rb]);
                        let cond = self.equal_obj(a, b)?;
                        cond_jump!(instr, cond);
                    }
                    OpCode::Lt => {
                        let (a, b) = (self.state.stack[ra], self.state.stack[rb]);
                        let cond = self.less_than(a, b)?;
                        cond_jump!(instr, cond);
                    }
                    OpCode::Le => {
                        let (a, b) = (self.state.stack[ra], self.state.stack[rb]);
                        let cond = self.less_equal(a, b)?;
                        cond_jump!(instr, cond);
                    }
                    OpCode::EqK => {
                        let cond = self.raw_equal_values(&self.state.stack[ra], &k[instr.get_b() as usize]);
                        cond_jump!(instr, cond);
                    }
                    OpCode::EqI => {
                        let im = instr.get_sb() as i64;
                        let cond = match self.state.stack[ra] {
                            LuaValue::Integer(i) => i == im,
                            LuaValue::Float(f) => f == im as f64,
                            _ => false,
                        };
                        cond_jump!(instr, cond);
                    }
                    OpCode::LtI | OpCode::LeI | OpCode::GtI | OpCode::GeI => {
                        let cond = self.order_immediate(op, instr, self.state.stack[ra])?;
                        cond_jump!(instr, cond);
                    }
                    OpCode::Test => {
                        let cond = !self.state.stack[ra].is_falsy();
                        cond_jump!(instr, cond);
                    }
                    OpCode::TestSet => {
                        let v = self.state.stack[rb];
                        if v.is_falsy() == instr.get_k() {
                            pc += 1;
                        } else {
                            self.state.stack[ra] = v;
                            do_next_jump!();
                        }
                    }

                    // ===== Calls and returns =====
                    OpCode::Call => {
                        let b = instr.get_b() as usize;
                        let nresults = instr.get_c() as i32 - 1;
                        if b != 0 {
                            self.state.top = ra + b;
                        }
                        if self.precall(ra, nresults)? {
                            continue 'startfunc;
                        }
                    }
                    OpCode::TailCall => {
                        let mut b = instr.get_b() as usize;
                        let nparams1 = instr.get_c() as usize;
                        // distance between the virtual and the real function slot
                        let delta = if nparams1 > 0 {
                            self.state.call_stack[ci_idx].nextraargs + nparams1
                        } else {
                            0
                        };
                        if b != 0 {
                            self.state.top = ra + b;
                        } else {
                            b = self.state.top - ra;
                        }
                        if instr.get_k() {
                            self.state.close_upvalues(&mut self.pool, &mut self.gc, base);
                        }
                        if self.pretailcall(ra, b, delta)? {
                            continue 'startfunc;
                        }
                        // a native callee already ran; finish the caller
                        self.state.call_stack[ci_idx].func -= delta;
                        let n = self.state.top - ra;
                        self.poscall(n)?;
                        if self.state.call_stack[ci_idx].is_fresh() {
                            return Ok(());
                        }
                        continue 'startfunc;
                    }
                    OpCode::Return => {
                        let nparams1 = instr.get_c() as usize;
                        let n = match instr.get_b() {
                            0 => self.state.top - ra,
                            b => b as usize - 1,
                        };
                        if instr.get_k() {
                            // close upvalues and pending tbc variables first
                            self.state.call_stack[ci_idx].nres = n;
                            if self.state.top < ci_top {
                                self.state.top = ci_top;
                            }
                            self.close_level(base, None, true)?;
                        }
                        if nparams1 > 0 {
                            let ci = &mut self.state.call_stack[ci_idx];
                            ci.func -= ci.nextraargs + nparams1;
                        }
                        self.state.top = ra + n;
                        self.poscall(n)?;
                        if self.state.call_stack[ci_idx].is_fresh() {
                            return Ok(());
                        }
                        continue 'startfunc;
                    }
                    OpCode::Return0 => {
                        let nres = self.state.call_stack[ci_idx].nresults;
                        self.state.pop_frame();
                        self.state.top = base - 1;
                        for _ in 0..nres.max(0) {
                            self.state.push(LuaValue::Nil);
                        }
                        if self.state.call_stack[ci_idx].is_fresh() {
                            return Ok(());
                        }
                        continue 'startfunc;
                    }
                    OpCode::Return1 => {
                        let nres = self.state.call_stack[ci_idx].nresults;
                        self.state.pop_frame();
                        if nres == 0 {
                            self.state.top = base - 1;
                        } else {
                            self.state.stack[base - 1] = self.state.stack[ra];
                            self.state.top = base;
                            for _ in 1..nres.max(1) {
                                self.state.push(LuaValue::Nil);
                            }
                        }
                        if self.state.call_stack[ci_idx].is_fresh() {
                            return Ok(());
                        }
                        continue 'startfunc;
                    }

                    // ===== Loops =====
                    OpCode::ForLoop => {
                        if self.for_loop(ra) {
                            pc -= instr.get_bx() as usize;
                        }
                    }
                    OpCode::ForPrep => {
                        if self.for_prep(ra)? {
                            pc += instr.get_bx() as usize + 1;
                        }
                    }
                    OpCode::TForPrep => {
                        self.new_tbc_variable(ra + 3)?;
                        pc += instr.get_bx() as usize;
                    }
                    OpCode::TForCall => {
                        // iterator, state and control go above the loop variables
                        self.state.stack.copy_within(ra..ra + 3, ra + 4);
                        self.state.top = ra + 4 + 3;
                        self.call_value(ra + 4, instr.get_c() as i32)?;
                    }
                    OpCode::TForLoop => {
                        let control = self.state.stack[ra + 4];
                        if !control.is_nil() {
                            self.state.stack[ra + 2] = control;
                            pc -= instr.get_bx() as usize;
                        }
                    }

                    OpCode::SetList => {
                        let mut n = instr.get_b() as usize;
                        let mut last = instr.get_c() as usize;
                        if n == 0 {
                            n = self.state.top - ra - 1;
                        }
                        last += n;
                        if instr.get_k() {
                            last += code[pc].get_ax() as usize * (Instruction::MAX_C as usize + 1);
                            pc += 1;
                        }
                        if let LuaValue::Table(t) = self.state.stack[ra] {
                            self.table_set_list(t, ra, n, last);
                        }
                    }
                    OpCode::Closure => {
                        let proto = &chunk.child_protos[instr.get_bx() as usize];
                        self.push_closure(fid, proto, base, ra);
                        self.check_gc()?;
                    }
                    OpCode::Vararg => {
                        self.get_varargs(ra, instr.get_c() as i32 - 1)?;
                    }
                    OpCode::VarargPrep => {
                        base = self.adjust_varargs(instr.get_a() as usize, chunk.max_stack_size)?;
                        ci_top = self.state.current_ci().top;
                    }
                    OpCode::ExtraArg => {}
                }
            }
        }
    }

    /// Upvalue `idx` of the Lua closure `fid`
    #[inline]
    fn closure_upvalue(&self, fid: FunctionId, idx: usize) -> Option<UpvalueId> {
        match self.pool.gc_pool.function(fid)? {
            FunctionBody::Lua(cl) => cl.upvalues.get(idx).copied(),
            FunctionBody::C(_) => None,
        }
    }

    /// `RK(C)`: a constant when the k bit is set, a register otherwise
    #[inline]
    fn rk_c(&self, instr: Instruction, base: usize, k: &[LuaValue]) -> LuaValue {
        let c = instr.get_c() as usize;
        if instr.get_k() { k[c] } else { self.state.stack[base + c] }
    }

    /// Raw arithmetic; `Ok(None)` when the operands need a metamethod
    #[inline]
    fn arith_fast(&mut self, op: ArithOp, a: LuaValue, b: LuaValue) -> LuaResult<Option<LuaValue>> {
        match raw_arith(op, &a, &b) {
            Ok(v) => Ok(v),
            Err(e) => Err(self.runtime_error(e.message())),
        }
    }

    /// `LTI`/`LEI`/`GTI`/`GEI` against the immediate `sB`. The C operand
    /// tells whether the immediate stands for a float in metamethod calls.
    fn order_immediate(&mut self, op: OpCode, instr: Instruction, v: LuaValue) -> LuaResult<bool> {
        let im = instr.get_sb() as i64;
        let fim = im as f64;
        let num = match v {
            LuaValue::Integer(i) => Some(match op {
                OpCode::LtI => i < im,
                OpCode::LeI => i <= im,
                OpCode::GtI => i > im,
                _ => i >= im,
            }),
            LuaValue::Float(f) => Some(match op {
                OpCode::LtI => f < fim,
                OpCode::LeI => f <= fim,
                OpCode::GtI => f > fim,
                _ => f >= fim,
            }),
            _ => None,
        };
        if let Some(cond) = num {
            return Ok(cond);
        }
        let imv = if instr.get_c() != 0 {
            LuaValue::Float(fim)
        } else {
            LuaValue::Integer(im)
        };
        match op {
            OpCode::LtI => self.call_order_tm(v, imv, TmKind::Lt),
            OpCode::LeI => self.call_order_tm(v, imv, TmKind::Le),
            // a > b is b < a
            OpCode::GtI => self.call_order_tm(imv, v, TmKind::Lt),
            _ => self.call_order_tm(imv, v, TmKind::Le),
        }
    }

    /// Count hook due before the next instruction, if any
    #[inline]
    fn due_hook(&mut self) -> Option<HookFunction> {
        if !self.allow_hook {
            return None;
        }
        let hook = self.instruction_hook.as_mut()?;
        hook.remaining = hook.remaining.saturating_sub(1);
        if hook.remaining > 0 {
            return None;
        }
        hook.remaining = hook.count;
        Some(hook.func)
    }

    /// Runs the count hook with the frame registers protected. A hook may
    /// yield; the interrupted instruction then runs on resume.
    fn run_instruction_hook(&mut self, f: HookFunction, ci_top: usize) -> LuaResult<()> {
        let saved_top = self.state.top;
        if self.state.top < ci_top {
            self.state.top = ci_top;
        }
        self.allow_hook = false;
        let result = f(self);
        self.allow_hook = true;
        self.state.top = saved_top;
        result
    }
}
