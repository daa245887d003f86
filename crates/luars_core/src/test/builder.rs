// Hand-assembled prototypes for driving the interpreter without a compiler

use std::rc::Rc;

use smol_str::SmolStr;

use crate::lua_value::{Chunk, LuaUpvalue, UpvalueDesc};
use crate::*;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct ChunkBuilder {
    chunk: Chunk,
    line: i32,
}

impl ChunkBuilder {
    /// A main chunk: one `_ENV` upvalue, no parameters
    pub fn main(name: &str) -> Self {
        let mut b = Self::function(name, 0);
        b.upvalue("_ENV", true, 0);
        b
    }

    pub fn function(name: &str, params: usize) -> Self {
        let mut chunk = Chunk::new();
        chunk.source = Some(SmolStr::new(format!("={}", name)));
        chunk.param_count = params;
        chunk.max_stack_size = 16;
        Self { chunk, line: 1 }
    }

    pub fn params(&mut self, n: usize) -> &mut Self {
        self.chunk.param_count = n;
        self
    }

    /// Marks the function vararg and emits the `VARARGPREP` it needs
    pub fn vararg(&mut self) -> &mut Self {
        self.chunk.is_vararg = true;
        let params = self.chunk.param_count as u32;
        self.abc(OpCode::VarargPrep, params, 0, 0);
        self
    }

    pub fn line(&mut self, line: i32) -> &mut Self {
        self.line = line;
        self
    }

    pub fn pc(&self) -> usize {
        self.chunk.code.len()
    }

    pub fn emit(&mut self, i: Instruction) -> usize {
        let pc = self.pc();
        self.chunk.push_instruction(i, self.line);
        pc
    }

    pub fn abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> usize {
        self.emit(Instruction::create_abc(op, a, b, c))
    }

    pub fn abck(&mut self, op: OpCode, a: u32, b: u32, c: u32, k: bool) -> usize {
        self.emit(Instruction::create_abck(op, a, b, c, k))
    }

    pub fn abx(&mut self, op: OpCode, a: u32, bx: u32) -> usize {
        self.emit(Instruction::create_abx(op, a, bx))
    }

    pub fn asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> usize {
        self.emit(Instruction::create_asbx(op, a, sbx))
    }

    /// Unconditional jump to `target`
    pub fn jump_to(&mut self, target: usize) -> usize {
        let offset = target as i32 - (self.pc() as i32 + 1);
        self.emit(Instruction::create_sj(OpCode::Jmp, offset))
    }

    /// Emits a jump to be patched once its target is known
    pub fn jump(&mut self) -> usize {
        self.emit(Instruction::create_sj(OpCode::Jmp, 0))
    }

    pub fn patch_to_here(&mut self, jmp: usize) {
        let offset = self.pc() as i32 - (jmp as i32 + 1);
        self.chunk.code[jmp].set_sj(offset);
    }

    pub fn k(&mut self, v: LuaValue) -> u32 {
        self.chunk.constants.push(v);
        (self.chunk.constants.len() - 1) as u32
    }

    /// String constant. Nothing reaches the prototype until `push_chunk`,
    /// so the string is anchored in the registry for the life of the VM.
    pub fn k_str(&mut self, vm: &mut LuaVM, s: &str) -> u32 {
        let id = vm.create_string(s.as_bytes());
        vm.state.push(LuaValue::String(id));
        vm.reference();
        self.k(LuaValue::String(id))
    }

    pub fn upvalue(&mut self, name: &str, in_stack: bool, index: u8) -> u32 {
        self.chunk.upvalue_descs.push(UpvalueDesc {
            name: SmolStr::new(name),
            in_stack,
            index,
            kind: 0,
        });
        (self.chunk.upvalue_descs.len() - 1) as u32
    }

    pub fn child(&mut self, proto: Chunk) -> u32 {
        self.chunk.child_protos.push(Rc::new(proto));
        (self.chunk.child_protos.len() - 1) as u32
    }

    pub fn build(&mut self) -> Chunk {
        let mut chunk = std::mem::take(&mut self.chunk);
        chunk.lastlinedefined = self.line as u32;
        chunk
    }
}

/// Pushes a closure of `chunk` whose upvalues all hold the globals table
pub fn push_chunk(vm: &mut LuaVM, chunk: Chunk) {
    let env = LuaValue::Table(vm.globals().unwrap());
    let mut upvalues = Vec::new();
    for _ in &chunk.upvalue_descs {
        upvalues.push(vm.pool.create_upvalue(&mut vm.gc, LuaUpvalue::Closed(env)));
    }
    let id = vm.pool.create_lua_closure(&mut vm.gc, Rc::new(chunk), upvalues);
    vm.state.push(LuaValue::Function(id));
}

/// Runs the function on top with no arguments and returns the message of
/// the error it raises
pub fn run_error(vm: &mut LuaVM) -> String {
    let status = vm.pcall(0, 0, 0);
    assert_eq!(status, LuaStatus::ErrRun);
    let msg = vm.to_string(-1).unwrap();
    vm.pop(1);
    msg
}
