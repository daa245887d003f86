pub mod chunk_serializer;
pub mod lua_number;
pub mod lua_string;
pub mod lua_table;
#[allow(clippy::module_inception)]
pub mod lua_value;

use std::any::Any;
use std::rc::Rc;

use smol_str::SmolStr;

use crate::gc::{TableId, ThreadId, UpvalueId};
use crate::lua_vm::{CFunction, Instruction, LuaState};

pub use lua_number::{ArithError, ArithOp, F2I, float_to_integer, str_to_number};
pub use lua_string::LuaString;
pub use lua_table::LuaTable;
pub use lua_value::*;

/// Upvalue descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpvalueDesc {
    /// Upvalue name (debug info, empty when stripped)
    pub name: SmolStr,
    /// true: captures a register of the enclosing function,
    /// false: captures an upvalue of the enclosing function
    pub in_stack: bool,
    /// Register or upvalue index in the enclosing function
    pub index: u8,
    /// Variable kind (regular, const, to-be-closed, compile-time constant)
    pub kind: u8,
}

/// Local variable range (debug info)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocVar {
    pub name: SmolStr,
    /// First pc where the variable is active
    pub start_pc: u32,
    /// First pc where the variable is dead
    pub end_pc: u32,
}

/// Absolute line information for instruction `pc`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsLineInfo {
    pub pc: u32,
    pub line: i32,
}

/// Relative line deltas saturate at this magnitude
pub const LIMLINEDIFF: i32 = 0x80;
/// Maximum number of successive instructions without absolute line info
pub const MAXIWTHABS: usize = 128;
/// Marker in `line_info` meaning "look up `abs_line_info`"
pub const ABSLINEINFO: i8 = -0x80;

/// Compiled function prototype
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<Instruction>,
    pub constants: Vec<LuaValue>,
    pub child_protos: Vec<Rc<Chunk>>,
    pub upvalue_descs: Vec<UpvalueDesc>,
    pub param_count: usize,
    pub is_vararg: bool,
    pub max_stack_size: usize,
    pub source: Option<SmolStr>,
    pub linedefined: u32,
    pub lastlinedefined: u32,
    /// Per-instruction line deltas relative to the previous instruction
    pub line_info: Vec<i8>,
    pub abs_line_info: Vec<AbsLineInfo>,
    pub locals: Vec<LocVar>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an instruction and its source line, maintaining the Lua 5.4
    /// delta encoding (`savelineinfo`).
    pub fn push_instruction(&mut self, instr: Instruction, line: i32) {
        let pc = self.code.len();
        let previous = if pc == 0 {
            self.linedefined as i32
        } else {
            self.line_at(pc - 1).unwrap_or(self.linedefined as i32)
        };
        self.code.push(instr);
        let delta = line - previous;
        let since_abs = match self.line_info.iter().rposition(|&d| d == ABSLINEINFO) {
            Some(p) => self.line_info.len() - p,
            None => self.line_info.len(),
        };
        if delta.abs() >= LIMLINEDIFF || since_abs >= MAXIWTHABS {
            self.abs_line_info.push(AbsLineInfo {
                pc: pc as u32,
                line,
            });
            self.line_info.push(ABSLINEINFO);
        } else {
            self.line_info.push(delta as i8);
        }
    }

    /// Source line of the instruction at `pc` (`luaG_getfuncline`)
    pub fn line_at(&self, pc: usize) -> Option<i32> {
        if pc >= self.line_info.len() {
            return None;
        }
        let (start, mut line) = match self.abs_line_info.iter().rev().find(|a| (a.pc as usize) <= pc) {
            Some(a) => (a.pc as usize + 1, a.line),
            None => (0, self.linedefined as i32),
        };
        for delta in &self.line_info[start..=pc] {
            line += *delta as i32;
        }
        Some(line)
    }

    /// Name of the `n`-th active local at `pc` (1-based), used by error
    /// messages (`luaF_getlocalname`).
    pub fn local_name(&self, mut n: usize, pc: usize) -> Option<&str> {
        for local in &self.locals {
            if local.start_pc as usize > pc {
                break;
            }
            if pc < local.end_pc as usize {
                n -= 1;
                if n == 0 {
                    return Some(local.name.as_str());
                }
            }
        }
        None
    }

    /// Drops debug information recursively (what `strip` dumps omit)
    pub fn strip(&mut self) {
        self.source = None;
        self.line_info.clear();
        self.abs_line_info.clear();
        self.locals.clear();
        for up in &mut self.upvalue_descs {
            up.name = SmolStr::default();
        }
        for child in &mut self.child_protos {
            Rc::make_mut(child).strip();
        }
    }

    /// Approximate footprint for GC accounting
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<Chunk>()
            + self.code.len() * 4
            + self.constants.len() * std::mem::size_of::<LuaValue>()
            + self.line_info.len()
            + self.upvalue_descs.len() * std::mem::size_of::<UpvalueDesc>()
    }
}

/// Open upvalues alias a stack slot of some thread; closed ones own the
/// value.
#[derive(Debug, Clone, Copy)]
pub enum LuaUpvalue {
    Open { thread: ThreadId, index: usize },
    Closed(LuaValue),
}

impl LuaUpvalue {
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, LuaUpvalue::Open { .. })
    }

    /// Stack index if this upvalue is open
    #[inline]
    pub fn stack_index(&self) -> Option<usize> {
        match self {
            LuaUpvalue::Open { index, .. } => Some(*index),
            LuaUpvalue::Closed(_) => None,
        }
    }

    #[inline]
    pub fn close(&mut self, value: LuaValue) {
        *self = LuaUpvalue::Closed(value);
    }
}

/// Scripted closure
#[derive(Debug, Clone)]
pub struct LuaClosure {
    pub chunk: Rc<Chunk>,
    pub upvalues: Vec<UpvalueId>,
}

/// Native closure with private captured values
#[derive(Clone)]
pub struct CClosure {
    pub func: CFunction,
    pub upvalues: Vec<LuaValue>,
}

/// Function body - either Lua bytecode or a native function
pub enum FunctionBody {
    Lua(LuaClosure),
    C(CClosure),
}

impl FunctionBody {
    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        matches!(self, FunctionBody::Lua(_))
    }

    #[inline(always)]
    pub fn chunk(&self) -> Option<&Rc<Chunk>> {
        match self {
            FunctionBody::Lua(cl) => Some(&cl.chunk),
            FunctionBody::C(_) => None,
        }
    }

    pub fn upvalue_count(&self) -> usize {
        match self {
            FunctionBody::Lua(cl) => cl.upvalues.len(),
            FunctionBody::C(cl) => cl.upvalues.len(),
        }
    }

    pub fn mem_size(&self) -> usize {
        match self {
            FunctionBody::Lua(cl) => 32 + cl.upvalues.len() * std::mem::size_of::<UpvalueId>(),
            FunctionBody::C(cl) => 32 + cl.upvalues.len() * std::mem::size_of::<LuaValue>(),
        }
    }
}

/// Full userdata: a raw memory block, an optional typed payload, user
/// values and a metatable.
pub struct LuaUserdata {
    pub block: Box<[u8]>,
    pub payload: Option<Box<dyn Any>>,
    pub user_values: Vec<LuaValue>,
    pub metatable: Option<TableId>,
}

impl LuaUserdata {
    pub fn new(size: usize, nuvalue: usize) -> Self {
        LuaUserdata {
            block: vec![0u8; size].into_boxed_slice(),
            payload: None,
            user_values: vec![LuaValue::Nil; nuvalue],
            metatable: None,
        }
    }

    pub fn with_payload<T: Any>(value: T, nuvalue: usize) -> Self {
        LuaUserdata {
            block: Box::default(),
            payload: Some(Box::new(value)),
            user_values: vec![LuaValue::Nil; nuvalue],
            metatable: None,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref()?.downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.payload.as_mut()?.downcast_mut::<T>()
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<LuaUserdata>()
            + self.block.len()
            + self.user_values.len() * std::mem::size_of::<LuaValue>()
    }
}

/// Coroutine status as seen from Lua code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoStatus {
    /// Not started, or stopped at a yield
    Suspended,
    /// Currently executing
    Running,
    /// Active but not running (it resumed another coroutine)
    Normal,
    /// Finished or stopped with an error
    Dead,
}

impl CoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CoStatus::Suspended => "suspended",
            CoStatus::Running => "running",
            CoStatus::Normal => "normal",
            CoStatus::Dead => "dead",
        }
    }
}

/// Thread object. While the thread runs (or waits for a coroutine it
/// resumed), its state is checked out into the VM and `state` is `None`.
pub struct LuaThread {
    pub state: Option<Box<LuaState>>,
}
