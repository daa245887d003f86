mod instruction;

pub use instruction::Instruction;

/// Instruction format modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    IABC,
    IABx,
    IAsBx,
    IAx,
    IsJ,
}

/// Complete Lua 5.4 Opcode Set (83 opcodes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // Load/Move operations
    Move = 0,   // R[A] := R[B]
    LoadI,      // R[A] := sBx
    LoadF,      // R[A] := (lua_Number)sBx
    LoadK,      // R[A] := K[Bx]
    LoadKX,     // R[A] := K[extra arg]
    LoadFalse,  // R[A] := false
    LFalseSkip, // R[A] := false; pc++
    LoadTrue,   // R[A] := true
    LoadNil,    // R[A], R[A+1], ..., R[A+B] := nil

    // Upvalue operations
    GetUpval, // R[A] := UpValue[B]
    SetUpval, // UpValue[B] := R[A]

    // Table get operations
    GetTabUp, // R[A] := UpValue[B][K[C]:string]
    GetTable, // R[A] := R[B][R[C]]
    GetI,     // R[A] := R[B][C]
    GetField, // R[A] := R[B][K[C]:string]

    // Table set operations
    SetTabUp, // UpValue[A][K[B]:string] := RK(C)
    SetTable, // R[A][R[B]] := RK(C)
    SetI,     // R[A][B] := RK(C)
    SetField, // R[A][K[B]:string] := RK(C)

    NewTable, // R[A] := {}

    Self_, // R[A+1] := R[B]; R[A] := R[B][RK(C):string]

    // Arithmetic with immediate/constant
    AddI,  // R[A] := R[B] + sC
    AddK,  // R[A] := R[B] + K[C]:number
    SubK,  // R[A] := R[B] - K[C]:number
    MulK,  // R[A] := R[B] * K[C]:number
    ModK,  // R[A] := R[B] % K[C]:number
    PowK,  // R[A] := R[B] ^ K[C]:number
    DivK,  // R[A] := R[B] / K[C]:number
    IDivK, // R[A] := R[B] // K[C]:number

    // Bitwise with constant
    BAndK, // R[A] := R[B] & K[C]:integer
    BOrK,  // R[A] := R[B] | K[C]:integer
    BXorK, // R[A] := R[B] ~ K[C]:integer

    ShrI, // R[A] := R[B] >> sC
    ShlI, // R[A] := sC << R[B]

    // Arithmetic operations (register-register)
    Add,  // R[A] := R[B] + R[C]
    Sub,  // R[A] := R[B] - R[C]
    Mul,  // R[A] := R[B] * R[C]
    Mod,  // R[A] := R[B] % R[C]
    Pow,  // R[A] := R[B] ^ R[C]
    Div,  // R[A] := R[B] / R[C]
    IDiv, // R[A] := R[B] // R[C]

    // Bitwise operations (register-register)
    BAnd, // R[A] := R[B] & R[C]
    BOr,  // R[A] := R[B] | R[C]
    BXor, // R[A] := R[B] ~ R[C]
    Shl,  // R[A] := R[B] << R[C]
    Shr,  // R[A] := R[B] >> R[C]

    // Metamethod fallbacks for the preceding arithmetic instruction
    MmBin,  // call C metamethod over R[A] and R[B]
    MmBinI, // call C metamethod over R[A] and sB
    MmBinK, // call C metamethod over R[A] and K[B]

    // Unary operations
    Unm,  // R[A] := -R[B]
    BNot, // R[A] := ~R[B]
    Not,  // R[A] := not R[B]
    Len,  // R[A] := #R[B]

    Concat, // R[A] := R[A].. ... ..R[A + B - 1]

    Close, // close all upvalues >= R[A]
    Tbc,   // mark variable A "to be closed"

    Jmp, // pc += sJ

    // Comparison operations
    Eq, // if ((R[A] == R[B]) ~= k) then pc++
    Lt, // if ((R[A] <  R[B]) ~= k) then pc++
    Le, // if ((R[A] <= R[B]) ~= k) then pc++

    // Comparison with constant/immediate
    EqK, // if ((R[A] == K[B]) ~= k) then pc++
    EqI, // if ((R[A] == sB) ~= k) then pc++
    LtI, // if ((R[A] < sB) ~= k) then pc++
    LeI, // if ((R[A] <= sB) ~= k) then pc++
    GtI, // if ((R[A] > sB) ~= k) then pc++
    GeI, // if ((R[A] >= sB) ~= k) then pc++

    Test,    // if (not R[A] == k) then pc++
    TestSet, // if (not R[B] == k) then pc++ else R[A] := R[B]

    Call,     // R[A], ... ,R[A+C-2] := R[A](R[A+1], ... ,R[A+B-1])
    TailCall, // return R[A](R[A+1], ... ,R[A+B-1])

    Return,  // return R[A], ... ,R[A+B-2]
    Return0, // return
    Return1, // return R[A]

    ForLoop, // update counters; if loop continues then pc-=Bx;
    ForPrep, // <check values and prepare counters>; if not to run then pc+=Bx+1;

    TForPrep, // create upvalue for R[A + 3]; pc+=Bx
    TForCall, // R[A+4], ... ,R[A+3+C] := R[A](R[A+1], R[A+2])
    TForLoop, // if R[A+2] ~= nil then { R[A]=R[A+2]; pc -= Bx }

    SetList, // R[A][C+i] := R[A+i], 1 <= i <= B

    Closure, // R[A] := closure(KPROTO[Bx])

    Vararg,     // R[A], R[A+1], ..., R[A+C-2] = vararg
    VarargPrep, // (adjust vararg parameters)

    ExtraArg, // extra (larger) argument for previous opcode
}

pub const NUM_OPCODES: usize = OpCode::ExtraArg as usize + 1;

const OPCODES: [OpCode; NUM_OPCODES] = {
    use OpCode::*;
    [
        Move, LoadI, LoadF, LoadK, LoadKX, LoadFalse, LFalseSkip, LoadTrue, LoadNil, GetUpval,
        SetUpval, GetTabUp, GetTable, GetI, GetField, SetTabUp, SetTable, SetI, SetField, NewTable,
        Self_, AddI, AddK, SubK, MulK, ModK, PowK, DivK, IDivK, BAndK, BOrK, BXorK, ShrI, ShlI, Add,
        Sub, Mul, Mod, Pow, Div, IDiv, BAnd, BOr, BXor, Shl, Shr, MmBin, MmBinI, MmBinK, Unm, BNot,
        Not, Len, Concat, Close, Tbc, Jmp, Eq, Lt, Le, EqK, EqI, LtI, LeI, GtI, GeI, Test, TestSet,
        Call, TailCall, Return, Return0, Return1, ForLoop, ForPrep, TForPrep, TForCall, TForLoop,
        SetList, Closure, Vararg, VarargPrep, ExtraArg,
    ]
};

impl OpCode {
    /// Decode an opcode byte; `None` for bytes outside the instruction set.
    #[inline(always)]
    pub fn from_u8(byte: u8) -> Option<Self> {
        OPCODES.get(byte as usize).copied()
    }

    /// Check if this opcode uses "top" from the previous instruction
    /// (isIT in lopcodes.c). For all other instructions the frame top is
    /// the frame's fixed register limit.
    pub fn uses_top(self) -> bool {
        use OpCode::*;
        matches!(self, Call | TailCall | Return | SetList)
    }

    /// Comparison and test instructions are always followed by a jump.
    pub fn is_test(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            Eq | Lt | Le | EqK | EqI | LtI | LeI | GtI | GeI | Test | TestSet
        )
    }

    /// Instruction format mode (luaP_opmodes)
    pub fn get_mode(self) -> OpMode {
        use OpCode::*;
        match self {
            LoadI | LoadF => OpMode::IAsBx,
            LoadK | LoadKX | ForLoop | ForPrep | TForPrep | TForLoop | Closure => OpMode::IABx,
            Jmp => OpMode::IsJ,
            ExtraArg => OpMode::IAx,
            _ => OpMode::IABC,
        }
    }

    pub fn name(self) -> &'static str {
        use OpCode::*;
        match self {
            Move => "MOVE",
            LoadI => "LOADI",
            LoadF => "LOADF",
            LoadK => "LOADK",
            LoadKX => "LOADKX",
            LoadFalse => "LOADFALSE",
            LFalseSkip => "LFALSESKIP",
            LoadTrue => "LOADTRUE",
            LoadNil => "LOADNIL",
            GetUpval => "GETUPVAL",
            SetUpval => "SETUPVAL",
            GetTabUp => "GETTABUP",
            GetTable => "GETTABLE",
            GetI => "GETI",
            GetField => "GETFIELD",
            SetTabUp => "SETTABUP",
            SetTable => "SETTABLE",
            SetI => "SETI",
            SetField => "SETFIELD",
            NewTable => "NEWTABLE",
            Self_ => "SELF",
            AddI => "ADDI",
            AddK => "ADDK",
            SubK => "SUBK",
            MulK => "MULK",
            ModK => "MODK",
            PowK => "POWK",
            DivK => "DIVK",
            IDivK => "IDIVK",
            BAndK => "BANDK",
            BOrK => "BORK",
            BXorK => "BXORK",
            ShrI => "SHRI",
            ShlI => "SHLI",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Mod => "MOD",
            Pow => "POW",
            Div => "DIV",
            IDiv => "IDIV",
            BAnd => "BAND",
            BOr => "BOR",
            BXor => "BXOR",
            Shl => "SHL",
            Shr => "SHR",
            MmBin => "MMBIN",
            MmBinI => "MMBINI",
            MmBinK => "MMBINK",
            Unm => "UNM",
            BNot => "BNOT",
            Not => "NOT",
            Len => "LEN",
            Concat => "CONCAT",
            Close => "CLOSE",
            Tbc => "TBC",
            Jmp => "JMP",
            Eq => "EQ",
            Lt => "LT",
            Le => "LE",
            EqK => "EQK",
            EqI => "EQI",
            LtI => "LTI",
            LeI => "LEI",
            GtI => "GTI",
            GeI => "GEI",
            Test => "TEST",
            TestSet => "TESTSET",
            Call => "CALL",
            TailCall => "TAILCALL",
            Return => "RETURN",
            Return0 => "RETURN0",
            Return1 => "RETURN1",
            ForLoop => "FORLOOP",
            ForPrep => "FORPREP",
            TForPrep => "TFORPREP",
            TForCall => "TFORCALL",
            TForLoop => "TFORLOOP",
            SetList => "SETLIST",
            Closure => "CLOSURE",
            Vararg => "VARARG",
            VarargPrep => "VARARGPREP",
            ExtraArg => "EXTRAARG",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_table_matches_discriminants() {
        assert_eq!(NUM_OPCODES, 83);
        for (i, op) in OPCODES.iter().enumerate() {
            assert_eq!(*op as usize, i, "{}", op.name());
        }
        assert_eq!(OpCode::from_u8(83), None);
        assert_eq!(OpCode::from_u8(127), None);
    }

    #[test]
    fn test_modes() {
        assert_eq!(OpCode::Jmp.get_mode(), OpMode::IsJ);
        assert_eq!(OpCode::LoadI.get_mode(), OpMode::IAsBx);
        assert_eq!(OpCode::Closure.get_mode(), OpMode::IABx);
        assert!(OpCode::Lt.is_test());
        assert!(!OpCode::Jmp.is_test());
        assert!(OpCode::SetList.uses_top());
    }
}
