/*----------------------------------------------------------------------
  Lua 5.4 instruction layout (lopcodes.h)

  All instructions are 32 bits with the opcode in the low 7 bits.

        3 3 2 2 2 2 2 2 2 2 2 2 1 1 1 1 1 1 1 1 1 1 0 0 0 0 0 0 0 0 0 0
        1 0 9 8 7 6 5 4 3 2 1 0 9 8 7 6 5 4 3 2 1 0 9 8 7 6 5 4 3 2 1 0
  iABC          C(8)     |      B(8)     |k|     A(8)      |   Op(7)     |
  iABx                Bx(17)               |     A(8)      |   Op(7)     |
  iAsBx              sBx (signed)(17)      |     A(8)      |   Op(7)     |
  iAx                           Ax(25)                     |   Op(7)     |
  isJ                           sJ (signed)(25)            |   Op(7)     |

  A signed argument is represented in excess K: the represented value is
  the written unsigned value minus K, where K is half (rounded down) the
  maximum value for the corresponding unsigned argument.
----------------------------------------------------------------------*/

use crate::lua_vm::opcode::OpCode;

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Instruction(u32);

impl Instruction {
    #[inline(always)]
    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }

    #[inline(always)]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    // Size of each field
    pub const SIZE_OP: u32 = 7;
    pub const SIZE_A: u32 = 8;
    pub const SIZE_B: u32 = 8;
    pub const SIZE_C: u32 = 8;
    pub const SIZE_K: u32 = 1;
    pub const SIZE_BX: u32 = Self::SIZE_C + Self::SIZE_B + Self::SIZE_K; // 17
    pub const SIZE_AX: u32 = Self::SIZE_BX + Self::SIZE_A; // 25
    pub const SIZE_SJ: u32 = Self::SIZE_BX + Self::SIZE_A; // 25

    // Position of each field
    pub const POS_OP: u32 = 0;
    pub const POS_A: u32 = Self::POS_OP + Self::SIZE_OP;
    pub const POS_K: u32 = Self::POS_A + Self::SIZE_A;
    pub const POS_B: u32 = Self::POS_K + Self::SIZE_K;
    pub const POS_C: u32 = Self::POS_B + Self::SIZE_B;
    pub const POS_BX: u32 = Self::POS_K;
    pub const POS_AX: u32 = Self::POS_A;
    pub const POS_SJ: u32 = Self::POS_A;

    // Maximum values
    pub const MAX_A: u32 = (1 << Self::SIZE_A) - 1;
    pub const MAX_B: u32 = (1 << Self::SIZE_B) - 1;
    pub const MAX_C: u32 = (1 << Self::SIZE_C) - 1;
    pub const MAX_BX: u32 = (1 << Self::SIZE_BX) - 1;
    pub const MAX_AX: u32 = (1 << Self::SIZE_AX) - 1;
    pub const MAX_SJ: u32 = (1 << Self::SIZE_SJ) - 1;

    // Offsets for signed arguments
    pub const OFFSET_SC: i32 = (Self::MAX_C >> 1) as i32; // 127
    pub const OFFSET_SBX: i32 = (Self::MAX_BX >> 1) as i32;
    pub const OFFSET_SJ: i32 = (Self::MAX_SJ >> 1) as i32;

    #[inline(always)]
    const fn mask1(n: u32, p: u32) -> u32 {
        (!((!0u32) << n)) << p
    }

    #[inline(always)]
    fn get_arg(self, pos: u32, size: u32) -> u32 {
        (self.0 >> pos) & Self::mask1(size, 0)
    }

    #[inline(always)]
    fn set_arg(&mut self, v: u32, pos: u32, size: u32) {
        let mask = Self::mask1(size, pos);
        self.0 = (self.0 & !mask) | ((v << pos) & mask);
    }

    /// Raw opcode byte
    #[inline(always)]
    pub fn opcode_byte(self) -> u8 {
        self.get_arg(Self::POS_OP, Self::SIZE_OP) as u8
    }

    /// Decoded opcode; `None` for a byte outside the instruction set.
    #[inline(always)]
    pub fn get_opcode(self) -> Option<OpCode> {
        OpCode::from_u8(self.opcode_byte())
    }

    #[inline(always)]
    pub fn set_opcode(&mut self, op: OpCode) {
        self.set_arg(op as u32, Self::POS_OP, Self::SIZE_OP);
    }

    #[inline(always)]
    pub fn get_a(self) -> u32 {
        self.get_arg(Self::POS_A, Self::SIZE_A)
    }

    #[inline(always)]
    pub fn set_a(&mut self, v: u32) {
        self.set_arg(v, Self::POS_A, Self::SIZE_A);
    }

    #[inline(always)]
    pub fn get_b(self) -> u32 {
        self.get_arg(Self::POS_B, Self::SIZE_B)
    }

    #[inline(always)]
    pub fn get_sb(self) -> i32 {
        self.get_b() as i32 - Self::OFFSET_SC
    }

    #[inline(always)]
    pub fn set_b(&mut self, v: u32) {
        self.set_arg(v, Self::POS_B, Self::SIZE_B);
    }

    #[inline(always)]
    pub fn get_c(self) -> u32 {
        self.get_arg(Self::POS_C, Self::SIZE_C)
    }

    #[inline(always)]
    pub fn get_sc(self) -> i32 {
        self.get_c() as i32 - Self::OFFSET_SC
    }

    #[inline(always)]
    pub fn set_c(&mut self, v: u32) {
        self.set_arg(v, Self::POS_C, Self::SIZE_C);
    }

    #[inline(always)]
    pub fn get_k(self) -> bool {
        self.get_arg(Self::POS_K, Self::SIZE_K) != 0
    }

    #[inline(always)]
    pub fn set_k(&mut self, v: bool) {
        self.set_arg(v as u32, Self::POS_K, Self::SIZE_K);
    }

    #[inline(always)]
    pub fn get_bx(self) -> u32 {
        self.get_arg(Self::POS_BX, Self::SIZE_BX)
    }

    #[inline(always)]
    pub fn get_sbx(self) -> i32 {
        self.get_bx() as i32 - Self::OFFSET_SBX
    }

    #[inline(always)]
    pub fn set_bx(&mut self, v: u32) {
        self.set_arg(v, Self::POS_BX, Self::SIZE_BX);
    }

    #[inline(always)]
    pub fn get_ax(self) -> u32 {
        self.get_arg(Self::POS_AX, Self::SIZE_AX)
    }

    #[inline(always)]
    pub fn get_sj(self) -> i32 {
        self.get_arg(Self::POS_SJ, Self::SIZE_SJ) as i32 - Self::OFFSET_SJ
    }

    #[inline(always)]
    pub fn set_sj(&mut self, v: i32) {
        self.set_arg((v + Self::OFFSET_SJ) as u32, Self::POS_SJ, Self::SIZE_SJ);
    }

    // ============ Instruction creation ============

    pub fn create_abc(op: OpCode, a: u32, b: u32, c: u32) -> Self {
        Self::create_abck(op, a, b, c, false)
    }

    pub fn create_abck(op: OpCode, a: u32, b: u32, c: u32, k: bool) -> Self {
        Self(
            ((op as u32) << Self::POS_OP)
                | ((a & Self::MAX_A) << Self::POS_A)
                | ((k as u32) << Self::POS_K)
                | ((b & Self::MAX_B) << Self::POS_B)
                | ((c & Self::MAX_C) << Self::POS_C),
        )
    }

    pub fn create_abx(op: OpCode, a: u32, bx: u32) -> Self {
        Self(
            ((op as u32) << Self::POS_OP)
                | ((a & Self::MAX_A) << Self::POS_A)
                | ((bx & Self::MAX_BX) << Self::POS_BX),
        )
    }

    pub fn create_asbx(op: OpCode, a: u32, sbx: i32) -> Self {
        Self::create_abx(op, a, (sbx + Self::OFFSET_SBX) as u32)
    }

    pub fn create_ax(op: OpCode, ax: u32) -> Self {
        Self(((op as u32) << Self::POS_OP) | ((ax & Self::MAX_AX) << Self::POS_AX))
    }

    pub fn create_sj(op: OpCode, sj: i32) -> Self {
        Self(
            ((op as u32) << Self::POS_OP)
                | ((((sj + Self::OFFSET_SJ) as u32) & Self::MAX_SJ) << Self::POS_SJ),
        )
    }

    /// Encode a signed immediate for sB/sC fields
    #[inline(always)]
    pub fn int_to_sc(v: i32) -> u32 {
        (v + Self::OFFSET_SC) as u32
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use crate::lua_vm::opcode::OpMode;
        let Some(op) = self.get_opcode() else {
            return write!(f, "<invalid opcode {}>", self.opcode_byte());
        };
        match op.get_mode() {
            OpMode::IABC => write!(
                f,
                "{:<10} {} {} {}{}",
                op.name(),
                self.get_a(),
                self.get_b(),
                self.get_c(),
                if self.get_k() { "k" } else { "" }
            ),
            OpMode::IABx => write!(f, "{:<10} {} {}", op.name(), self.get_a(), self.get_bx()),
            OpMode::IAsBx => write!(f, "{:<10} {} {}", op.name(), self.get_a(), self.get_sbx()),
            OpMode::IAx => write!(f, "{:<10} {}", op.name(), self.get_ax()),
            OpMode::IsJ => write!(f, "{:<10} {}", op.name(), self.get_sj()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abc_fields() {
        let i = Instruction::create_abck(OpCode::Add, 1, 2, 255, true);
        assert_eq!(i.get_opcode(), Some(OpCode::Add));
        assert_eq!(i.get_a(), 1);
        assert_eq!(i.get_b(), 2);
        assert_eq!(i.get_c(), 255);
        assert!(i.get_k());
    }

    #[test]
    fn test_signed_fields() {
        let i = Instruction::create_asbx(OpCode::LoadI, 3, -5);
        assert_eq!(i.get_sbx(), -5);
        let j = Instruction::create_sj(OpCode::Jmp, -1_000_000);
        assert_eq!(j.get_sj(), -1_000_000);
        let k = Instruction::create_abc(OpCode::AddI, 0, 1, Instruction::int_to_sc(-3));
        assert_eq!(k.get_sc(), -3);
    }

    #[test]
    fn test_setters() {
        let mut i = Instruction::create_abc(OpCode::Move, 0, 0, 0);
        i.set_a(7);
        i.set_b(9);
        i.set_k(true);
        i.set_opcode(OpCode::GetTable);
        assert_eq!(i.get_opcode(), Some(OpCode::GetTable));
        assert_eq!((i.get_a(), i.get_b(), i.get_k()), (7, 9, true));
        i.set_sj(12);
        assert_eq!(i.get_sj(), 12);
    }

    #[test]
    fn test_invalid_opcode() {
        let i = Instruction::from_u32(0x7f);
        assert_eq!(i.get_opcode(), None);
    }
}
