//! The FX VM instruction set.
//!
//! A fixed-width register machine: every instruction is 4 little-endian
//! bytes `[opcode, a, b, c]`. Register operands are 8-bit data slot
//! indices; immediates, data slot addresses, and code offsets occupy the
//! `b`/`c` pair as a little-endian 16-bit value. Register slot 0 is the
//! return value register shared by all calls.

use strum::FromRepr;

use crate::{
    error::{CompileError, Result},
    middle::ty::BinOp,
};

/// Return value register, slot 0 of the register file
pub const RV: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    /// a = b
    Mov = 1,
    /// a = sign-extended imm16
    LoadImm = 2,
    /// a = data[slot16]
    LoadMem = 3,
    Add = 4,
    Sub = 5,
    Mul = 6,
    Div = 7,
    Mod = 8,
    /// Q16.16 multiply
    MulF = 9,
    /// Q16.16 divide
    DivF = 10,
    And = 11,
    Or = 12,
    /// a = (b == 0)
    Not = 13,
    Eq = 14,
    Ne = 15,
    Lt = 16,
    Le = 17,
    Gt = 18,
    Ge = 19,
    /// a = b * 65536
    ItoF = 20,
    /// a = b / 65536
    FtoI = 21,
    /// pc = offset16
    Jmp = 22,
    /// if a == 0 { pc = offset16 }
    Jz = 23,
    /// push return pc; pc = offset16
    Call = 24,
    /// pop return pc, or finish the invocation with RV
    Ret = 25,
    /// RV = library[a](b, c)
    Sys = 26,
    /// a = sum(data[b .. b + c])
    VSum = 27,
    VMin = 28,
    VMax = 29,
    VAvg = 30,
    /// data[a .. a + c] = b (broadcast)
    VFill = 31,
    /// a = data[b + data[c]]
    LdArr = 32,
    /// data[a + data[b]] = c
    StArr = 33,
    /// a = pixel[data[b]]
    PixL = 34,
    /// pixel[data[a]] = b
    PixS = 35,
    /// a = db[entry16]
    DbL = 36,
    /// db[entry16] = a
    DbS = 37,
    /// fatal fault when a == 0
    Assert = 38,
}

impl Opcode {
    /// Maps arithmetic opcodes back onto the shared evaluation rules.
    /// Returns the operator and whether Q16.16 scaling applies.
    pub fn binop(self) -> Option<(BinOp, bool)> {
        Some(match self {
            Opcode::Add => (BinOp::Add, false),
            Opcode::Sub => (BinOp::Sub, false),
            Opcode::Mul => (BinOp::Mul, false),
            Opcode::Div => (BinOp::Div, false),
            Opcode::Mod => (BinOp::Mod, false),
            Opcode::MulF => (BinOp::Mul, true),
            Opcode::DivF => (BinOp::Div, true),
            Opcode::And => (BinOp::And, false),
            Opcode::Or => (BinOp::Or, false),
            Opcode::Eq => (BinOp::Eq, false),
            Opcode::Ne => (BinOp::Ne, false),
            Opcode::Lt => (BinOp::Lt, false),
            Opcode::Le => (BinOp::Le, false),
            Opcode::Gt => (BinOp::Gt, false),
            Opcode::Ge => (BinOp::Ge, false),
            _ => return None,
        })
    }
}

/// One fully resolved machine instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub opcode: Opcode,
    pub a: u8,
    pub b: u8,
    pub c: u8,
}

impl Instr {
    pub fn new(opcode: Opcode, a: u8, b: u8, c: u8) -> Self {
        Self { opcode, a, b, c }
    }

    pub fn wide(opcode: Opcode, a: u8, bc: u16) -> Self {
        let [b, c] = bc.to_le_bytes();
        Self { opcode, a, b, c }
    }

    /// The `b`/`c` pair as a little-endian 16-bit value
    pub fn bc(&self) -> u16 {
        u16::from_le_bytes([self.b, self.c])
    }

    /// The `b`/`c` pair as a sign-extended immediate
    pub fn imm(&self) -> i32 {
        i32::from(self.bc() as i16)
    }

    pub fn encode(&self) -> [u8; 4] {
        [self.opcode as u8, self.a, self.b, self.c]
    }

    pub fn decode(bytes: [u8; 4]) -> Result<Self> {
        let opcode = Opcode::from_repr(bytes[0]).ok_or_else(|| {
            CompileError::internal(format!("unknown opcode {:#04x}", bytes[0]))
        })?;
        Ok(Self {
            opcode,
            a: bytes[1],
            b: bytes[2],
            c: bytes[3],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_little_endian_in_the_wide_pair() {
        let instr = Instr::wide(Opcode::LoadImm, 3, 0x1234);
        assert_eq!(instr.encode(), [2, 3, 0x34, 0x12]);
        assert_eq!(instr.bc(), 0x1234);
    }

    #[test]
    fn negative_immediates_sign_extend() {
        let instr = Instr::wide(Opcode::LoadImm, 0, -5i16 as u16);
        assert_eq!(instr.imm(), -5);
    }

    #[test]
    fn decode_round_trips_and_rejects_junk() {
        let instr = Instr::new(Opcode::Add, 1, 2, 3);
        assert_eq!(Instr::decode(instr.encode()).unwrap(), instr);
        assert!(Instr::decode([0xff, 0, 0, 0]).is_err());
    }

    #[test]
    fn fixed_multiply_maps_to_fixed_rules() {
        assert_eq!(Opcode::MulF.binop(), Some((BinOp::Mul, true)));
        assert_eq!(Opcode::Jmp.binop(), None);
    }
}
