//! Classic BPF programs as accepted by the kernel's seccomp filter loader.
//!
//! Programs exported by libseccomp are arrays of `struct sock_filter`:
//!
//! ```c
//! struct sock_filter {
//!     __u16 code;
//!     __u8  jt;
//!     __u8  jf;
//!     __u32 k;
//! };
//! ```
//!
//! [`Program::new`] applies the same restrictions as `seccomp_check_filter`
//! and `check_load_and_stores` (no scratch read without a prior store on
//! every path) and decodes every instruction once, so the interpreter in
//! [`crate::exec`] never has to deal with malformed code.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::exec::SECCOMP_DATA_SIZE;

// Instruction classes.
// See /usr/include/linux/bpf_common.h .
pub const BPF_LD: u16 = 0x00;
pub const BPF_LDX: u16 = 0x01;
pub const BPF_ST: u16 = 0x02;
pub const BPF_STX: u16 = 0x03;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;
pub const BPF_MISC: u16 = 0x07;

// ld/ldx fields.
pub const BPF_W: u16 = 0x00;
pub const BPF_IMM: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_MEM: u16 = 0x60;
pub const BPF_LEN: u16 = 0x80;

// alu/jmp fields.
pub const BPF_ADD: u16 = 0x00;
pub const BPF_SUB: u16 = 0x10;
pub const BPF_MUL: u16 = 0x20;
pub const BPF_DIV: u16 = 0x30;
pub const BPF_OR: u16 = 0x40;
pub const BPF_AND: u16 = 0x50;
pub const BPF_LSH: u16 = 0x60;
pub const BPF_RSH: u16 = 0x70;
pub const BPF_NEG: u16 = 0x80;
pub const BPF_XOR: u16 = 0xa0;

pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;

pub const BPF_K: u16 = 0x00;
pub const BPF_X: u16 = 0x08;
pub const BPF_A: u16 = 0x10;

// misc fields.
pub const BPF_TAX: u16 = 0x00;
pub const BPF_TXA: u16 = 0x80;

/// Maximum number of instructions in a program (`BPF_MAXINSNS`).
pub const BPF_MAX_LEN: usize = 4096;
/// Number of scratch memory slots (`BPF_MEMWORDS`).
pub const BPF_MEMWORDS: u32 = 16;

const INSTRUCTION_SIZE: usize = 8;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BpfError {
    #[error("BPF program is empty")]
    Empty,
    #[error("BPF program has {0} instructions, the limit is 4096")]
    TooLong(usize),
    #[error("BPF byte length {0} is not a multiple of 8")]
    TruncatedBytes(usize),
    #[error("Instruction {pc}: opcode {code:#06x} is not allowed in seccomp filters")]
    InvalidOpcode { pc: usize, code: u16 },
    #[error("Instruction {pc}: load offset {offset} is outside seccomp_data")]
    BadLoadOffset { pc: usize, offset: u32 },
    #[error("Instruction {pc}: scratch memory index {index} out of range")]
    BadScratchIndex { pc: usize, index: u32 },
    #[error("Instruction {pc}: division by constant zero")]
    DivisionByZero { pc: usize },
    #[error("Instruction {pc}: shift by {shift} bits")]
    ShiftTooLarge { pc: usize, shift: u32 },
    #[error("Instruction {pc}: jump target out of bounds")]
    JumpOutOfBounds { pc: usize },
    #[error("Last instruction is not a return")]
    MissingReturn,
    #[error("Instruction {pc}: scratch memory M[{index}] may be read before it is stored")]
    UninitializedScratch { pc: usize, index: u32 },
}

// ============================================================================
// Raw instructions
// ============================================================================

/// One raw `struct sock_filter`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct Instruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl Instruction {
    pub const fn stmt(code: u16, k: u32) -> Self {
        Instruction {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Instruction { code, jt, jf, k }
    }

    fn from_ne_bytes(chunk: &[u8; INSTRUCTION_SIZE]) -> Self {
        Instruction {
            code: u16::from_ne_bytes([chunk[0], chunk[1]]),
            jt: chunk[2],
            jf: chunk[3],
            k: u32::from_ne_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
        }
    }

    pub fn to_ne_bytes(self) -> [u8; INSTRUCTION_SIZE] {
        let mut out = [0u8; INSTRUCTION_SIZE];
        out[..2].copy_from_slice(&self.code.to_ne_bytes());
        out[2] = self.jt;
        out[3] = self.jf;
        out[4..].copy_from_slice(&self.k.to_ne_bytes());
        out
    }
}

/// Split an exported filter into instructions.
pub fn decode(bytes: &[u8]) -> Result<Vec<Instruction>, BpfError> {
    if bytes.len() % INSTRUCTION_SIZE != 0 {
        return Err(BpfError::TruncatedBytes(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(INSTRUCTION_SIZE)
        .filter_map(|chunk| chunk.try_into().ok())
        .map(Instruction::from_ne_bytes)
        .collect())
}

pub fn encode(instructions: &[Instruction]) -> Vec<u8> {
    instructions
        .iter()
        .flat_map(|insn| insn.to_ne_bytes())
        .collect()
}

// ============================================================================
// Decoded operations
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Src {
    K(u32),
    X,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    Div,
    Or,
    And,
    Lsh,
    Rsh,
    Xor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JmpCond {
    Eq,
    Gt,
    Ge,
    Set,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    LdAbs(u32),
    LdLen,
    LdxLen,
    LdImm(u32),
    LdxImm(u32),
    LdMem(u32),
    LdxMem(u32),
    St(u32),
    Stx(u32),
    Alu(AluOp, Src),
    Neg,
    /// Unconditional jump; the offset is relative to the next instruction.
    Ja(u32),
    Jmp {
        cond: JmpCond,
        src: Src,
        jt: u8,
        jf: u8,
    },
    RetK(u32),
    RetA,
    Tax,
    Txa,
}

fn decode_op(pc: usize, insn: Instruction) -> Result<Op, BpfError> {
    let invalid = || BpfError::InvalidOpcode { pc, code: insn.code };
    let scratch = |index: u32| {
        if index < BPF_MEMWORDS {
            Ok(index)
        } else {
            Err(BpfError::BadScratchIndex { pc, index })
        }
    };
    let k = insn.k;

    let op = match insn.code {
        c if c == BPF_LD | BPF_W | BPF_ABS => {
            if k % 4 != 0 || k as usize >= SECCOMP_DATA_SIZE {
                return Err(BpfError::BadLoadOffset { pc, offset: k });
            }
            Op::LdAbs(k)
        }
        c if c == BPF_LD | BPF_W | BPF_LEN => Op::LdLen,
        c if c == BPF_LDX | BPF_W | BPF_LEN => Op::LdxLen,
        c if c == BPF_LD | BPF_IMM => Op::LdImm(k),
        c if c == BPF_LDX | BPF_IMM => Op::LdxImm(k),
        c if c == BPF_LD | BPF_MEM => Op::LdMem(scratch(k)?),
        c if c == BPF_LDX | BPF_MEM => Op::LdxMem(scratch(k)?),
        BPF_ST => Op::St(scratch(k)?),
        BPF_STX => Op::Stx(scratch(k)?),
        c if c == BPF_ALU | BPF_NEG => Op::Neg,
        c if c & 0x07 == BPF_ALU => {
            let alu = match c & 0xf0 {
                BPF_ADD => AluOp::Add,
                BPF_SUB => AluOp::Sub,
                BPF_MUL => AluOp::Mul,
                BPF_DIV => AluOp::Div,
                BPF_OR => AluOp::Or,
                BPF_AND => AluOp::And,
                BPF_LSH => AluOp::Lsh,
                BPF_RSH => AluOp::Rsh,
                BPF_XOR => AluOp::Xor,
                _ => return Err(invalid()),
            };
            let src = match c & !(0xf0 | 0x07) {
                BPF_K => Src::K(k),
                BPF_X => Src::X,
                _ => return Err(invalid()),
            };
            match (alu, src) {
                (AluOp::Div, Src::K(0)) => return Err(BpfError::DivisionByZero { pc }),
                (AluOp::Lsh | AluOp::Rsh, Src::K(shift)) if shift >= 32 => {
                    return Err(BpfError::ShiftTooLarge { pc, shift })
                }
                _ => {}
            }
            Op::Alu(alu, src)
        }
        c if c == BPF_JMP | BPF_JA => Op::Ja(k),
        c if c & 0x07 == BPF_JMP => {
            let cond = match c & 0xf0 {
                BPF_JEQ => JmpCond::Eq,
                BPF_JGT => JmpCond::Gt,
                BPF_JGE => JmpCond::Ge,
                BPF_JSET => JmpCond::Set,
                _ => return Err(invalid()),
            };
            let src = match c & !(0xf0 | 0x07) {
                BPF_K => Src::K(k),
                BPF_X => Src::X,
                _ => return Err(invalid()),
            };
            Op::Jmp {
                cond,
                src,
                jt: insn.jt,
                jf: insn.jf,
            }
        }
        c if c == BPF_RET | BPF_K => Op::RetK(k),
        c if c == BPF_RET | BPF_A => Op::RetA,
        c if c == BPF_MISC | BPF_TAX => Op::Tax,
        c if c == BPF_MISC | BPF_TXA => Op::Txa,
        _ => return Err(invalid()),
    };

    Ok(op)
}

// ============================================================================
// Validated programs
// ============================================================================

/// Every `M[i]` read must be preceded by a store to `M[i]` on all paths
/// reaching it. Jumps only go forward, so one pass in program order sees
/// every predecessor of an instruction before the instruction itself.
fn check_load_and_stores(ops: &[Op]) -> Result<(), BpfError> {
    // Bit i set: M[i] is stored on every path into this pc.
    let mut masks = vec![u16::MAX; ops.len()];
    let mut valid: u16 = 0;

    for (pc, op) in ops.iter().enumerate() {
        valid &= masks[pc];
        match *op {
            Op::St(i) | Op::Stx(i) => valid |= 1 << i,
            Op::LdMem(i) | Op::LdxMem(i) => {
                if valid & (1 << i) == 0 {
                    return Err(BpfError::UninitializedScratch { pc, index: i });
                }
            }
            Op::Ja(off) => {
                masks[pc + 1 + off as usize] &= valid;
                valid = u16::MAX;
            }
            Op::Jmp { jt, jf, .. } => {
                masks[pc + 1 + jt as usize] &= valid;
                masks[pc + 1 + jf as usize] &= valid;
                valid = u16::MAX;
            }
            _ => {}
        }
    }
    Ok(())
}

/// A validated seccomp program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Program {
    instructions: Vec<Instruction>,
    ops: Vec<Op>,
}

impl Program {
    pub fn new(instructions: Vec<Instruction>) -> Result<Self, BpfError> {
        if instructions.is_empty() {
            return Err(BpfError::Empty);
        }
        if instructions.len() > BPF_MAX_LEN {
            return Err(BpfError::TooLong(instructions.len()));
        }

        let len = instructions.len();
        let ops = instructions
            .iter()
            .enumerate()
            .map(|(pc, insn)| decode_op(pc, *insn))
            .collect::<Result<Vec<_>, _>>()?;

        for (pc, op) in ops.iter().enumerate() {
            let next = pc + 1;
            let in_bounds = match *op {
                Op::Ja(off) => next.checked_add(off as usize).is_some_and(|t| t < len),
                Op::Jmp { jt, jf, .. } => {
                    next + (jt as usize) < len && next + (jf as usize) < len
                }
                _ => true,
            };
            if !in_bounds {
                return Err(BpfError::JumpOutOfBounds { pc });
            }
        }

        if !matches!(ops.last(), Some(Op::RetK(_) | Op::RetA)) {
            return Err(BpfError::MissingReturn);
        }

        check_load_and_stores(&ops)?;

        Ok(Program { instructions, ops })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BpfError> {
        Program::new(decode(bytes)?)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub(crate) fn op(&self, pc: usize) -> Op {
        self.ops[pc]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode(&self.instructions)
    }
}

// ============================================================================
// Disassembly
// ============================================================================

/// Raw form, as a `struct sock_filter` initializer.
impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ {:#06x}, {}, {}, {:#010x} }}",
            self.code, self.jt, self.jf, self.k
        )
    }
}

impl fmt::Display for Src {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Src::K(k) => write!(f, "#{:#x}", k),
            Src::X => write!(f, "x"),
        }
    }
}

fn write_op(f: &mut fmt::Formatter<'_>, pc: usize, op: Op) -> fmt::Result {
    let next = pc + 1;
    match op {
        Op::LdAbs(off) => write!(f, "ld [{}]", off),
        Op::LdLen => write!(f, "ld #len"),
        Op::LdxLen => write!(f, "ldx #len"),
        Op::LdImm(k) => write!(f, "ld #{:#x}", k),
        Op::LdxImm(k) => write!(f, "ldx #{:#x}", k),
        Op::LdMem(i) => write!(f, "ld M[{}]", i),
        Op::LdxMem(i) => write!(f, "ldx M[{}]", i),
        Op::St(i) => write!(f, "st M[{}]", i),
        Op::Stx(i) => write!(f, "stx M[{}]", i),
        Op::Alu(alu, src) => {
            let name = match alu {
                AluOp::Add => "add",
                AluOp::Sub => "sub",
                AluOp::Mul => "mul",
                AluOp::Div => "div",
                AluOp::Or => "or",
                AluOp::And => "and",
                AluOp::Lsh => "lsh",
                AluOp::Rsh => "rsh",
                AluOp::Xor => "xor",
            };
            write!(f, "{} {}", name, src)
        }
        Op::Neg => write!(f, "neg"),
        Op::Ja(off) => write!(f, "ja {}", next + off as usize),
        Op::Jmp { cond, src, jt, jf } => {
            let name = match cond {
                JmpCond::Eq => "jeq",
                JmpCond::Gt => "jgt",
                JmpCond::Ge => "jge",
                JmpCond::Set => "jset",
            };
            write!(
                f,
                "{} {}, {}, {}",
                name,
                src,
                next + jt as usize,
                next + jf as usize
            )
        }
        Op::RetK(k) => write!(f, "ret #{:#010x}", k),
        Op::RetA => write!(f, "ret a"),
        Op::Tax => write!(f, "tax"),
        Op::Txa => write!(f, "txa"),
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.len().to_string().len();
        for (pc, op) in self.ops.iter().enumerate() {
            write!(f, "{:>width$}: ", pc, width = width)?;
            write_op(f, pc, *op)?;
            writeln!(f)?;
        }
        Ok(())
    }
}
