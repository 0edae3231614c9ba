use serde::{Deserialize, Serialize};

use crate::bpf::{AluOp, JmpCond, Op, Program, Src, BPF_MEMWORDS};
use crate::coverage::Coverage;

// `struct seccomp_data` layout:
//
// ```c
// struct seccomp_data {
//     int nr;
//     __u32 arch;
//     __u64 instruction_pointer;
//     __u64 args[6];
// };
// ```
pub const SECCOMP_DATA_SIZE: usize = 64;
pub const SECCOMP_DATA_NR_OFFSET: u32 = 0;
pub const SECCOMP_DATA_ARCH_OFFSET: u32 = 4;
pub const SECCOMP_DATA_IP_OFFSET: u32 = 8;
pub const SECCOMP_DATA_ARGS_OFFSET: u32 = 16;
pub const SECCOMP_DATA_ARG_SIZE: u32 = 8;

/// Offset of the low 32 bits of argument `index` (little-endian layout).
pub const fn arg_low_offset(index: u32) -> u32 {
    SECCOMP_DATA_ARGS_OFFSET + index * SECCOMP_DATA_ARG_SIZE
}

/// Offset of the high 32 bits of argument `index` (little-endian layout).
pub const fn arg_high_offset(index: u32) -> u32 {
    arg_low_offset(index) + 4
}

/// The syscall context a seccomp program classifies.
///
/// The byte form is little-endian, matching the in-memory layout on x86_64
/// and aarch64, so `LD W ABS` offsets address the same words a kernel
/// filter would see there.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct SeccompData {
    pub nr: i32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

impl SeccompData {
    pub fn from_fields(nr: i32, arch: u32, instruction_pointer: u64, args: [u64; 6]) -> Self {
        SeccompData {
            nr,
            arch,
            instruction_pointer,
            args,
        }
    }

    /// Rebuild a record from an arbitrary buffer. Missing bytes read as zero
    /// and anything past the record is ignored.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; SECCOMP_DATA_SIZE];
        let n = bytes.len().min(SECCOMP_DATA_SIZE);
        buf[..n].copy_from_slice(&bytes[..n]);

        let u32_at = |off: usize| {
            u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
        };
        let u64_at = |off: usize| u64::from(u32_at(off)) | (u64::from(u32_at(off + 4)) << 32);

        let mut args = [0u64; 6];
        for (i, arg) in args.iter_mut().enumerate() {
            *arg = u64_at(arg_low_offset(i as u32) as usize);
        }

        SeccompData::from_fields(
            u32_at(SECCOMP_DATA_NR_OFFSET as usize) as i32,
            u32_at(SECCOMP_DATA_ARCH_OFFSET as usize),
            u64_at(SECCOMP_DATA_IP_OFFSET as usize),
            args,
        )
    }

    pub fn to_bytes(&self) -> [u8; SECCOMP_DATA_SIZE] {
        let mut buf = [0u8; SECCOMP_DATA_SIZE];
        buf[0..4].copy_from_slice(&self.nr.to_le_bytes());
        buf[4..8].copy_from_slice(&self.arch.to_le_bytes());
        buf[8..16].copy_from_slice(&self.instruction_pointer.to_le_bytes());
        for (i, arg) in self.args.iter().enumerate() {
            let off = arg_low_offset(i as u32) as usize;
            buf[off..off + 8].copy_from_slice(&arg.to_le_bytes());
        }
        buf
    }

    /// The 32-bit word at `offset`, as seen by `LD W ABS`.
    pub fn load_word(&self, offset: u32) -> u32 {
        match offset {
            SECCOMP_DATA_NR_OFFSET => self.nr as u32,
            SECCOMP_DATA_ARCH_OFFSET => self.arch,
            SECCOMP_DATA_IP_OFFSET => self.instruction_pointer as u32,
            12 => (self.instruction_pointer >> 32) as u32,
            _ => {
                let rel = offset.saturating_sub(SECCOMP_DATA_ARGS_OFFSET);
                let arg = self
                    .args
                    .get((rel / SECCOMP_DATA_ARG_SIZE) as usize)
                    .copied()
                    .unwrap_or(0);
                if rel % SECCOMP_DATA_ARG_SIZE == 0 {
                    arg as u32
                } else {
                    (arg >> 32) as u32
                }
            }
        }
    }
}

// ============================================================================
// Instrumented execution
// ============================================================================

/// Result of running one program on one input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Execution {
    pub ret: u32,
    pub coverage: Coverage,
}

/// Run `program` on `data`, recording every instruction that executes.
pub fn instrumented_exec(program: &Program, data: &SeccompData) -> Execution {
    let mut coverage = Coverage::new(program.len());
    let mut a: u32 = 0;
    let mut x: u32 = 0;
    let mut mem = [0u32; BPF_MEMWORDS as usize];
    let mut pc = 0usize;

    let ret = loop {
        coverage.mark(pc);
        let mut next = pc + 1;

        match program.op(pc) {
            Op::LdAbs(off) => a = data.load_word(off),
            Op::LdLen => a = SECCOMP_DATA_SIZE as u32,
            Op::LdxLen => x = SECCOMP_DATA_SIZE as u32,
            Op::LdImm(k) => a = k,
            Op::LdxImm(k) => x = k,
            Op::LdMem(i) => a = mem[i as usize],
            Op::LdxMem(i) => x = mem[i as usize],
            Op::St(i) => mem[i as usize] = a,
            Op::Stx(i) => mem[i as usize] = x,
            Op::Alu(alu, src) => {
                let operand = match src {
                    Src::K(k) => k,
                    Src::X => x,
                };
                a = match alu {
                    AluOp::Add => a.wrapping_add(operand),
                    AluOp::Sub => a.wrapping_sub(operand),
                    AluOp::Mul => a.wrapping_mul(operand),
                    AluOp::Div => match a.checked_div(operand) {
                        Some(v) => v,
                        // Division by a zero X register aborts with 0.
                        None => break 0,
                    },
                    AluOp::Or => a | operand,
                    AluOp::And => a & operand,
                    // Register shift counts are taken modulo 32.
                    AluOp::Lsh => a.wrapping_shl(operand),
                    AluOp::Rsh => a.wrapping_shr(operand),
                    AluOp::Xor => a ^ operand,
                };
            }
            Op::Neg => a = a.wrapping_neg(),
            Op::Ja(off) => next += off as usize,
            Op::Jmp { cond, src, jt, jf } => {
                let operand = match src {
                    Src::K(k) => k,
                    Src::X => x,
                };
                let taken = match cond {
                    JmpCond::Eq => a == operand,
                    JmpCond::Gt => a > operand,
                    JmpCond::Ge => a >= operand,
                    JmpCond::Set => a & operand != 0,
                };
                next += usize::from(if taken { jt } else { jf });
            }
            Op::RetK(k) => break k,
            Op::RetA => break a,
            Op::Tax => x = a,
            Op::Txa => a = x,
        }

        pc = next;
    };

    Execution { ret, coverage }
}
