//! x86-64 machine code for the handful of instructions the generator needs: SSE2 scalar double
//! arithmetic, frame setup, immediate loads, indirect calls and rel32 branches.

use crate::compiler::regalloc::Register;
use thiserror::Error;

/// Largest section the assembler will produce.
pub const DEFAULT_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeErr {
    #[error("Code buffer overrun, limit is {limit} bytes")]
    Overrun { limit: usize },
    #[error("Unsupported operand: {0}")]
    UnsupportedOperand(String),
    #[error("Branch at {at} cannot reach {target}")]
    BranchOutOfRange { at: usize, target: usize },
}

/// General purpose registers, numbered as encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gpr {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Gpr {
    fn code(self) -> u8 {
        self as u8
    }
}

/// `[base + disp]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Gpr,
    pub disp: i32,
}

impl Mem {
    pub fn new(base: Gpr, disp: i32) -> Self {
        Mem { base, disp }
    }
}

/// Two-operand SSE2 instructions, `dst op= src`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseOp {
    MovSd,
    AddSd,
    SubSd,
    MulSd,
    DivSd,
    AndPd,
    XorPd,
    MovApd,
    UComISd,
}

impl SseOp {
    /// Mandatory prefix and the opcode byte following `0F`.
    fn encoding(self) -> (u8, u8) {
        match self {
            SseOp::MovSd => (0xF2, 0x10),
            SseOp::AddSd => (0xF2, 0x58),
            SseOp::MulSd => (0xF2, 0x59),
            SseOp::SubSd => (0xF2, 0x5C),
            SseOp::DivSd => (0xF2, 0x5E),
            SseOp::AndPd => (0x66, 0x54),
            SseOp::XorPd => (0x66, 0x57),
            SseOp::MovApd => (0x66, 0x28),
            SseOp::UComISd => (0x66, 0x2E),
        }
    }
}

/// `cmpsd` predicates that are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpPredicate {
    Lt = 1,
    Le = 2,
}

/// A rel32 field awaiting its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Fixup {
    /// Where the 4 displacement bytes start
    at: usize,
}

pub struct Assembler {
    code: Vec<u8>,
    limit: usize,
}

impl Default for Assembler {
    fn default() -> Self {
        Assembler::with_limit(DEFAULT_LIMIT)
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Assembler { code: Vec::new(), limit }
    }

    /// Offset of the next byte to be emitted.
    pub fn position(&self) -> usize {
        self.code.len()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn finish(self) -> Vec<u8> {
        self.code
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<(), EncodeErr> {
        if self.code.len() + bytes.len() > self.limit {
            return Err(EncodeErr::Overrun { limit: self.limit });
        }
        self.code.extend_from_slice(bytes);
        Ok(())
    }

    /// REX prefix, only when some bit is set.
    fn rex(&mut self, w: bool, reg: u8, rm: u8) -> Result<(), EncodeErr> {
        let rex = 0x40 | (w as u8) << 3 | (reg >> 3) << 2 | (rm >> 3);
        if rex != 0x40 {
            self.emit(&[rex])?;
        }
        Ok(())
    }

    /// ModRM (plus SIB and displacement) for a register and a memory operand.
    fn modrm_mem(&mut self, reg: u8, mem: Mem) -> Result<(), EncodeErr> {
        let base = mem.base.code() & 7;
        let reg = (reg & 7) << 3;
        // rbp and r13 with mode 00 would mean rip-relative
        let (mode, disp) = if mem.disp == 0 && base != 5 {
            (0b00, vec![])
        } else if let Ok(d) = i8::try_from(mem.disp) {
            (0b01, vec![d as u8])
        } else {
            (0b10, mem.disp.to_le_bytes().to_vec())
        };

        self.emit(&[mode << 6 | reg | base])?;
        // rsp and r12 as a base need a SIB byte
        if base == 4 {
            self.emit(&[0x24])?;
        }
        self.emit(&disp)
    }

    fn sse_prefix(&mut self, op: SseOp, reg: u8, rm: u8) -> Result<(), EncodeErr> {
        let (prefix, opcode) = op.encoding();
        self.emit(&[prefix])?;
        self.rex(false, reg, rm)?;
        self.emit(&[0x0F, opcode])
    }

    /// `op dst, src` between registers.
    pub fn sse(&mut self, op: SseOp, dst: Register, src: Register) -> Result<(), EncodeErr> {
        let (d, s) = (dst.code(), src.code());
        self.sse_prefix(op, d, s)?;
        self.emit(&[0xC0 | (d & 7) << 3 | (s & 7)])
    }

    /// `op dst, qword [mem]`
    pub fn sse_load(&mut self, op: SseOp, dst: Register, src: Mem) -> Result<(), EncodeErr> {
        self.sse_prefix(op, dst.code(), src.base.code())?;
        self.modrm_mem(dst.code(), src)
    }

    /// `movsd qword [mem], src`
    pub fn movsd_store(&mut self, dst: Mem, src: Register) -> Result<(), EncodeErr> {
        self.emit(&[0xF2])?;
        self.rex(false, src.code(), dst.base.code())?;
        self.emit(&[0x0F, 0x11])?;
        self.modrm_mem(src.code(), dst)
    }

    /// `cmpsd dst, src, pred`: dst becomes an all-ones mask when `dst pred src`.
    pub fn cmpsd(
        &mut self,
        dst: Register,
        src: Register,
        pred: CmpPredicate,
    ) -> Result<(), EncodeErr> {
        let (d, s) = (dst.code(), src.code());
        self.emit(&[0xF2])?;
        self.rex(false, d, s)?;
        self.emit(&[0x0F, 0xC2, 0xC0 | (d & 7) << 3 | (s & 7), pred as u8])
    }

    /// `mov reg, imm64`, returning the offset of the immediate so it can be linked.
    pub fn mov_imm64(&mut self, dst: Gpr, imm: u64) -> Result<usize, EncodeErr> {
        self.rex(true, 0, dst.code())?;
        self.emit(&[0xB8 + (dst.code() & 7)])?;
        let at = self.position();
        self.emit(&imm.to_le_bytes())?;
        Ok(at)
    }

    /// `mov dst, src` between 64-bit registers.
    pub fn mov(&mut self, dst: Gpr, src: Gpr) -> Result<(), EncodeErr> {
        let (d, s) = (dst.code(), src.code());
        self.rex(true, s, d)?;
        self.emit(&[0x89, 0xC0 | (s & 7) << 3 | (d & 7)])
    }

    /// `call reg`
    pub fn call(&mut self, target: Gpr) -> Result<(), EncodeErr> {
        self.rex(false, 0, target.code())?;
        self.emit(&[0xFF, 0xD0 | (target.code() & 7)])
    }

    pub fn push(&mut self, reg: Gpr) -> Result<(), EncodeErr> {
        self.rex(false, 0, reg.code())?;
        self.emit(&[0x50 + (reg.code() & 7)])
    }

    pub fn pop(&mut self, reg: Gpr) -> Result<(), EncodeErr> {
        self.rex(false, 0, reg.code())?;
        self.emit(&[0x58 + (reg.code() & 7)])
    }

    fn rsp_imm(&mut self, ext: u8, bytes: usize) -> Result<(), EncodeErr> {
        let imm = i32::try_from(bytes)
            .map_err(|_| {
                EncodeErr::UnsupportedOperand(format!("stack adjustment of {} bytes", bytes))
            })?;
        self.emit(&[0x48, 0x81, 0xC0 | ext << 3 | Gpr::Rsp.code()])?;
        self.emit(&imm.to_le_bytes())
    }

    /// `sub rsp, bytes`
    pub fn reserve_stack(&mut self, bytes: usize) -> Result<(), EncodeErr> {
        self.rsp_imm(5, bytes)
    }

    /// `add rsp, bytes`
    pub fn free_stack(&mut self, bytes: usize) -> Result<(), EncodeErr> {
        self.rsp_imm(0, bytes)
    }

    pub fn ret(&mut self) -> Result<(), EncodeErr> {
        self.emit(&[0xC3])
    }

    /// `jz rel32` to a target patched later.
    pub fn jz(&mut self) -> Result<Fixup, EncodeErr> {
        self.emit(&[0x0F, 0x84])?;
        self.rel32_placeholder()
    }

    /// `jmp rel32` to a target patched later.
    pub fn jmp(&mut self) -> Result<Fixup, EncodeErr> {
        self.emit(&[0xE9])?;
        self.rel32_placeholder()
    }

    fn rel32_placeholder(&mut self) -> Result<Fixup, EncodeErr> {
        let at = self.position();
        self.emit(&[0; 4])?;
        Ok(Fixup { at })
    }

    /// Point a branch at `target`, relative to the end of the branch instruction.
    pub fn patch(&mut self, fixup: Fixup, target: usize) -> Result<(), EncodeErr> {
        let next = fixup.at + 4;
        let rel = i32::try_from(target as i64 - next as i64)
            .map_err(|_| EncodeErr::BranchOutOfRange { at: fixup.at, target })?;
        self.code[fixup.at..next].copy_from_slice(&rel.to_le_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::regalloc::Register::*;

    fn assemble(f: impl FnOnce(&mut Assembler) -> Result<(), EncodeErr>) -> String {
        let mut asm = Assembler::new();
        f(&mut asm).unwrap();
        hex::encode(asm.finish())
    }

    #[test]
    fn scalar_double_arithmetic() {
        assert_eq!(assemble(|a| a.sse(SseOp::AddSd, Xmm0, Xmm1)), "f20f58c1");
        assert_eq!(assemble(|a| a.sse(SseOp::DivSd, Xmm2, Xmm3)), "f20f5ed3");
        assert_eq!(assemble(|a| a.sse(SseOp::SubSd, Xmm9, Xmm0)), "f2440f5cc8");
        assert_eq!(assemble(|a| a.sse(SseOp::MulSd, Xmm1, Xmm15)), "f2410f59cf");
        assert_eq!(assemble(|a| a.sse(SseOp::XorPd, Xmm0, Xmm0)), "660f57c0");
        assert_eq!(assemble(|a| a.cmpsd(Xmm0, Xmm1, CmpPredicate::Le)), "f20fc2c102");
    }

    #[test]
    fn memory_operands() {
        // movsd xmm0, [rax]
        assert_eq!(assemble(|a| a.sse_load(SseOp::MovSd, Xmm0, Mem::new(Gpr::Rax, 0))), "f20f1000");
        // movsd xmm1, [rbp-8]
        assert_eq!(
            assemble(|a| a.sse_load(SseOp::MovSd, Xmm1, Mem::new(Gpr::Rbp, -8))),
            "f20f104df8"
        );
        // movsd [rsp+16], xmm2
        assert_eq!(assemble(|a| a.movsd_store(Mem::new(Gpr::Rsp, 16), Xmm2)), "f20f11542410");
        // movsd [rbp-0x200], xmm8
        assert_eq!(
            assemble(|a| a.movsd_store(Mem::new(Gpr::Rbp, -0x200), Xmm8)),
            "f2440f118500feffff"
        );
    }

    #[test]
    fn frame_and_calls() {
        let code = assemble(|a| {
            a.push(Gpr::Rbp)?;
            a.mov(Gpr::Rbp, Gpr::Rsp)?;
            a.reserve_stack(16)?;
            a.call(Gpr::Rax)?;
            a.mov(Gpr::Rsp, Gpr::Rbp)?;
            a.pop(Gpr::Rbp)?;
            a.ret()
        });
        assert_eq!(code, "554889e54881ec10000000ffd04889ec5dc3");
    }

    #[test]
    fn immediates_report_their_offset() {
        let mut asm = Assembler::new();
        asm.push(Gpr::Rbp).unwrap();
        assert_eq!(asm.mov_imm64(Gpr::Rdi, 0x1122334455667788).unwrap(), 3);
        assert_eq!(hex::encode(asm.code()), "5548bf8877665544332211");
    }

    #[test]
    fn branches_are_patched_relative_to_their_end() {
        let mut asm = Assembler::new();
        let skip = asm.jz().unwrap();
        asm.ret().unwrap();
        let end = asm.position();
        asm.patch(skip, end).unwrap();
        let back = asm.jmp().unwrap();
        asm.patch(back, 0).unwrap();
        assert_eq!(hex::encode(asm.finish()), "0f8401000000c3e9f4ffffff");
    }

    #[test]
    fn overrun_is_an_error() {
        let mut asm = Assembler::with_limit(4);
        assert!(asm.push(Gpr::Rbp).is_ok());
        assert_eq!(asm.mov_imm64(Gpr::Rax, 0), Err(EncodeErr::Overrun { limit: 4 }));
    }
}
