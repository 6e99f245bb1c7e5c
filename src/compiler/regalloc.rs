use crate::compiler::CodegenErr;
use std::fmt;

/// The SSE registers, in allocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Register {
    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
    Xmm8,
    Xmm9,
    Xmm10,
    Xmm11,
    Xmm12,
    Xmm13,
    Xmm14,
    Xmm15,
}

pub const BANK: [Register; 16] = [
    Register::Xmm0,
    Register::Xmm1,
    Register::Xmm2,
    Register::Xmm3,
    Register::Xmm4,
    Register::Xmm5,
    Register::Xmm6,
    Register::Xmm7,
    Register::Xmm8,
    Register::Xmm9,
    Register::Xmm10,
    Register::Xmm11,
    Register::Xmm12,
    Register::Xmm13,
    Register::Xmm14,
    Register::Xmm15,
];

impl Register {
    /// Encoding number, 0..16.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// The register holding argument `i` under System V.
    pub fn argument(i: usize) -> Option<Register> {
        BANK.get(i).copied().filter(|_| i < 8)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", self.code())
    }
}

/// A stack of the registers currently holding intermediate values. Registers are handed out in
/// [BANK] order and must be given back in reverse.
#[derive(Debug, Default)]
pub struct RegisterBank {
    used: usize,
}

impl RegisterBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self) -> Result<Register, CodegenErr> {
        let reg = *BANK.get(self.used).ok_or(CodegenErr::RegistersExhausted)?;
        self.used += 1;
        log::trace!("acquire {}", reg);
        Ok(reg)
    }

    pub fn release(&mut self, reg: Register) -> Result<(), CodegenErr> {
        match self.live().last() {
            Some(&top) if top == reg => {
                self.used -= 1;
                log::trace!("release {}", reg);
                Ok(())
            }
            top => Err(CodegenErr::Internal(format!(
                "released {} while {} was on top of the register stack",
                reg,
                top.map_or("nothing".to_string(), ToString::to_string)
            ))),
        }
    }

    /// Registers in use, oldest first.
    pub fn live(&self) -> &'static [Register] {
        &BANK[..self.used]
    }
}
