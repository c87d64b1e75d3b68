//! x86 / x86-64 target description.
//!
//! Registers are identified by their hardware encoding so that the
//! assembler can splice them directly into ModR/M bytes. The extended
//! registers (`r8`-`r15`, `xmm8`-`xmm15`) only exist on x86-64 and
//! require a REX prefix.

/// Size of a pointer on the target, in bytes.
pub const PTR_SIZE: i32 = std::mem::size_of::<usize>() as i32;

/// Size of an IEEE-754 double, in bytes.
pub const DOUBLE_SIZE: i32 = std::mem::size_of::<f64>() as i32;

/// General purpose integer register.
///
/// The 32-bit names are used for both targets; on x86-64 the same
/// encodings select the full-width registers when an operation is
/// REX.W-prefixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Reg {
    Eax = 0, // accumulator
    Ecx = 1, // counter
    Edx = 2, // data (cdq and idiv clobber it)
    Ebx = 3, // base (callee saved)
    Esp = 4, // stack pointer
    Ebp = 5, // base pointer
    Esi = 6, // source index (callee saved)
    Edi = 7, // destination index (callee saved)
    #[cfg(target_arch = "x86_64")]
    R8 = 8,
    #[cfg(target_arch = "x86_64")]
    R9 = 9,
    #[cfg(target_arch = "x86_64")]
    R10 = 10,
    #[cfg(target_arch = "x86_64")]
    R11 = 11,
    #[cfg(target_arch = "x86_64")]
    R12 = 12, // (callee saved)
    #[cfg(target_arch = "x86_64")]
    R13 = 13, // (callee saved)
    #[cfg(target_arch = "x86_64")]
    R14 = 14, // (callee saved)
    #[cfg(target_arch = "x86_64")]
    R15 = 15, // (callee saved)
}

impl Reg {
    /// The three low bits that go into a ModR/M or opcode byte.
    pub fn low3(self) -> u8 {
        self as u8 % 8
    }

    /// Whether addressing this register requires a REX prefix bit.
    pub fn needs_rex(self) -> bool {
        self as u8 >= 8
    }
}

/// SSE register for doubles.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
    Xmm8 = 8,
    Xmm9 = 9,
    Xmm10 = 10,
    Xmm11 = 11,
    Xmm12 = 12,
    Xmm13 = 13,
    Xmm14 = 14,
    Xmm15 = 15,
}

#[cfg(target_arch = "x86_64")]
impl Xmm {
    /// The three low bits that go into a ModR/M byte.
    pub fn low3(self) -> u8 {
        self as u8 % 8
    }

    /// Whether addressing this register requires a REX prefix bit.
    pub fn needs_rex(self) -> bool {
        self as u8 >= 8
    }
}

/// Branch condition.
///
/// The discriminant is the second opcode byte of the corresponding
/// `jcc rel32` instruction (`0F cc`), except for [`Cond::Always`] which
/// selects the unconditional `E9 rel32` form.
///
/// Unsigned conditions (`Below`, `Above`, ...) double as floating-point
/// conditions after a `comisd` or an x87 compare, since those set the
/// carry and zero flags the same way an unsigned integer compare does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    /// Unconditional jump.
    Always = 0xFF,
    /// Unsigned below (CF).
    Below = 0x82,
    /// Unsigned above-or-equal (!CF).
    AboveOrEqual = 0x83,
    /// Zero / equal (ZF).
    Equal = 0x84,
    /// Nonzero / not equal (!ZF).
    NotEqual = 0x85,
    /// Unsigned below-or-equal (CF or ZF).
    BelowOrEqual = 0x86,
    /// Unsigned above (!CF and !ZF).
    Above = 0x87,
    /// Signed less-than.
    Less = 0x8C,
    /// Signed greater-or-equal.
    GreaterOrEqual = 0x8D,
    /// Signed less-or-equal.
    LessOrEqual = 0x8E,
    /// Signed greater-than.
    Greater = 0x8F,
}
