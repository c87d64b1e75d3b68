//! Binary x86 / x86-64 instruction encoder.
//!
//! An assembler that takes method calls as its input instead of text and
//! appends encoded bytes to a [`CodeBuffer`] instead of an object file.
//! Operand order follows Intel syntax: destination before source.
//!
//! Jump helpers return the byte offset of the 32-bit displacement word so
//! the code generator can patch forward jumps once the target is known.
//! Branches always use the 32-bit displacement forms (`E9` / `0F cc`) to
//! keep their sizes deterministic; the `*_size` associated functions expose
//! instruction sizes for the inline branch sequences that compute their
//! displacement up front.

use super::buffer::CodeBuffer;
use super::error::Result;
use super::x86::{Cond, Reg};

#[cfg(target_arch = "x86_64")]
use super::x86::Xmm;

const IS_64_BIT: bool = cfg!(target_arch = "x86_64");

/// ModR/M addressing of `[esp + disp]` needs a SIB byte; this is the one
/// that selects no index register.
const SIB_ESP: u8 = 0x24;

/// Instruction encoder writing to a [`CodeBuffer`].
pub struct Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> Assembler<'a> {
    /// Wrap a buffer for emission.
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    // --- data movement ------------------------------------------------

    /// `push reg` (pointer width).
    pub fn push_reg(&mut self, reg: Reg) -> Result<()> {
        self.rex_if_needed(false, false, false, reg.needs_rex())?;
        self.buf.push_u8(0x50 + reg.low3())
    }

    /// `pop reg` (pointer width).
    pub fn pop_reg(&mut self, reg: Reg) -> Result<()> {
        self.rex_if_needed(false, false, false, reg.needs_rex())?;
        self.buf.push_u8(0x58 + reg.low3())
    }

    /// Discard one pointer-sized value from the stack without reading it.
    pub fn drop_ptr(&mut self) -> Result<()> {
        self.add_imm(Reg::Esp, std::mem::size_of::<usize>() as u32)
    }

    /// Discard eight bytes from the stack without reading them.
    pub fn drop_qword(&mut self) -> Result<()> {
        self.add_imm(Reg::Esp, 8)
    }

    /// `push imm32`, sign-extended to pointer width by the CPU.
    pub fn push_imm32(&mut self, value: u32) -> Result<()> {
        if value <= 0x7F {
            self.buf.push_u8(0x6A)?;
            self.buf.push_u8(value as u8)
        } else {
            self.buf.push_u8(0x68)?;
            self.buf.push_u32(value)
        }
    }

    /// Push a 64-bit immediate.
    ///
    /// There is no 64-bit immediate push; on x86-64 the stack slot is
    /// reserved and filled with two 32-bit stores, on x86 it becomes two
    /// 32-bit pushes, high word first.
    pub fn push_imm64(&mut self, value: u64) -> Result<()> {
        #[cfg(target_arch = "x86_64")]
        {
            self.sub_imm(Reg::Esp, 8)?;
            // mov dword ptr [rsp + 4], high
            self.buf.push_u8(0xC7)?;
            self.buf.push_u8(0x44)?;
            self.buf.push_u8(SIB_ESP)?;
            self.buf.push_u8(0x04)?;
            self.buf.push_u32((value >> 32) as u32)?;
            // mov dword ptr [rsp], low
            self.buf.push_u8(0xC7)?;
            self.buf.push_u8(0x04)?;
            self.buf.push_u8(SIB_ESP)?;
            self.buf.push_u32(value as u32)?;
        }
        #[cfg(target_arch = "x86")]
        {
            self.push_imm32((value >> 32) as u32)?;
            self.push_imm32(value as u32)?;
        }
        Ok(())
    }

    /// Push a pointer-sized immediate.
    pub fn push_imm_ptr(&mut self, value: usize) -> Result<()> {
        #[cfg(target_arch = "x86_64")]
        return self.push_imm64(value as u64);
        #[cfg(target_arch = "x86")]
        return self.push_imm32(value as u32);
    }

    /// `mov reg, imm32`. On x86-64 this zero-extends into the full register.
    pub fn mov_imm32(&mut self, reg: Reg, value: u32) -> Result<()> {
        self.rex_if_needed(false, false, false, reg.needs_rex())?;
        self.buf.push_u8(0xB8 + reg.low3())?;
        self.buf.push_u32(value)
    }

    /// Size in bytes of a `mov acc, imm32` as emitted by [`Self::mov_imm32`].
    pub const fn mov_imm32_size() -> u32 {
        5
    }

    /// `mov reg, imm64`.
    #[cfg(target_arch = "x86_64")]
    pub fn mov_imm64(&mut self, reg: Reg, value: u64) -> Result<()> {
        self.rex_if_needed(true, false, false, reg.needs_rex())?;
        self.buf.push_u8(0xB8 + reg.low3())?;
        self.buf.push_u64(value)
    }

    /// Load a pointer-sized immediate, typically an absolute code address.
    pub fn mov_imm_ptr(&mut self, reg: Reg, value: usize) -> Result<()> {
        #[cfg(target_arch = "x86_64")]
        return self.mov_imm64(reg, value as u64);
        #[cfg(target_arch = "x86")]
        return self.mov_imm32(reg, value as u32);
    }

    /// `mov to, from`, full register width.
    pub fn mov(&mut self, to: Reg, from: Reg) -> Result<()> {
        self.rex_if_needed(IS_64_BIT, to.needs_rex(), false, from.needs_rex())?;
        self.buf.push_u8(0x8B)?;
        self.buf.push_u8(0xC0 | (to.low3() << 3) | from.low3())
    }

    /// `mov dst, [base + offset]`. `wide` selects a 64-bit load on x86-64.
    pub fn load(&mut self, dst: Reg, base: Reg, offset: i32, wide: bool) -> Result<()> {
        self.rex_if_needed(wide, dst.needs_rex(), false, base.needs_rex())?;
        self.buf.push_u8(0x8B)?;
        self.mem_modrm(dst.low3(), base, offset)
    }

    /// `mov [base + offset], src`. `wide` selects a 64-bit store on x86-64.
    pub fn store(&mut self, base: Reg, offset: i32, src: Reg, wide: bool) -> Result<()> {
        self.rex_if_needed(wide, src.needs_rex(), false, base.needs_rex())?;
        self.buf.push_u8(0x89)?;
        self.mem_modrm(src.low3(), base, offset)
    }

    /// `lea dst, [base + offset]` (pointer width).
    pub fn lea(&mut self, dst: Reg, base: Reg, offset: i32) -> Result<()> {
        self.rex_if_needed(IS_64_BIT, dst.needs_rex(), false, base.needs_rex())?;
        self.buf.push_u8(0x8D)?;
        self.mem_modrm(dst.low3(), base, offset)
    }

    // --- arithmetic and logic -----------------------------------------

    /// `add esp, imm` at pointer width. The stack pointer is the only
    /// register the generator adjusts by immediate.
    ///
    /// # Panics
    /// Panics if `reg` is not the stack pointer.
    pub fn add_imm(&mut self, reg: Reg, value: u32) -> Result<()> {
        assert!(reg == Reg::Esp, "immediate add is reserved for the stack pointer");
        self.rex_if_needed(IS_64_BIT, false, false, reg.needs_rex())?;
        if value <= 0x7F {
            self.buf.push_u8(0x83)?;
            self.buf.push_u8(0xC0 + reg.low3())?;
            self.buf.push_u8(value as u8)
        } else {
            self.buf.push_u8(0x81)?;
            self.buf.push_u8(0xC0 + reg.low3())?;
            self.buf.push_u32(value)
        }
    }

    /// `sub esp, imm` at pointer width.
    ///
    /// # Panics
    /// Panics if `reg` is not the stack pointer.
    pub fn sub_imm(&mut self, reg: Reg, value: u32) -> Result<()> {
        assert!(reg == Reg::Esp, "immediate sub is reserved for the stack pointer");
        self.rex_if_needed(IS_64_BIT, false, false, reg.needs_rex())?;
        if value <= 0x7F {
            self.buf.push_u8(0x83)?;
            self.buf.push_u8(0xE8 + reg.low3())?;
            self.buf.push_u8(value as u8)
        } else {
            self.buf.push_u8(0x81)?;
            self.buf.push_u8(0xE8 + reg.low3())?;
            self.buf.push_u32(value)
        }
    }

    /// 32-bit `add a, b`.
    pub fn add(&mut self, a: Reg, b: Reg) -> Result<()> {
        self.reg_reg_op32(0x03, a, b)
    }

    /// 32-bit `sub a, b`.
    pub fn sub(&mut self, a: Reg, b: Reg) -> Result<()> {
        self.reg_reg_op32(0x2B, a, b)
    }

    /// 32-bit `and a, b`.
    pub fn and(&mut self, a: Reg, b: Reg) -> Result<()> {
        self.reg_reg_op32(0x23, a, b)
    }

    /// 32-bit `or a, b`.
    pub fn or(&mut self, a: Reg, b: Reg) -> Result<()> {
        self.reg_reg_op32(0x0B, a, b)
    }

    /// 32-bit `xor a, b`.
    pub fn xor(&mut self, a: Reg, b: Reg) -> Result<()> {
        self.reg_reg_op32(0x33, a, b)
    }

    /// 32-bit `imul a, b`.
    pub fn imul(&mut self, a: Reg, b: Reg) -> Result<()> {
        self.rex_if_needed(false, a.needs_rex(), false, b.needs_rex())?;
        self.buf.push_u8(0x0F)?;
        self.buf.push_u8(0xAF)?;
        self.buf.push_u8(0xC0 | (a.low3() << 3) | b.low3())
    }

    /// `idiv reg`: divides edx:eax, quotient to eax, remainder to edx.
    pub fn idiv(&mut self, reg: Reg) -> Result<()> {
        self.rex_if_needed(false, false, false, reg.needs_rex())?;
        self.buf.push_u8(0xF7)?;
        self.buf.push_u8(0xF8 + reg.low3())
    }

    /// `cdq`: sign-extend eax into edx, preparing for `idiv`.
    pub fn cdq(&mut self) -> Result<()> {
        self.buf.push_u8(0x99)
    }

    /// `shl eax, cl`.
    ///
    /// # Panics
    /// Panics unless the operands are the accumulator and the counter.
    pub fn shl(&mut self, a: Reg, b: Reg) -> Result<()> {
        assert!(a == Reg::Eax && b == Reg::Ecx, "shift is accumulator-by-cl only");
        self.buf.push_u8(0xD3)?;
        self.buf.push_u8(0xE0)
    }

    /// `sar eax, cl`.
    ///
    /// # Panics
    /// Panics unless the operands are the accumulator and the counter.
    pub fn sar(&mut self, a: Reg, b: Reg) -> Result<()> {
        assert!(a == Reg::Eax && b == Reg::Ecx, "shift is accumulator-by-cl only");
        self.buf.push_u8(0xD3)?;
        self.buf.push_u8(0xF8)
    }

    // --- control flow -------------------------------------------------

    /// 32-bit `cmp a, b`.
    pub fn cmp(&mut self, a: Reg, b: Reg) -> Result<()> {
        self.reg_reg_op32(0x3B, a, b)
    }

    /// 32-bit `cmp reg, imm32`, with the short immediate and accumulator
    /// forms when they apply.
    pub fn cmp_imm32(&mut self, reg: Reg, value: u32) -> Result<()> {
        self.rex_if_needed(false, false, false, reg.needs_rex())?;
        if value <= 0x7F {
            self.buf.push_u8(0x83)?;
            self.buf.push_u8(0xF8 + reg.low3())?;
            self.buf.push_u8(value as u8)
        } else if reg == Reg::Eax {
            self.buf.push_u8(0x3D)?;
            self.buf.push_u32(value)
        } else {
            self.buf.push_u8(0x81)?;
            self.buf.push_u8(0xF8 + reg.low3())?;
            self.buf.push_u32(value)
        }
    }

    /// Size in bytes of the `cmp` that [`Self::cmp_imm32`] would emit.
    pub fn cmp_imm32_size(reg: Reg, value: u32) -> u32 {
        if value <= 0x7F {
            3
        } else if reg == Reg::Eax {
            5
        } else {
            6
        }
    }

    /// Emit a jump with a 32-bit displacement and return the byte offset
    /// of the displacement word for later patching.
    ///
    /// `distance` is relative to the end of the instruction, exactly as
    /// the CPU interprets it; pass 0 when the target is not yet known.
    pub fn jmp(&mut self, cond: Cond, distance: i32) -> Result<u32> {
        let at = self.buf.len();
        if cond == Cond::Always {
            self.buf.push_u8(0xE9)?;
            self.buf.push_u32(distance as u32)?;
            Ok(at + 1)
        } else {
            self.buf.push_u8(0x0F)?;
            self.buf.push_u8(cond as u8)?;
            self.buf.push_u32(distance as u32)?;
            Ok(at + 2)
        }
    }

    /// Patch a previously emitted jump displacement.
    pub fn set_jump_distance(&mut self, location: u32, distance: i32) {
        let bytes = distance.to_le_bytes();
        for (i, byte) in bytes.iter().enumerate() {
            self.buf.set_byte(location + i as u32, *byte);
        }
    }

    /// Size in bytes of the jump [`Self::jmp`] emits for `cond`.
    pub fn jmp_size(cond: Cond) -> u32 {
        if cond == Cond::Always {
            5
        } else {
            6
        }
    }

    /// `call reg`.
    pub fn call(&mut self, reg: Reg) -> Result<()> {
        self.rex_if_needed(false, false, false, reg.needs_rex())?;
        self.buf.push_u8(0xFF)?;
        self.buf.push_u8(0xD0 + reg.low3())
    }

    /// `ret`.
    pub fn ret(&mut self) -> Result<()> {
        self.buf.push_u8(0xC3)
    }

    // --- shared encoding helpers --------------------------------------

    /// 32-bit two-register operation of the common `op /r` shape.
    fn reg_reg_op32(&mut self, opcode: u8, a: Reg, b: Reg) -> Result<()> {
        self.rex_if_needed(false, a.needs_rex(), false, b.needs_rex())?;
        self.buf.push_u8(opcode)?;
        self.buf.push_u8(0xC0 | (a.low3() << 3) | b.low3())
    }

    /// ModR/M + SIB + displacement for a `[base + offset]` operand.
    ///
    /// `[ebp]` and `[r13]` have no zero-displacement encoding (it selects
    /// rip-relative / absolute addressing instead), so those take the
    /// 8-bit form with a zero byte. Esp as a base always needs the SIB.
    fn mem_modrm(&mut self, reg_bits: u8, base: Reg, offset: i32) -> Result<()> {
        if offset == 0 && base.low3() != Reg::Ebp.low3() {
            self.buf.push_u8((reg_bits << 3) + base.low3())?;
            if base.low3() == Reg::Esp.low3() {
                self.buf.push_u8(SIB_ESP)?;
            }
            Ok(())
        } else if (-128..=127).contains(&offset) {
            self.buf.push_u8(0x40 + (reg_bits << 3) + base.low3())?;
            if base.low3() == Reg::Esp.low3() {
                self.buf.push_u8(SIB_ESP)?;
            }
            self.buf.push_u8(offset as u8)
        } else {
            self.buf.push_u8(0x80 + (reg_bits << 3) + base.low3())?;
            if base.low3() == Reg::Esp.low3() {
                self.buf.push_u8(SIB_ESP)?;
            }
            self.buf.push_u32(offset as u32)
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn rex_if_needed(&mut self, w: bool, r: bool, x: bool, b: bool) -> Result<()> {
        if w || r || x || b {
            self.buf.push_u8(
                0x40 | (u8::from(w) << 3) | (u8::from(r) << 2) | (u8::from(x) << 1) | u8::from(b),
            )?;
        }
        Ok(())
    }

    #[cfg(target_arch = "x86")]
    fn rex_if_needed(&mut self, w: bool, r: bool, x: bool, b: bool) -> Result<()> {
        debug_assert!(!w && !r && !x && !b, "x86 never takes a REX prefix");
        Ok(())
    }
}

// --- double operations, x86-64 (SSE2) ---------------------------------

#[cfg(target_arch = "x86_64")]
impl Assembler<'_> {
    /// Spill an SSE register to a fresh stack slot.
    pub fn push_xmm(&mut self, reg: Xmm) -> Result<()> {
        self.sub_imm(Reg::Esp, 8)?;
        self.movsd_store(Reg::Esp, 0, reg)
    }

    /// Reload an SSE register from the top stack slot and free it.
    pub fn pop_xmm(&mut self, reg: Xmm) -> Result<()> {
        self.movsd_load(reg, Reg::Esp, 0)?;
        self.add_imm(Reg::Esp, 8)
    }

    /// `movsd to, from` between SSE registers.
    pub fn movsd(&mut self, to: Xmm, from: Xmm) -> Result<()> {
        self.buf.push_u8(0xF2)?;
        self.rex_if_needed(false, to.needs_rex(), false, from.needs_rex())?;
        self.buf.push_u8(0x0F)?;
        self.buf.push_u8(0x10)?;
        self.buf.push_u8(0xC0 + (to.low3() << 3) + from.low3())
    }

    /// `movsd dst, [base + offset]`.
    pub fn movsd_load(&mut self, dst: Xmm, base: Reg, offset: i32) -> Result<()> {
        self.buf.push_u8(0xF2)?;
        self.rex_if_needed(true, dst.needs_rex(), false, base.needs_rex())?;
        self.buf.push_u8(0x0F)?;
        self.buf.push_u8(0x10)?;
        self.mem_modrm(dst.low3(), base, offset)
    }

    /// `movsd [base + offset], src`.
    pub fn movsd_store(&mut self, base: Reg, offset: i32, src: Xmm) -> Result<()> {
        self.buf.push_u8(0xF2)?;
        self.rex_if_needed(true, src.needs_rex(), false, base.needs_rex())?;
        self.buf.push_u8(0x0F)?;
        self.buf.push_u8(0x11)?;
        self.mem_modrm(src.low3(), base, offset)
    }

    /// `addsd a, b`.
    pub fn addsd(&mut self, a: Xmm, b: Xmm) -> Result<()> {
        self.sse_op(0x58, a, b)
    }

    /// `subsd a, b`.
    pub fn subsd(&mut self, a: Xmm, b: Xmm) -> Result<()> {
        self.sse_op(0x5C, a, b)
    }

    /// `mulsd a, b`.
    pub fn mulsd(&mut self, a: Xmm, b: Xmm) -> Result<()> {
        self.sse_op(0x59, a, b)
    }

    /// `divsd a, b`.
    pub fn divsd(&mut self, a: Xmm, b: Xmm) -> Result<()> {
        self.sse_op(0x5E, a, b)
    }

    /// `comisd a, b`: ordered compare setting the integer flags.
    pub fn comisd(&mut self, a: Xmm, b: Xmm) -> Result<()> {
        self.buf.push_u8(0x66)?;
        self.rex_if_needed(false, a.needs_rex(), false, b.needs_rex())?;
        self.buf.push_u8(0x0F)?;
        self.buf.push_u8(0x2F)?;
        self.buf.push_u8(0xC0 + (a.low3() << 3) + b.low3())
    }

    /// Size in bytes of a `comisd` between low SSE registers.
    pub const fn comisd_size() -> u32 {
        4
    }

    /// `cvtsi2sd dst, src`: 32-bit integer to double.
    pub fn cvtsi2sd(&mut self, dst: Xmm, src: Reg) -> Result<()> {
        self.buf.push_u8(0xF2)?;
        self.rex_if_needed(false, dst.needs_rex(), false, src.needs_rex())?;
        self.buf.push_u8(0x0F)?;
        self.buf.push_u8(0x2A)?;
        self.buf.push_u8(0xC0 + (dst.low3() << 3) + src.low3())
    }

    /// `cvttsd2si dst, src`: double to 32-bit integer, truncating.
    pub fn cvttsd2si(&mut self, dst: Reg, src: Xmm) -> Result<()> {
        self.buf.push_u8(0xF2)?;
        self.rex_if_needed(false, dst.needs_rex(), false, src.needs_rex())?;
        self.buf.push_u8(0x0F)?;
        self.buf.push_u8(0x2C)?;
        self.buf.push_u8(0xC0 + (dst.low3() << 3) + src.low3())
    }

    fn sse_op(&mut self, opcode: u8, a: Xmm, b: Xmm) -> Result<()> {
        self.buf.push_u8(0xF2)?;
        self.rex_if_needed(false, a.needs_rex(), false, b.needs_rex())?;
        self.buf.push_u8(0x0F)?;
        self.buf.push_u8(opcode)?;
        self.buf.push_u8(0xC0 + (a.low3() << 3) + b.low3())
    }
}

// --- double operations, x86 (x87) --------------------------------------

#[cfg(target_arch = "x86")]
impl Assembler<'_> {
    /// `fld qword ptr [base + offset]`.
    pub fn fld(&mut self, base: Reg, offset: i32) -> Result<()> {
        self.buf.push_u8(0xDD)?;
        self.mem_modrm(0, base, offset)
    }

    /// Size in bytes of the `fld` that [`Self::fld`] would emit.
    pub fn fld_size(base: Reg, offset: i32) -> u32 {
        let sib = u32::from(base == Reg::Esp);
        if offset == 0 && base != Reg::Ebp {
            2 + sib
        } else if (-128..=127).contains(&offset) {
            3 + sib
        } else {
            6 + sib
        }
    }

    /// `fild dword ptr [base + offset]`: load a 32-bit integer, converting
    /// to double.
    pub fn fild(&mut self, base: Reg, offset: i32) -> Result<()> {
        self.buf.push_u8(0xDB)?;
        self.mem_modrm(0, base, offset)
    }

    /// `fstp qword ptr [base + offset]`: store st0 and pop it.
    pub fn fstp(&mut self, base: Reg, offset: i32) -> Result<()> {
        self.buf.push_u8(0xDD)?;
        self.mem_modrm(3, base, offset)
    }

    /// `faddp st(1), st`: st1 + st0, popped into st0.
    pub fn faddp(&mut self) -> Result<()> {
        self.buf.push_u8(0xDE)?;
        self.buf.push_u8(0xC1)
    }

    /// `fsubrp st(1), st`: st0 - st1, popped into st0.
    pub fn fsubrp(&mut self) -> Result<()> {
        self.buf.push_u8(0xDE)?;
        self.buf.push_u8(0xE1)
    }

    /// `fmulp st(1), st`: st1 * st0, popped into st0.
    pub fn fmulp(&mut self) -> Result<()> {
        self.buf.push_u8(0xDE)?;
        self.buf.push_u8(0xC9)
    }

    /// `fdivrp st(1), st`: st0 / st1, popped into st0.
    pub fn fdivrp(&mut self) -> Result<()> {
        self.buf.push_u8(0xDE)?;
        self.buf.push_u8(0xF1)
    }

    /// Compare st0 with st1, pop both, and move the result flags into the
    /// integer flags: `fcompp; wait; fnstsw ax; sahf`.
    ///
    /// The flag transfer goes through ax, clobbering the accumulator; the
    /// register parameter exists so that call sites spell that out.
    ///
    /// # Panics
    /// Panics unless the scratch register is the accumulator.
    pub fn x87_compare_and_pop(&mut self, must_be_eax: Reg) -> Result<()> {
        assert!(must_be_eax == Reg::Eax, "x87 flag transfer goes through ax");
        self.buf.push_u8(0xDE)?; // fcompp
        self.buf.push_u8(0xD9)?;
        self.buf.push_u8(0x9B)?; // wait
        self.buf.push_u8(0xDF)?; // fnstsw ax
        self.buf.push_u8(0xE0)?;
        self.buf.push_u8(0x9E) // sahf
    }

    /// Size in bytes of the sequence [`Self::x87_compare_and_pop`] emits.
    pub const fn x87_compare_size() -> u32 {
        6
    }

    /// Discard st0: `ffree st(0); fincstp`.
    pub fn x87_pop(&mut self) -> Result<()> {
        self.buf.push_u8(0xDD)?; // ffree st(0)
        self.buf.push_u8(0xC0)?;
        self.buf.push_u8(0xD9)?; // fincstp
        self.buf.push_u8(0xF7)
    }

    /// `cvttsd2si dst, qword ptr [base + offset]`.
    pub fn cvttsd2si_mem(&mut self, dst: Reg, base: Reg, offset: i32) -> Result<()> {
        self.buf.push_u8(0xF2)?;
        self.buf.push_u8(0x0F)?;
        self.buf.push_u8(0x2C)?;
        self.mem_modrm(dst.low3(), base, offset)
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::codegen::x86::{Reg::*, Xmm::*};

    fn emitted(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        f(&mut Assembler::new(&mut buf));
        buf.bytes().to_vec()
    }

    #[test]
    fn push_pop_registers() {
        assert_eq!(emitted(|a| a.push_reg(Eax).unwrap()), [0x50]);
        assert_eq!(emitted(|a| a.push_reg(Edi).unwrap()), [0x57]);
        assert_eq!(emitted(|a| a.push_reg(R8).unwrap()), [0x41, 0x50]);
        assert_eq!(emitted(|a| a.pop_reg(Ecx).unwrap()), [0x59]);
        assert_eq!(emitted(|a| a.pop_reg(R9).unwrap()), [0x41, 0x59]);
    }

    #[test]
    fn mov_immediates() {
        assert_eq!(
            emitted(|a| a.mov_imm32(Eax, 7).unwrap()),
            [0xB8, 7, 0, 0, 0]
        );
        assert_eq!(Assembler::mov_imm32_size(), 5);
        assert_eq!(
            emitted(|a| a.mov_imm64(Eax, 0x1122334455667788).unwrap()),
            [0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(
            emitted(|a| a.mov_imm64(R8, 1).unwrap()),
            [0x49, 0xB8, 1, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn mov_register_to_register_is_full_width() {
        assert_eq!(emitted(|a| a.mov(Ecx, Eax).unwrap()), [0x48, 0x8B, 0xC8]);
        assert_eq!(emitted(|a| a.mov(Edx, Ecx).unwrap()), [0x48, 0x8B, 0xD1]);
    }

    #[test]
    fn loads_and_stores() {
        // mov eax, dword ptr [rsp] needs the SIB byte
        assert_eq!(
            emitted(|a| a.load(Eax, Esp, 0, false).unwrap()),
            [0x8B, 0x04, 0x24]
        );
        // mov rax, qword ptr [rsp + 8]
        assert_eq!(
            emitted(|a| a.load(Eax, Esp, 8, true).unwrap()),
            [0x48, 0x8B, 0x44, 0x24, 0x08]
        );
        // mov eax, dword ptr [rsp + 0x100]
        assert_eq!(
            emitted(|a| a.load(Eax, Esp, 0x100, false).unwrap()),
            [0x8B, 0x84, 0x24, 0x00, 0x01, 0x00, 0x00]
        );
        // [rbp] has no zero-displacement form
        assert_eq!(
            emitted(|a| a.load(Eax, Ebp, 0, false).unwrap()),
            [0x8B, 0x45, 0x00]
        );
        // mov qword ptr [rsp + 16], rcx
        assert_eq!(
            emitted(|a| a.store(Esp, 16, Ecx, true).unwrap()),
            [0x48, 0x89, 0x4C, 0x24, 0x10]
        );
        // mov dword ptr [rsp], eax
        assert_eq!(
            emitted(|a| a.store(Esp, 0, Eax, false).unwrap()),
            [0x89, 0x04, 0x24]
        );
    }

    #[test]
    fn lea_forms() {
        assert_eq!(
            emitted(|a| a.lea(Eax, Esp, 0).unwrap()),
            [0x48, 0x8D, 0x04, 0x24]
        );
        assert_eq!(
            emitted(|a| a.lea(Ecx, Esp, 0x20).unwrap()),
            [0x48, 0x8D, 0x4C, 0x24, 0x20]
        );
        assert_eq!(
            emitted(|a| a.lea(Ecx, Esp, 0x200).unwrap()),
            [0x48, 0x8D, 0x8C, 0x24, 0x00, 0x02, 0x00, 0x00]
        );
    }

    #[test]
    fn stack_pointer_arithmetic() {
        assert_eq!(
            emitted(|a| a.add_imm(Esp, 8).unwrap()),
            [0x48, 0x83, 0xC4, 0x08]
        );
        assert_eq!(
            emitted(|a| a.add_imm(Esp, 0x100).unwrap()),
            [0x48, 0x81, 0xC4, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(
            emitted(|a| a.sub_imm(Esp, 8).unwrap()),
            [0x48, 0x83, 0xEC, 0x08]
        );
        assert_eq!(
            emitted(|a| a.sub_imm(Esp, 0x88).unwrap()),
            [0x48, 0x81, 0xEC, 0x88, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn alu_register_forms() {
        assert_eq!(emitted(|a| a.add(Eax, Ecx).unwrap()), [0x03, 0xC1]);
        assert_eq!(emitted(|a| a.sub(Eax, Ecx).unwrap()), [0x2B, 0xC1]);
        assert_eq!(emitted(|a| a.and(Eax, Ecx).unwrap()), [0x23, 0xC1]);
        assert_eq!(emitted(|a| a.or(Eax, Ecx).unwrap()), [0x0B, 0xC1]);
        assert_eq!(emitted(|a| a.xor(Eax, Ecx).unwrap()), [0x33, 0xC1]);
        assert_eq!(emitted(|a| a.imul(Eax, Ecx).unwrap()), [0x0F, 0xAF, 0xC1]);
        assert_eq!(emitted(|a| a.idiv(Ecx).unwrap()), [0xF7, 0xF9]);
        assert_eq!(emitted(|a| a.cdq().unwrap()), [0x99]);
        assert_eq!(emitted(|a| a.shl(Eax, Ecx).unwrap()), [0xD3, 0xE0]);
        assert_eq!(emitted(|a| a.sar(Eax, Ecx).unwrap()), [0xD3, 0xF8]);
    }

    #[test]
    fn compares() {
        assert_eq!(emitted(|a| a.cmp(Eax, Ecx).unwrap()), [0x3B, 0xC1]);
        assert_eq!(emitted(|a| a.cmp_imm32(Eax, 0).unwrap()), [0x83, 0xF8, 0]);
        assert_eq!(
            emitted(|a| a.cmp_imm32(Eax, 0x100).unwrap()),
            [0x3D, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(
            emitted(|a| a.cmp_imm32(Ecx, 0x100).unwrap()),
            [0x81, 0xF9, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(Assembler::cmp_imm32_size(Eax, 0), 3);
        assert_eq!(Assembler::cmp_imm32_size(Eax, 0x100), 5);
        assert_eq!(Assembler::cmp_imm32_size(Ecx, 0x100), 6);
    }

    #[test]
    fn jumps_and_patching() {
        assert_eq!(
            emitted(|a| {
                a.jmp(Cond::Always, 3).unwrap();
            }),
            [0xE9, 3, 0, 0, 0]
        );
        assert_eq!(
            emitted(|a| {
                a.jmp(Cond::Equal, -1).unwrap();
            }),
            [0x0F, 0x84, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(Assembler::jmp_size(Cond::Always), 5);
        assert_eq!(Assembler::jmp_size(Cond::Greater), 6);

        let mut buf = CodeBuffer::new();
        let mut a = Assembler::new(&mut buf);
        let anchor = a.jmp(Cond::NotEqual, 0).unwrap();
        assert_eq!(anchor, 2);
        a.set_jump_distance(anchor, -0x12345678);
        assert_eq!(buf.bytes(), &[0x0F, 0x85, 0x88, 0xA9, 0xCB, 0xED]);
    }

    #[test]
    fn calls_and_returns() {
        assert_eq!(emitted(|a| a.call(Eax).unwrap()), [0xFF, 0xD0]);
        assert_eq!(emitted(|a| a.ret().unwrap()), [0xC3]);
    }

    #[test]
    fn pushed_immediates() {
        assert_eq!(emitted(|a| a.push_imm32(0x10).unwrap()), [0x6A, 0x10]);
        assert_eq!(
            emitted(|a| a.push_imm32(0x100).unwrap()),
            [0x68, 0x00, 0x01, 0x00, 0x00]
        );
        // The 64-bit push reserves a slot and stores both halves; the
        // memory image must be the little-endian quadword.
        assert_eq!(
            emitted(|a| a.push_imm64(0x0807060504030201).unwrap()),
            [
                0x48, 0x83, 0xEC, 0x08, // sub rsp, 8
                0xC7, 0x44, 0x24, 0x04, 0x05, 0x06, 0x07, 0x08, // high half
                0xC7, 0x04, 0x24, 0x01, 0x02, 0x03, 0x04, // low half
            ]
        );
    }

    #[test]
    fn sse_encodings() {
        assert_eq!(
            emitted(|a| a.movsd(Xmm1, Xmm0).unwrap()),
            [0xF2, 0x0F, 0x10, 0xC8]
        );
        assert_eq!(
            emitted(|a| a.movsd_load(Xmm0, Esp, 0).unwrap()),
            [0xF2, 0x48, 0x0F, 0x10, 0x04, 0x24]
        );
        assert_eq!(
            emitted(|a| a.movsd_store(Esp, 8, Xmm0).unwrap()),
            [0xF2, 0x48, 0x0F, 0x11, 0x44, 0x24, 0x08]
        );
        assert_eq!(
            emitted(|a| a.addsd(Xmm0, Xmm1).unwrap()),
            [0xF2, 0x0F, 0x58, 0xC1]
        );
        assert_eq!(
            emitted(|a| a.subsd(Xmm0, Xmm1).unwrap()),
            [0xF2, 0x0F, 0x5C, 0xC1]
        );
        assert_eq!(
            emitted(|a| a.mulsd(Xmm0, Xmm1).unwrap()),
            [0xF2, 0x0F, 0x59, 0xC1]
        );
        assert_eq!(
            emitted(|a| a.divsd(Xmm0, Xmm1).unwrap()),
            [0xF2, 0x0F, 0x5E, 0xC1]
        );
        assert_eq!(
            emitted(|a| a.comisd(Xmm1, Xmm0).unwrap()),
            [0x66, 0x0F, 0x2F, 0xC8]
        );
        assert_eq!(Assembler::comisd_size(), 4);
        assert_eq!(
            emitted(|a| a.cvtsi2sd(Xmm0, Eax).unwrap()),
            [0xF2, 0x0F, 0x2A, 0xC0]
        );
        assert_eq!(
            emitted(|a| a.cvttsd2si(Eax, Xmm0).unwrap()),
            [0xF2, 0x0F, 0x2C, 0xC0]
        );
        assert_eq!(
            emitted(|a| a.movsd(Xmm8, Xmm0).unwrap()),
            [0xF2, 0x44, 0x0F, 0x10, 0xC0]
        );
    }

    #[test]
    fn execute_trivial_function() {
        let mut buf = CodeBuffer::new();
        let mut a = Assembler::new(&mut buf);
        a.mov_imm32(Eax, 42).unwrap();
        a.ret().unwrap();
        let f: unsafe extern "win64" fn() -> i32 =
            unsafe { std::mem::transmute(buf.executable_address()) };
        assert_eq!(unsafe { f() }, 42);
    }

    #[test]
    fn execute_patched_forward_jump() {
        // Jump over a mov that would clobber the result.
        let mut buf = CodeBuffer::new();
        let mut a = Assembler::new(&mut buf);
        a.mov_imm32(Eax, 7).unwrap();
        let anchor = a.jmp(Cond::Always, 0).unwrap();
        let from = buf.len();
        let mut a = Assembler::new(&mut buf);
        a.mov_imm32(Eax, 0).unwrap();
        let target = buf.len();
        let mut a = Assembler::new(&mut buf);
        a.ret().unwrap();
        Assembler::new(&mut buf).set_jump_distance(anchor, target as i32 - from as i32);
        let f: unsafe extern "win64" fn() -> i32 =
            unsafe { std::mem::transmute(buf.executable_address()) };
        assert_eq!(unsafe { f() }, 7);
    }
}
