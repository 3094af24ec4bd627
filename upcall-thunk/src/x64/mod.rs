//! Encoding of the few x86-64 instructions that thunks are made of.
//! All memory operands are either `[rsp + disp32]` or `[base + disp8]`.

use crate::driver::Emitter;

pub mod sysv;
pub mod win64;

const REX: u8 = 0x40;
const REX_W: u8 = 0x08;
const REX_R: u8 = 0x04;
const REX_B: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}
impl Gpr {
    #[must_use]
    pub const fn low_bits(self) -> u8 {
        self as u8 & 0x7
    }

    #[must_use]
    pub const fn is_extended(self) -> bool {
        self as u8 >= 8
    }
}

/// Only the low eight xmm registers are ever used, so they never need a rex prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
}
impl Xmm {
    pub const ALL: [Xmm; 8] = [
        Xmm::Xmm0,
        Xmm::Xmm1,
        Xmm::Xmm2,
        Xmm::Xmm3,
        Xmm::Xmm4,
        Xmm::Xmm5,
        Xmm::Xmm6,
        Xmm::Xmm7,
    ];

    #[must_use]
    pub const fn low_bits(self) -> u8 {
        self as u8
    }
}

/// Width of a floating point value in an xmm register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatWidth {
    Single,
    Double,
}
impl FloatWidth {
    fn prefix(self) -> u8 {
        match self {
            FloatWidth::Single => 0xF3,
            FloatWidth::Double => 0xF2,
        }
    }
}

fn rex_w(reg: Gpr, rm: Gpr) -> u8 {
    let mut rex = REX | REX_W;
    if reg.is_extended() {
        rex |= REX_R;
    }
    if rm.is_extended() {
        rex |= REX_B;
    }
    rex
}

/// modrm + sib for `[rsp + disp32]`
fn rsp_disp32(out: &mut dyn Emitter, reg_bits: u8, disp: i32) {
    out.emit_u8(0x84 | (reg_bits << 3));
    out.emit_u8(0x24);
    out.emit_i32(disp);
}

/// modrm for `[base]` or `[base + disp8]`.
/// The base can't be one of the registers whose encoding means something else in this form.
fn base_disp8(out: &mut dyn Emitter, reg_bits: u8, base: Gpr, disp: i8) {
    debug_assert!(!matches!(base.low_bits(), 4 | 5));
    if disp == 0 {
        out.emit_u8((reg_bits << 3) | base.low_bits());
    } else {
        out.emit_u8(0x40 | (reg_bits << 3) | base.low_bits());
        out.emit_i8(disp);
    }
}

/// `mov [rsp + disp], src`
pub fn store_gpr(out: &mut dyn Emitter, disp: i32, src: Gpr) {
    out.emit_u8(rex_w(src, Gpr::Rax));
    out.emit_u8(0x89);
    rsp_disp32(out, src.low_bits(), disp);
}

/// `mov dest, [rsp + disp]`
pub fn load_gpr(out: &mut dyn Emitter, dest: Gpr, disp: i32) {
    out.emit_u8(rex_w(dest, Gpr::Rax));
    out.emit_u8(0x8B);
    rsp_disp32(out, dest.low_bits(), disp);
}

/// `mov dest, [base + disp]`
pub fn load_gpr_from(out: &mut dyn Emitter, dest: Gpr, base: Gpr, disp: i8) {
    out.emit_u8(rex_w(dest, base));
    out.emit_u8(0x8B);
    base_disp8(out, dest.low_bits(), base, disp);
}

/// `movss`/`movsd [rsp + disp], src`
pub fn store_xmm(out: &mut dyn Emitter, width: FloatWidth, disp: i32, src: Xmm) {
    out.emit_u8(width.prefix());
    out.emit_bytes(&[0x0F, 0x11]);
    rsp_disp32(out, src.low_bits(), disp);
}

/// `movss`/`movsd dest, [rsp + disp]`
pub fn load_xmm(out: &mut dyn Emitter, width: FloatWidth, dest: Xmm, disp: i32) {
    out.emit_u8(width.prefix());
    out.emit_bytes(&[0x0F, 0x10]);
    rsp_disp32(out, dest.low_bits(), disp);
}

/// `movss`/`movsd dest, [base + disp]`
pub fn load_xmm_from(out: &mut dyn Emitter, width: FloatWidth, dest: Xmm, base: Gpr, disp: i8) {
    out.emit_u8(width.prefix());
    if base.is_extended() {
        out.emit_u8(REX | REX_B);
    }
    out.emit_bytes(&[0x0F, 0x10]);
    base_disp8(out, dest.low_bits(), base, disp);
}

/// `mov dest, src`
pub fn mov_gpr(out: &mut dyn Emitter, dest: Gpr, src: Gpr) {
    out.emit_u8(rex_w(src, dest));
    out.emit_u8(0x89);
    out.emit_u8(0xC0 | (src.low_bits() << 3) | dest.low_bits());
}

/// `mov dest, imm32`, sign extended to 64 bits
pub fn mov_imm32(out: &mut dyn Emitter, dest: Gpr, imm: i32) {
    out.emit_u8(rex_w(Gpr::Rax, dest));
    out.emit_u8(0xC7);
    out.emit_u8(0xC0 | dest.low_bits());
    out.emit_i32(imm);
}

/// `mov dest, imm64`
pub fn mov_imm64(out: &mut dyn Emitter, dest: Gpr, imm: u64) {
    out.emit_u8(rex_w(Gpr::Rax, dest));
    out.emit_u8(0xB8 + dest.low_bits());
    out.emit_u64(imm);
}

/// `lea dest, [rsp + disp]`
pub fn lea_rsp(out: &mut dyn Emitter, dest: Gpr, disp: i32) {
    out.emit_u8(rex_w(dest, Gpr::Rax));
    out.emit_u8(0x8D);
    rsp_disp32(out, dest.low_bits(), disp);
}

/// `sub rsp, imm`, with the short form when it fits
pub fn sub_rsp(out: &mut dyn Emitter, imm: i32) {
    rsp_arith(out, 0xEC, imm);
}

/// `add rsp, imm`, with the short form when it fits
pub fn add_rsp(out: &mut dyn Emitter, imm: i32) {
    rsp_arith(out, 0xC4, imm);
}

fn rsp_arith(out: &mut dyn Emitter, modrm: u8, imm: i32) {
    out.emit_u8(REX | REX_W);
    if let Ok(imm) = i8::try_from(imm) {
        out.emit_u8(0x83);
        out.emit_u8(modrm);
        out.emit_i8(imm);
    } else {
        out.emit_u8(0x81);
        out.emit_u8(modrm);
        out.emit_i32(imm);
    }
}

pub fn push(out: &mut dyn Emitter, reg: Gpr) {
    if reg.is_extended() {
        out.emit_u8(REX | REX_B);
    }
    out.emit_u8(0x50 + reg.low_bits());
}

pub fn pop(out: &mut dyn Emitter, reg: Gpr) {
    if reg.is_extended() {
        out.emit_u8(REX | REX_B);
    }
    out.emit_u8(0x58 + reg.low_bits());
}

/// `call [base + disp]`
pub fn call_indirect(out: &mut dyn Emitter, base: Gpr, disp: i8) {
    if base.is_extended() {
        out.emit_u8(REX | REX_B);
    }
    out.emit_u8(0xFF);
    out.emit_u8(0x50 | base.low_bits());
    out.emit_i8(disp);
}

/// `rep movsb`, copying `rcx` bytes from `[rsi]` to `[rdi]`
pub fn rep_movsb(out: &mut dyn Emitter) {
    out.emit_bytes(&[0xF3, 0xA4]);
}

pub fn ret(out: &mut dyn Emitter) {
    out.emit_u8(0xC3);
}

/// Copy `size` bytes from `[rsp + from]` to `[rsp + to]`, clobbering rsi, rdi and rcx
pub fn copy_on_stack(out: &mut dyn Emitter, from: i32, to: i32, size: i32) {
    lea_rsp(out, Gpr::Rsi, from);
    lea_rsp(out, Gpr::Rdi, to);
    mov_imm32(out, Gpr::Rcx, size);
    rep_movsb(out);
}

/// Copy `size` bytes from `[src]` to `[rsp + to]`, clobbering rsi, rdi and rcx
pub fn copy_to_stack(out: &mut dyn Emitter, src: Gpr, to: i32, size: i32) {
    if src != Gpr::Rsi {
        mov_gpr(out, Gpr::Rsi, src);
    }
    lea_rsp(out, Gpr::Rdi, to);
    mov_imm32(out, Gpr::Rcx, size);
    rep_movsb(out);
}

/// The stack has to be 16 byte aligned at calls. The return address and `pushed` bytes of saved
/// registers are already on the stack, so round `frame` so that all of them together are aligned.
#[must_use]
pub fn align_frame(frame: i32, pushed: i32) -> i32 {
    if (frame + pushed) % 16 == 0 {
        frame + 8
    } else {
        frame
    }
}

#[cfg(test)]
mod tests {
    use crate::driver::{CodeSizer, Emitter};

    use super::{
        add_rsp, call_indirect, load_gpr, load_gpr_from, load_xmm_from, mov_gpr, mov_imm32,
        mov_imm64, pop, push, store_gpr, store_xmm, sub_rsp, FloatWidth, Gpr, Xmm,
    };

    /// Collects everything, unlike the fixed size writer
    #[derive(Default)]
    struct Bytes(Vec<u8>);
    impl Emitter for Bytes {
        fn emit_bytes(&mut self, bytes: &[u8]) {
            self.0.extend_from_slice(bytes);
        }

        fn position(&self) -> usize {
            self.0.len()
        }
    }

    fn encode(f: impl Fn(&mut dyn Emitter)) -> Vec<u8> {
        let mut bytes = Bytes::default();
        f(&mut bytes);
        let mut sizer = CodeSizer::new();
        f(&mut sizer);
        assert_eq!(sizer.position(), bytes.0.len());
        bytes.0
    }

    #[test]
    fn test_encodings() {
        assert_eq!(
            encode(|o| store_gpr(o, 0x10, Gpr::Rdi)),
            [0x48, 0x89, 0xBC, 0x24, 0x10, 0, 0, 0]
        );
        assert_eq!(
            encode(|o| store_gpr(o, 0, Gpr::R8)),
            [0x4C, 0x89, 0x84, 0x24, 0, 0, 0, 0]
        );
        assert_eq!(
            encode(|o| load_gpr(o, Gpr::Rax, 0x38)),
            [0x48, 0x8B, 0x84, 0x24, 0x38, 0, 0, 0]
        );
        assert_eq!(
            encode(|o| store_xmm(o, FloatWidth::Double, 8, Xmm::Xmm0)),
            [0xF2, 0x0F, 0x11, 0x84, 0x24, 8, 0, 0, 0]
        );
        assert_eq!(
            encode(|o| store_xmm(o, FloatWidth::Single, 0, Xmm::Xmm3)),
            [0xF3, 0x0F, 0x11, 0x9C, 0x24, 0, 0, 0, 0]
        );
        assert_eq!(encode(|o| mov_gpr(o, Gpr::Rsi, Gpr::Rsp)), [0x48, 0x89, 0xE6]);
        assert_eq!(encode(|o| mov_gpr(o, Gpr::Rbx, Gpr::Rcx)), [0x48, 0x89, 0xCB]);
        assert_eq!(
            encode(|o| mov_imm64(o, Gpr::Rdi, 0x1122_3344_5566_7788)),
            [0x48, 0xBF, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(
            encode(|o| mov_imm32(o, Gpr::Rcx, 24)),
            [0x48, 0xC7, 0xC1, 24, 0, 0, 0]
        );
        assert_eq!(encode(|o| call_indirect(o, Gpr::Rdi, 8)), [0xFF, 0x57, 0x08]);
        assert_eq!(encode(|o| sub_rsp(o, 8)), [0x48, 0x83, 0xEC, 0x08]);
        assert_eq!(
            encode(|o| sub_rsp(o, 0x88)),
            [0x48, 0x81, 0xEC, 0x88, 0, 0, 0]
        );
        assert_eq!(encode(|o| add_rsp(o, 0x18)), [0x48, 0x83, 0xC4, 0x18]);
        assert_eq!(encode(|o| push(o, Gpr::Rbx)), [0x53]);
        assert_eq!(encode(|o| pop(o, Gpr::R9)), [0x41, 0x59]);
        assert_eq!(encode(|o| load_gpr_from(o, Gpr::Rax, Gpr::Rax, 0)), [0x48, 0x8B, 0x00]);
        assert_eq!(
            encode(|o| load_gpr_from(o, Gpr::Rdx, Gpr::Rax, 8)),
            [0x48, 0x8B, 0x50, 0x08]
        );
        assert_eq!(
            encode(|o| load_xmm_from(o, FloatWidth::Double, Xmm::Xmm1, Gpr::Rax, 8)),
            [0xF2, 0x0F, 0x10, 0x48, 0x08]
        );
    }
}
