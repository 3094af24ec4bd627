//! Thunks for the 64-bit `PowerPC` ELF v2 calling convention, little endian.
//!
//! Every argument is mapped onto doublewords of the parameter save area in the caller's frame.
//! The first eight doublewords are passed in `r3-r10` instead, and floating point values go in
//! `f1-f13` while still using up their doubleword. Aggregates are always passed by value, split
//! between registers and the parameter save area where they cross it. Homogeneous floating point
//! aggregates of up to eight members use one floating point register per member.

use smallvec::SmallVec;
use usize_cast::{FromUsize, IntoUsize};

use crate::{
    driver::{Emitter, ThunkGenerator},
    sig::{round_up, SigType, Signature},
    ThunkError, DISPATCHER_OFFSET,
};

const R0: u8 = 0;
const SP: u8 = 1;
const TOC: u8 = 2;
const R3: u8 = 3;
const R4: u8 = 4;
/// Copy source and destination
const SRC: u8 = 11;
const DST: u8 = 12;
const CALL_TARGET: u8 = 12;
const F0: u8 = 0;

const SPR_LR: u16 = 8;
const SPR_CTR: u16 = 9;

/// Back chain, condition register, link register and TOC pointer
pub const FRAME_HEADER: u32 = 32;
const LR_SAVE: i16 = 16;
const TOC_SAVE: i16 = 24;
pub const GPR_PARAM_COUNT: u32 = 8;
pub const FPR_PARAM_COUNT: u32 = 13;
/// Aggregates up to this size are copied with an unrolled sequence rather than a loop
pub const UNROLLED_COPY_LIMIT: u32 = 64;

const BCTRL: u32 = 0x4E800421;
const BLR: u32 = 0x4E800020;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatWidth {
    Single,
    Double,
}
impl FloatWidth {
    #[must_use]
    pub fn size(self) -> u32 {
        match self {
            FloatWidth::Single => 4,
            FloatWidth::Double => 8,
        }
    }
}

fn d_form(opcode: u32, rt: u8, ra: u8, d: i16) -> u32 {
    (opcode << 26) | (u32::from(rt) << 21) | (u32::from(ra) << 16) | u32::from(d as u16)
}

fn ds_form(opcode: u32, rt: u8, ra: u8, ds: i16, xo: u32) -> u32 {
    debug_assert!(ds % 4 == 0);
    (opcode << 26) | (u32::from(rt) << 21) | (u32::from(ra) << 16) | u32::from(ds as u16 & 0xFFFC) | xo
}

/// `std rs, ds(ra)`
#[must_use]
pub fn std(rs: u8, ds: i16, ra: u8) -> u32 {
    ds_form(62, rs, ra, ds, 0)
}

/// `stdu rs, ds(ra)`
#[must_use]
pub fn stdu(rs: u8, ds: i16, ra: u8) -> u32 {
    ds_form(62, rs, ra, ds, 1)
}

/// `ld rt, ds(ra)`
#[must_use]
pub fn ld(rt: u8, ds: i16, ra: u8) -> u32 {
    ds_form(58, rt, ra, ds, 0)
}

/// `stfs`/`stfd fs, d(ra)`
#[must_use]
pub fn stf(width: FloatWidth, fs: u8, d: i16, ra: u8) -> u32 {
    match width {
        FloatWidth::Single => d_form(52, fs, ra, d),
        FloatWidth::Double => d_form(54, fs, ra, d),
    }
}

/// `lfs`/`lfd ft, d(ra)`
#[must_use]
pub fn lf(width: FloatWidth, ft: u8, d: i16, ra: u8) -> u32 {
    match width {
        FloatWidth::Single => d_form(48, ft, ra, d),
        FloatWidth::Double => d_form(50, ft, ra, d),
    }
}

#[must_use]
pub fn lbz(rt: u8, d: i16, ra: u8) -> u32 {
    d_form(34, rt, ra, d)
}

#[must_use]
pub fn stb(rs: u8, d: i16, ra: u8) -> u32 {
    d_form(38, rs, ra, d)
}

/// `addi rt, ra, si`. With `ra` as r0 this is `li`.
#[must_use]
pub fn addi(rt: u8, ra: u8, si: i16) -> u32 {
    d_form(14, rt, ra, si)
}

/// `lis rt, si`
#[must_use]
pub fn lis(rt: u8, si: u16) -> u32 {
    d_form(15, rt, 0, si as i16)
}

/// `ori ra, rs, ui`
#[must_use]
pub fn ori(ra: u8, rs: u8, ui: u16) -> u32 {
    (24 << 26) | (u32::from(rs) << 21) | (u32::from(ra) << 16) | u32::from(ui)
}

/// `oris ra, rs, ui`
#[must_use]
pub fn oris(ra: u8, rs: u8, ui: u16) -> u32 {
    (25 << 26) | (u32::from(rs) << 21) | (u32::from(ra) << 16) | u32::from(ui)
}

/// `rldicr ra, rs, 32, 31`, moving the low word to the high word
#[must_use]
pub fn shift_left_32(ra: u8, rs: u8) -> u32 {
    let sh = 32u32;
    let me = 31u32;
    (30 << 26)
        | (u32::from(rs) << 21)
        | (u32::from(ra) << 16)
        | ((sh & 0x1F) << 11)
        | ((((me & 0x1F) << 1) | (me >> 5)) << 5)
        | (1 << 2)
        | ((sh >> 5) << 1)
}

/// `mr ra, rs`
#[must_use]
pub fn mr(ra: u8, rs: u8) -> u32 {
    0x7C000378 | (u32::from(rs) << 21) | (u32::from(ra) << 16) | (u32::from(rs) << 11)
}

fn spr_field(spr: u16) -> u32 {
    let spr = u32::from(spr);
    (((spr & 0x1F) << 5) | (spr >> 5)) << 11
}

/// `mtspr spr, rs`
#[must_use]
pub fn mtspr(spr: u16, rs: u8) -> u32 {
    0x7C0003A6 | (u32::from(rs) << 21) | spr_field(spr)
}

/// `mfspr rt, spr`
#[must_use]
pub fn mfspr(rt: u8, spr: u16) -> u32 {
    0x7C0002A6 | (u32::from(rt) << 21) | spr_field(spr)
}

/// `bdnz` by `offset` bytes
#[must_use]
pub fn bdnz(offset: i16) -> u32 {
    0x42000000 | (u32::from(offset as u16) & 0xFFFC)
}

/// Load a 64-bit constant, always with five instructions so the size doesn't depend on it
fn load_imm64(out: &mut dyn Emitter, rt: u8, value: u64) {
    out.emit_word(lis(rt, (value >> 48) as u16));
    out.emit_word(ori(rt, rt, (value >> 32) as u16));
    out.emit_word(shift_left_32(rt, rt));
    out.emit_word(oris(rt, rt, (value >> 16) as u16));
    out.emit_word(ori(rt, rt, value as u16));
}

/// Copy `size` bytes from `0(r11)` to `0(r12)`, clobbering both along with r0 and the count
/// register
fn copy_bytes(out: &mut dyn Emitter, size: u32) {
    let words = size / 8;
    let tail = size % 8;
    if size <= UNROLLED_COPY_LIMIT {
        for i in 0..words {
            let offset = (i * 8) as i16;
            out.emit_word(ld(R0, offset, SRC));
            out.emit_word(std(R0, offset, DST));
        }
        for i in words * 8..size {
            out.emit_word(lbz(R0, i as i16, SRC));
            out.emit_word(stb(R0, i as i16, DST));
        }
    } else {
        out.emit_word(addi(R0, 0, words as i16));
        out.emit_word(mtspr(SPR_CTR, R0));
        out.emit_word(ld(R0, 0, SRC));
        out.emit_word(std(R0, 0, DST));
        out.emit_word(addi(SRC, SRC, 8));
        out.emit_word(addi(DST, DST, 8));
        out.emit_word(bdnz(-16));
        for i in 0..tail {
            out.emit_word(lbz(R0, i as i16, SRC));
            out.emit_word(stb(R0, i as i16, DST));
        }
    }
}

/// Offsets are relative to the stack pointer after the prologue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Move {
    Gpr { reg: u8, to: i16 },
    Fpr { reg: u8, width: FloatWidth, to: i16 },
    StackGpr { from: i16, to: i16 },
    StackFpr { from: i16, width: FloatWidth, to: i16 },
    /// The part of an aggregate which is in the parameter save area
    StackCopy { from: i16, to: i16, size: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ppc64Return {
    /// A homogeneous floating point aggregate, returned in `f1` onwards
    Float { width: FloatWidth, count: u32 },
    /// Returned in `r3`, or `r3` and `r4`
    Registers { count: u32 },
    /// Copied to the buffer which the hidden first argument pointed at
    Memory { size: u32, slot: i16 },
}

#[derive(Debug, Clone)]
pub struct Ppc64Plan {
    pub moves: SmallVec<[Move; 16]>,
    pub frame_size: i16,
    pub struct_return: Option<Ppc64Return>,
}

/// The register count and width of an aggregate that is a homogeneous floating point aggregate
#[must_use]
pub fn homogeneous_aggregate(ty: SigType) -> Option<(FloatWidth, u32)> {
    if let SigType::Struct { shape, size } = ty {
        let member = shape.homogeneous_float_size()?;
        let width = if member == 4 {
            FloatWidth::Single
        } else {
            FloatWidth::Double
        };
        let count = size / member;
        if size % member == 0 && (1..=8).contains(&count) {
            return Some((width, count));
        }
    }
    None
}

fn offset16(value: u64) -> Result<i16, ThunkError> {
    i16::try_from(value).map_err(|_| ThunkError::DisplacementOutOfRange {
        displacement: value as i64,
    })
}

/// Where the doublewords of an aggregate starting at doubleword `position` come from, starting
/// with its doubleword `first`
fn aggregate_image(
    moves: &mut SmallVec<[Move; 16]>,
    stack_args: u64,
    position: u32,
    first: u32,
    to: u64,
    size: u32,
) -> Result<(), ThunkError> {
    let dwords = size / 8 + u32::from(size % 8 != 0);
    let mut dword = first;
    while dword < dwords && position + dword < GPR_PARAM_COUNT {
        moves.push(Move::Gpr {
            reg: R3 + (position + dword) as u8,
            to: offset16(to + u64::from(dword) * 8)?,
        });
        dword += 1;
    }
    if dword < dwords {
        moves.push(Move::StackCopy {
            from: offset16(stack_args + u64::from(position + dword) * 8)?,
            to: offset16(to + u64::from(dword) * 8)?,
            size: size - dword * 8,
        });
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Ppc64;
impl ThunkGenerator for Ppc64 {
    type Plan = Ppc64Plan;

    fn plan(&self, signature: &Signature) -> Result<Ppc64Plan, ThunkError> {
        // Doubleword of the parameter save area the next argument maps to
        let mut position = 0u32;
        let mut fprs = 0u32;

        let arg_list_end = u64::from(FRAME_HEADER) + signature.arg_list_size();
        let struct_return = match signature.ret {
            SigType::Struct { size, .. } => Some(
                if let Some((width, count)) = homogeneous_aggregate(signature.ret) {
                    Ppc64Return::Float { width, count }
                } else if size <= 16 {
                    Ppc64Return::Registers {
                        count: size / 8 + u32::from(size % 8 != 0),
                    }
                } else if size / 8 <= 0x7FFF {
                    position += 1;
                    Ppc64Return::Memory {
                        size,
                        slot: offset16(arg_list_end)?,
                    }
                } else {
                    return Err(ThunkError::UnsupportedSignature("aggregate return too large"));
                },
            ),
            _ => None,
        };

        let mut frame = arg_list_end;
        if matches!(struct_return, Some(Ppc64Return::Memory { .. })) {
            frame += 8;
        }
        let frame_size = offset16(u64::from_usize(round_up(frame.into_usize(), 16)))?;
        // Stack arguments are in the caller's parameter save area, past our frame
        let stack_args = u64::from(frame_size.unsigned_abs()) + u64::from(FRAME_HEADER);

        let mut moves = SmallVec::new();
        let mut frame_cursor = u64::from(FRAME_HEADER);
        for param in signature.params.iter().copied() {
            let to = frame_cursor;
            frame_cursor += param.arg_size();
            match param {
                SigType::Void => {
                    return Err(ThunkError::UnsupportedSignature("void parameter"));
                }
                SigType::Float | SigType::Double => {
                    let width = if param == SigType::Float {
                        FloatWidth::Single
                    } else {
                        FloatWidth::Double
                    };
                    let to = offset16(to)?;
                    if fprs < FPR_PARAM_COUNT {
                        moves.push(Move::Fpr {
                            reg: 1 + fprs as u8,
                            width,
                            to,
                        });
                        fprs += 1;
                    } else {
                        moves.push(Move::StackFpr {
                            from: offset16(stack_args + u64::from(position) * 8)?,
                            width,
                            to,
                        });
                    }
                    position += 1;
                }
                SigType::Struct { size, .. } => {
                    if let Some((width, count)) = homogeneous_aggregate(param) {
                        let in_fprs = count.min(FPR_PARAM_COUNT - fprs);
                        if in_fprs < count {
                            // The remaining members are wherever their doubleword is
                            let first = in_fprs * width.size() / 8;
                            aggregate_image(&mut moves, stack_args, position, first, to, size)?;
                        }
                        for i in 0..in_fprs {
                            moves.push(Move::Fpr {
                                reg: 1 + (fprs + i) as u8,
                                width,
                                to: offset16(to + u64::from(i * width.size()))?,
                            });
                        }
                        fprs += in_fprs;
                    } else {
                        aggregate_image(&mut moves, stack_args, position, 0, to, size)?;
                    }
                    position += param.slots();
                }
                _ => {
                    let to = offset16(to)?;
                    if position < GPR_PARAM_COUNT {
                        moves.push(Move::Gpr {
                            reg: R3 + position as u8,
                            to,
                        });
                    } else {
                        moves.push(Move::StackGpr {
                            from: offset16(stack_args + u64::from(position) * 8)?,
                            to,
                        });
                    }
                    position += 1;
                }
            }
        }

        Ok(Ppc64Plan {
            moves,
            frame_size,
            struct_return,
        })
    }

    fn emit(&self, plan: &Ppc64Plan, metadata: u64, out: &mut dyn Emitter) {
        out.emit_word(mfspr(R0, SPR_LR));
        out.emit_word(std(R0, LR_SAVE, SP));
        out.emit_word(stdu(SP, -plan.frame_size, SP));
        out.emit_word(std(TOC, TOC_SAVE, SP));
        if let Some(Ppc64Return::Memory { slot, .. }) = plan.struct_return {
            out.emit_word(std(R3, slot, SP));
        }

        for mv in plan.moves.iter().copied() {
            match mv {
                Move::Gpr { reg, to } => out.emit_word(std(reg, to, SP)),
                Move::Fpr { reg, width, to } => out.emit_word(stf(width, reg, to, SP)),
                Move::StackGpr { from, to } => {
                    out.emit_word(ld(R0, from, SP));
                    out.emit_word(std(R0, to, SP));
                }
                Move::StackFpr { from, width, to } => {
                    out.emit_word(lf(width, F0, from, SP));
                    out.emit_word(stf(width, F0, to, SP));
                }
                Move::StackCopy { from, to, size } => {
                    out.emit_word(addi(SRC, SP, from));
                    out.emit_word(addi(DST, SP, to));
                    copy_bytes(out, size);
                }
            }
        }

        load_imm64(out, R3, metadata);
        out.emit_word(addi(R4, SP, FRAME_HEADER as i16));
        out.emit_word(ld(CALL_TARGET, i16::from(DISPATCHER_OFFSET), R3));
        out.emit_word(mtspr(SPR_CTR, CALL_TARGET));
        out.emit_word(BCTRL);
        out.emit_word(ld(TOC, TOC_SAVE, SP));

        match plan.struct_return {
            Some(Ppc64Return::Float { width, count }) => {
                for i in 0..count {
                    out.emit_word(lf(width, 1 + i as u8, (i * width.size()) as i16, R3));
                }
            }
            Some(Ppc64Return::Registers { count }) => {
                if count == 2 {
                    out.emit_word(ld(R4, 8, R3));
                }
                out.emit_word(ld(R3, 0, R3));
            }
            Some(Ppc64Return::Memory { size, slot }) => {
                out.emit_word(mr(SRC, R3));
                out.emit_word(ld(DST, slot, SP));
                copy_bytes(out, size);
                out.emit_word(ld(R3, slot, SP));
            }
            None => {}
        }

        out.emit_word(addi(SP, SP, plan.frame_size));
        out.emit_word(ld(R0, LR_SAVE, SP));
        out.emit_word(mtspr(SPR_LR, R0));
        out.emit_word(BLR);
    }
}
