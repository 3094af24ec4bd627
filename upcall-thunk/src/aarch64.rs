//! Thunks for the AArch64 procedure call standard, as used on Linux.
//!
//! Arguments arrive in `x0-x7` and `v0-v7`, and then on the stack in 8 byte slots. Aggregates of up
//! to four floats (or four doubles) are homogeneous floating point aggregates and go in consecutive
//! vector registers. Other aggregates of up to 16 bytes go in one or two general purpose
//! registers, and larger ones are passed as a pointer to a copy. An aggregate that doesn't fit in
//! the remaining registers goes entirely to the stack, and no later argument of its kind uses a
//! register. Large aggregates are returned through the buffer that `x8` points at.

use smallvec::SmallVec;

use crate::{
    driver::{Emitter, ThunkGenerator},
    frame_offset,
    sig::{round_up, SigType, Signature},
    ThunkError, DISPATCHER_OFFSET,
};

/// Register number which means the stack pointer as a base, and the zero register otherwise
const SP: u8 = 31;
const XZR: u8 = 31;
/// Indirect result location register
const X8: u8 = 8;
/// Temporaries which aren't used for arguments
const SRC: u8 = 9;
const DST: u8 = 10;
const COUNT: u8 = 11;
const DATA: u8 = 12;
const CALL_TARGET: u8 = 16;
const FP_TEMP: u8 = 16;

pub const GPR_PARAM_COUNT: u8 = 8;
pub const FPR_PARAM_COUNT: u8 = 8;
/// Aggregates up to this size are copied with an unrolled sequence rather than a loop
pub const UNROLLED_COPY_LIMIT: u32 = 64;
/// Largest immediate of an `add`/`sub`, which bounds every stack offset the thunk uses
const MAX_IMM12: u32 = 4095;

const STP_FP_LR_PRE: u32 = 0xA9BF7BFD;
const MOV_FP_SP: u32 = 0x910003FD;
const LDP_FP_LR_POST: u32 = 0xA8C17BFD;
const RET: u32 = 0xD65F03C0;

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

/// `str xt, [xn, #offset]`
#[must_use]
pub fn str_x(rt: u8, rn: u8, offset: u32) -> u32 {
    debug_assert!(offset % 8 == 0);
    0xF9000000 | ((offset / 8) << 10) | (u32::from(rn) << 5) | u32::from(rt)
}

/// `ldr xt, [xn, #offset]`
#[must_use]
pub fn ldr_x(rt: u8, rn: u8, offset: u32) -> u32 {
    debug_assert!(offset % 8 == 0);
    0xF9400000 | ((offset / 8) << 10) | (u32::from(rn) << 5) | u32::from(rt)
}

/// `str st|dt, [xn, #offset]`
#[must_use]
pub fn str_fp(width: FloatWidth, rt: u8, rn: u8, offset: u32) -> u32 {
    let base = match width {
        FloatWidth::Single => 0xBD000000,
        FloatWidth::Double => 0xFD000000,
    };
    base | ((offset / width.size()) << 10) | (u32::from(rn) << 5) | u32::from(rt)
}

/// `ldr st|dt, [xn, #offset]`
#[must_use]
pub fn ldr_fp(width: FloatWidth, rt: u8, rn: u8, offset: u32) -> u32 {
    let base = match width {
        FloatWidth::Single => 0xBD400000,
        FloatWidth::Double => 0xFD400000,
    };
    base | ((offset / width.size()) << 10) | (u32::from(rn) << 5) | u32::from(rt)
}

/// `ldrb wt, [xn, #offset]`
#[must_use]
pub fn ldrb(rt: u8, rn: u8, offset: u32) -> u32 {
    0x39400000 | (offset << 10) | (u32::from(rn) << 5) | u32::from(rt)
}

/// `strb wt, [xn, #offset]`
#[must_use]
pub fn strb(rt: u8, rn: u8, offset: u32) -> u32 {
    0x39000000 | (offset << 10) | (u32::from(rn) << 5) | u32::from(rt)
}

/// `ldr xt, [xn], #8`
#[must_use]
pub fn ldr_x_post8(rt: u8, rn: u8) -> u32 {
    0xF8408400 | (u32::from(rn) << 5) | u32::from(rt)
}

/// `str xt, [xn], #8`
#[must_use]
pub fn str_x_post8(rt: u8, rn: u8) -> u32 {
    0xF8008400 | (u32::from(rn) << 5) | u32::from(rt)
}

/// `add xd, xn, #imm`
#[must_use]
pub fn add_imm(rd: u8, rn: u8, imm: u32) -> u32 {
    debug_assert!(imm <= MAX_IMM12);
    0x91000000 | (imm << 10) | (u32::from(rn) << 5) | u32::from(rd)
}

/// `sub xd, xn, #imm`
#[must_use]
pub fn sub_imm(rd: u8, rn: u8, imm: u32) -> u32 {
    debug_assert!(imm <= MAX_IMM12);
    0xD1000000 | (imm << 10) | (u32::from(rn) << 5) | u32::from(rd)
}

/// `subs xd, xn, #imm`
#[must_use]
pub fn subs_imm(rd: u8, rn: u8, imm: u32) -> u32 {
    0xF1000000 | (imm << 10) | (u32::from(rn) << 5) | u32::from(rd)
}

/// `mov xd, xm`
#[must_use]
pub fn mov(rd: u8, rm: u8) -> u32 {
    0xAA000000 | (u32::from(rm) << 16) | (u32::from(XZR) << 5) | u32::from(rd)
}

/// `movz xd, #imm, lsl #(16 * shift)`
#[must_use]
pub fn movz(rd: u8, imm: u16, shift: u8) -> u32 {
    0xD2800000 | (u32::from(shift) << 21) | (u32::from(imm) << 5) | u32::from(rd)
}

/// `movk xd, #imm, lsl #(16 * shift)`
#[must_use]
pub fn movk(rd: u8, imm: u16, shift: u8) -> u32 {
    0xF2800000 | (u32::from(shift) << 21) | (u32::from(imm) << 5) | u32::from(rd)
}

/// `b.ne` by `offset` instructions
#[must_use]
pub fn b_ne(offset: i32) -> u32 {
    0x54000001 | (((offset as u32) & 0x7FFFF) << 5)
}

/// `blr xn`
#[must_use]
pub fn blr(rn: u8) -> u32 {
    0xD63F0000 | (u32::from(rn) << 5)
}

/// Load a 64-bit constant, always with four instructions so the size doesn't depend on it
fn mov_imm64(out: &mut dyn Emitter, rd: u8, value: u64) {
    out.emit_word(movz(rd, value as u16, 0));
    for shift in 1..4u8 {
        out.emit_word(movk(rd, (value >> (16 * u32::from(shift))) as u16, shift));
    }
}

/// Copy `size` bytes from `[x9]` to `[x10]`. Both registers are clobbered, along with x11 and x12.
fn copy_bytes(out: &mut dyn Emitter, size: u32) {
    let words = size / 8;
    let tail = size % 8;
    if size <= UNROLLED_COPY_LIMIT {
        for i in 0..words {
            out.emit_word(ldr_x(DATA, SRC, i * 8));
            out.emit_word(str_x(DATA, DST, i * 8));
        }
        for i in words * 8..size {
            out.emit_word(ldrb(DATA, SRC, i));
            out.emit_word(strb(DATA, DST, i));
        }
    } else {
        out.emit_word(movz(COUNT, words as u16, 0));
        out.emit_word(ldr_x_post8(DATA, SRC));
        out.emit_word(str_x_post8(DATA, DST));
        out.emit_word(subs_imm(COUNT, COUNT, 1));
        out.emit_word(b_ne(-3));
        for i in 0..tail {
            out.emit_word(ldrb(DATA, SRC, i));
            out.emit_word(strb(DATA, DST, i));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Move {
    Gpr { reg: u8, to: u32 },
    Fpr { reg: u8, width: FloatWidth, to: u32 },
    StackGpr { from: u32, to: u32 },
    StackFpr { from: u32, width: FloatWidth, to: u32 },
    /// An aggregate passed on the stack
    StackCopy { from: u32, to: u32, size: u32 },
    /// An aggregate passed by a pointer in a register
    CopyFromRegister { reg: u8, to: u32, size: u32 },
    /// An aggregate passed by a pointer on the stack
    CopyFromStack { from: u32, to: u32, size: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aarch64Return {
    /// A homogeneous floating point aggregate, returned in `v0` onwards
    Vector { width: FloatWidth, count: u32 },
    /// Returned in `x0`, or `x0` and `x1`
    Registers { count: u32 },
    /// Copied to the buffer `x8` pointed at
    Memory { size: u32 },
}

#[derive(Debug, Clone)]
pub struct Aarch64Plan {
    pub moves: SmallVec<[Move; 16]>,
    pub frame_size: u32,
    pub struct_return: Option<Aarch64Return>,
}
impl Aarch64Plan {
    /// Offset from the stack pointer to the stack arguments, past the frame and the saved frame
    /// record
    #[must_use]
    pub fn stack_args(&self) -> u32 {
        self.frame_size + 16
    }

    /// Where `x8` is saved over the call
    fn result_location_slot(&self) -> u32 {
        self.frame_size - 8
    }
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
        if size % member == 0 && (1..=4).contains(&count) {
            return Some((width, count));
        }
    }
    None
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Aarch64;
impl ThunkGenerator for Aarch64 {
    type Plan = Aarch64Plan;

    fn plan(&self, signature: &Signature) -> Result<Aarch64Plan, ThunkError> {
        let mut gprs = 0u8;
        let mut fprs = 0u8;
        let mut stack_cursor = 0u32;
        let mut frame_cursor = 0u64;

        let struct_return = match signature.ret {
            SigType::Struct { size, .. } => Some(
                if let Some((width, count)) = homogeneous_aggregate(signature.ret) {
                    Aarch64Return::Vector { width, count }
                } else if size <= 16 {
                    Aarch64Return::Registers {
                        count: size / 8 + u32::from(size % 8 != 0),
                    }
                } else if size / 8 <= u32::from(u16::MAX) {
                    Aarch64Return::Memory { size }
                } else {
                    return Err(ThunkError::UnsupportedSignature("aggregate return too large"));
                },
            ),
            _ => None,
        };

        let mut moves = SmallVec::new();
        for param in signature.params.iter().copied() {
            let to = frame_offset(frame_cursor)?.unsigned_abs();
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
                    if fprs < FPR_PARAM_COUNT {
                        moves.push(Move::Fpr { reg: fprs, width, to });
                        fprs += 1;
                    } else {
                        moves.push(Move::StackFpr {
                            from: stack_cursor,
                            width,
                            to,
                        });
                        stack_cursor += 8;
                    }
                }
                SigType::Struct { size, .. } => {
                    let rounded = frame_offset(param.arg_size())?.unsigned_abs();
                    if let Some((width, count)) = homogeneous_aggregate(param) {
                        if u32::from(fprs) + count <= u32::from(FPR_PARAM_COUNT) {
                            for i in 0..count {
                                moves.push(Move::Fpr {
                                    reg: fprs + i as u8,
                                    width,
                                    to: to + i * width.size(),
                                });
                            }
                            fprs += count as u8;
                        } else {
                            fprs = FPR_PARAM_COUNT;
                            moves.push(Move::StackCopy {
                                from: stack_cursor,
                                to,
                                size,
                            });
                            stack_cursor += rounded;
                        }
                    } else if size > 16 {
                        if gprs < GPR_PARAM_COUNT {
                            moves.push(Move::CopyFromRegister { reg: gprs, to, size });
                            gprs += 1;
                        } else {
                            moves.push(Move::CopyFromStack {
                                from: stack_cursor,
                                to,
                                size,
                            });
                            stack_cursor += 8;
                        }
                    } else {
                        let needed = (rounded / 8) as u8;
                        if gprs + needed <= GPR_PARAM_COUNT {
                            for i in 0..needed {
                                moves.push(Move::Gpr {
                                    reg: gprs + i,
                                    to: to + u32::from(i) * 8,
                                });
                            }
                            gprs += needed;
                        } else {
                            gprs = GPR_PARAM_COUNT;
                            moves.push(Move::StackCopy {
                                from: stack_cursor,
                                to,
                                size,
                            });
                            stack_cursor += rounded;
                        }
                    }
                }
                _ => {
                    if gprs < GPR_PARAM_COUNT {
                        moves.push(Move::Gpr { reg: gprs, to });
                        gprs += 1;
                    } else {
                        moves.push(Move::StackGpr {
                            from: stack_cursor,
                            to,
                        });
                        stack_cursor += 8;
                    }
                }
            }
        }

        let hidden = matches!(struct_return, Some(Aarch64Return::Memory { .. }));
        let frame = frame_cursor + if hidden { 8 } else { 0 };
        let frame_size = round_up(frame_offset(frame)? as usize, 16) as u32;
        if frame_size > MAX_IMM12 {
            return Err(ThunkError::FrameTooLarge {
                size: u64::from(frame_size),
            });
        }
        let furthest = u64::from(frame_size) + 16 + u64::from(stack_cursor);
        if furthest > u64::from(MAX_IMM12) {
            return Err(ThunkError::DisplacementOutOfRange {
                displacement: furthest as i64,
            });
        }

        Ok(Aarch64Plan {
            moves,
            frame_size,
            struct_return,
        })
    }

    fn emit(&self, plan: &Aarch64Plan, metadata: u64, out: &mut dyn Emitter) {
        out.emit_word(STP_FP_LR_PRE);
        out.emit_word(MOV_FP_SP);
        out.emit_word(sub_imm(SP, SP, plan.frame_size));
        let hidden = matches!(plan.struct_return, Some(Aarch64Return::Memory { .. }));
        if hidden {
            out.emit_word(str_x(X8, SP, plan.result_location_slot()));
        }

        let stack_args = plan.stack_args();
        for mv in plan.moves.iter().copied() {
            match mv {
                Move::Gpr { reg, to } => out.emit_word(str_x(reg, SP, to)),
                Move::Fpr { reg, width, to } => out.emit_word(str_fp(width, reg, SP, to)),
                Move::StackGpr { from, to } => {
                    out.emit_word(ldr_x(DATA, SP, stack_args + from));
                    out.emit_word(str_x(DATA, SP, to));
                }
                Move::StackFpr { from, width, to } => {
                    out.emit_word(ldr_fp(width, FP_TEMP, SP, stack_args + from));
                    out.emit_word(str_fp(width, FP_TEMP, SP, to));
                }
                Move::StackCopy { from, to, size } => {
                    out.emit_word(add_imm(SRC, SP, stack_args + from));
                    out.emit_word(add_imm(DST, SP, to));
                    copy_bytes(out, size);
                }
                Move::CopyFromRegister { reg, to, size } => {
                    out.emit_word(mov(SRC, reg));
                    out.emit_word(add_imm(DST, SP, to));
                    copy_bytes(out, size);
                }
                Move::CopyFromStack { from, to, size } => {
                    out.emit_word(ldr_x(SRC, SP, stack_args + from));
                    out.emit_word(add_imm(DST, SP, to));
                    copy_bytes(out, size);
                }
            }
        }

        mov_imm64(out, 0, metadata);
        out.emit_word(add_imm(1, SP, 0));
        out.emit_word(ldr_x(CALL_TARGET, 0, DISPATCHER_OFFSET as u32));
        out.emit_word(blr(CALL_TARGET));

        match plan.struct_return {
            Some(Aarch64Return::Vector { width, count }) => {
                for i in 0..count {
                    out.emit_word(ldr_fp(width, i as u8, 0, i * width.size()));
                }
            }
            Some(Aarch64Return::Registers { count }) => {
                if count == 2 {
                    out.emit_word(ldr_x(1, 0, 8));
                }
                out.emit_word(ldr_x(0, 0, 0));
            }
            Some(Aarch64Return::Memory { size }) => {
                out.emit_word(mov(SRC, 0));
                out.emit_word(ldr_x(DST, SP, plan.result_location_slot()));
                copy_bytes(out, size);
            }
            None => {}
        }

        out.emit_word(add_imm(SP, SP, plan.frame_size));
        out.emit_word(LDP_FP_LR_POST);
        out.emit_word(RET);
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        driver::{generate_with, ThunkGenerator},
        sig::Signature,
        ThunkError,
    };

    use super::{
        add_imm, blr, ldr_x, movk, movz, str_fp, str_x, sub_imm, Aarch64, Aarch64Return,
        FloatWidth, Move, SP,
    };

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_encodings() {
        assert_eq!(str_x(0, SP, 0), 0xF90003E0);
        assert_eq!(ldr_x(16, 0, 8), 0xF9400410);
        assert_eq!(blr(16), 0xD63F0200);
        assert_eq!(sub_imm(SP, SP, 16), 0xD10043FF);
        assert_eq!(add_imm(1, SP, 0), 0x910003E1);
        assert_eq!(str_fp(FloatWidth::Double, 0, SP, 8), 0xFD0007E0);
        assert_eq!(str_fp(FloatWidth::Single, 1, SP, 4), 0xBD0007E1);
        assert_eq!(movz(0, 0x1234, 0), 0xD2824680);
        assert_eq!(movk(0, 0x5678, 1), 0xF2AACF00);
    }

    #[test]
    fn test_homogeneous_aggregates() {
        let sig: Signature = "({12:all-sp},{32:all-dp},{20:all-sp},d)v".parse().unwrap();
        let plan = Aarch64.plan(&sig).unwrap();
        let single = FloatWidth::Single;
        let double = FloatWidth::Double;
        assert_eq!(
            plan.moves.as_slice(),
            &[
                Move::Fpr { reg: 0, width: single, to: 0 },
                Move::Fpr { reg: 1, width: single, to: 4 },
                Move::Fpr { reg: 2, width: single, to: 8 },
                Move::Fpr { reg: 3, width: double, to: 16 },
                Move::Fpr { reg: 4, width: double, to: 24 },
                Move::Fpr { reg: 5, width: double, to: 32 },
                Move::Fpr { reg: 6, width: double, to: 40 },
                // Five floats is too many members, so it is a plain aggregate passed by reference
                Move::CopyFromRegister { reg: 0, to: 48, size: 20 },
                Move::Fpr { reg: 7, width: double, to: 72 },
            ]
        );
    }

    #[test]
    fn test_exhausted_registers() {
        // The last aggregate needs two registers but only one is left, so it goes to the stack
        // and so does the pointer after it
        let sig: Signature = "({16:misc},{16:misc},{16:misc},j,{16:misc},p)v".parse().unwrap();
        let plan = Aarch64.plan(&sig).unwrap();
        assert_eq!(plan.moves[4], Move::Gpr { reg: 4, to: 32 });
        assert_eq!(plan.moves[5], Move::Gpr { reg: 5, to: 40 });
        assert_eq!(plan.moves[6], Move::Gpr { reg: 6, to: 48 });
        assert_eq!(plan.moves[7], Move::StackCopy { from: 0, to: 56, size: 16 });
        assert_eq!(plan.moves[8], Move::StackGpr { from: 16, to: 72 });
        assert_eq!(plan.frame_size, 80);
    }

    #[test]
    fn test_returns() {
        let sig: Signature = "(i){16:all-dp}".parse().unwrap();
        let plan = Aarch64.plan(&sig).unwrap();
        assert_eq!(
            plan.struct_return,
            Some(Aarch64Return::Vector {
                width: FloatWidth::Double,
                count: 2
            })
        );

        let sig: Signature = "(i){72:misc}".parse().unwrap();
        let plan = Aarch64.plan(&sig).unwrap();
        assert_eq!(plan.struct_return, Some(Aarch64Return::Memory { size: 72 }));
        // The argument, then x8
        assert_eq!(plan.frame_size, 16);
        let code = words(&generate_with(&Aarch64, &sig, 0).unwrap());
        assert_eq!(code[3], str_x(8, SP, 8));
        // A 72 byte copy is done with a loop of nine doublewords
        assert!(code.contains(&movz(11, 9, 0)));
        assert_eq!(code[code.len() - 2..], [0xA8C17BFD, 0xD65F03C0]);
    }

    #[test]
    fn test_call_sequence() {
        let sig: Signature = "()v".parse().unwrap();
        let code = words(&generate_with(&Aarch64, &sig, 0x1122_3344_5566_7788).unwrap());
        assert_eq!(
            code,
            [
                0xA9BF7BFD,
                0x910003FD,
                sub_imm(SP, SP, 0),
                movz(0, 0x7788, 0),
                movk(0, 0x5566, 1),
                movk(0, 0x3344, 2),
                movk(0, 0x1122, 3),
                add_imm(1, SP, 0),
                ldr_x(16, 0, 8),
                blr(16),
                add_imm(SP, SP, 0),
                0xA8C17BFD,
                0xD65F03C0,
            ]
        );
    }

    #[test]
    fn test_frame_limit() {
        let sig: Signature = "({5000:misc})v".parse().unwrap();
        assert!(matches!(
            Aarch64.plan(&sig),
            Err(ThunkError::FrameTooLarge { .. })
        ));
    }
}
