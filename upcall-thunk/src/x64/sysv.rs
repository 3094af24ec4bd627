//! Thunks for the System V x86-64 calling convention, used by Linux and macOS.
//!
//! Arguments arrive in `rdi, rsi, rdx, rcx, r8, r9` and `xmm0-7`, and then on the stack.
//! Aggregates of up to 16 bytes are split into eightbytes which each go into a general purpose or
//! xmm register depending on what they hold, and larger ones are passed in memory on the stack.

use smallvec::SmallVec;

use crate::{
    driver::{Emitter, ThunkGenerator},
    frame_offset,
    sig::{AggregateShape, SigType, Signature},
    ThunkError, DISPATCHER_OFFSET,
};

use super::{
    add_rsp, align_frame, call_indirect, copy_on_stack, load_gpr, load_gpr_from, load_xmm,
    load_xmm_from, mov_gpr, mov_imm32, mov_imm64, pop, push, rep_movsb, ret, store_gpr,
    store_xmm, sub_rsp, FloatWidth, Gpr, Xmm,
};

pub const GPR_PARAMS: [Gpr; 6] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];
pub const FPR_PARAM_COUNT: usize = 8;

/// How an aggregate is passed or returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructClass {
    /// On the stack, or through a hidden pointer when returned
    Memory,
    OneFpr,
    TwoFpr,
    OneGprOneFpr,
    OneFprOneGpr,
    OneGpr,
    TwoGpr,
}

/// Decide how an aggregate is passed when `gprs` and `fprs` argument registers are already taken.
/// An aggregate which doesn't entirely fit in the remaining registers goes to memory.
#[must_use]
pub fn classify_struct(shape: AggregateShape, size: u32, gprs: usize, fprs: usize) -> StructClass {
    if size > 16 {
        return StructClass::Memory;
    }

    let gpr_fits = |count: usize| gprs + count <= GPR_PARAMS.len();
    let fpr_fits = |count: usize| fprs + count <= FPR_PARAM_COUNT;
    match shape {
        AggregateShape::AllSp | AggregateShape::AllDp => {
            if size <= 8 && fpr_fits(1) {
                StructClass::OneFpr
            } else if size > 8 && fpr_fits(2) {
                StructClass::TwoFpr
            } else {
                StructClass::Memory
            }
        }
        AggregateShape::SpDp
        | AggregateShape::SpSpDp
        | AggregateShape::DpSp
        | AggregateShape::DpSpSp => {
            if fpr_fits(2) {
                StructClass::TwoFpr
            } else {
                StructClass::Memory
            }
        }
        AggregateShape::MiscSp | AggregateShape::MiscDp => {
            if gpr_fits(1) && fpr_fits(1) {
                StructClass::OneGprOneFpr
            } else {
                StructClass::Memory
            }
        }
        AggregateShape::SpMisc | AggregateShape::DpMisc => {
            if gpr_fits(1) && fpr_fits(1) {
                StructClass::OneFprOneGpr
            } else {
                StructClass::Memory
            }
        }
        AggregateShape::Misc => {
            if size <= 8 && gpr_fits(1) {
                StructClass::OneGpr
            } else if size > 8 && gpr_fits(2) {
                StructClass::TwoGpr
            } else {
                StructClass::Memory
            }
        }
        AggregateShape::Other => StructClass::Memory,
    }
}

/// One step of moving the arguments into the argument list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Move {
    /// Store the register at `to` in the argument list
    Gpr { reg: Gpr, to: i32 },
    Xmm { reg: Xmm, width: FloatWidth, to: i32 },
    /// Load an argument from the caller's stack at `from` bytes into the stack arguments, and
    /// store it at `to`
    StackGpr { from: i32, to: i32 },
    StackXmm { from: i32, width: FloatWidth, to: i32 },
    /// Copy an aggregate from the caller's stack
    StackCopy { from: i32, to: i32, size: i32 },
}

#[derive(Debug, Clone)]
pub struct SysvPlan {
    /// Register moves, then the copies (which need `rsi`, `rdi` and `rcx`)
    pub moves: SmallVec<[Move; 16]>,
    pub frame_size: i32,
    /// Bytes of registers saved before the frame is allocated
    pub preserved: i32,
    /// How the value the dispatcher put at `[rax]` is returned, if the return is an aggregate
    pub struct_return: Option<(StructClass, i32)>,
}
impl SysvPlan {
    /// Offset from the stack pointer (after the prologue) to the stack arguments
    #[must_use]
    pub fn stack_args(&self) -> i32 {
        self.frame_size + self.preserved + 8
    }

    #[must_use]
    pub fn hidden_return(&self) -> bool {
        matches!(self.struct_return, Some((StructClass::Memory, _)))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SysV;
impl ThunkGenerator for SysV {
    type Plan = SysvPlan;

    fn plan(&self, signature: &Signature) -> Result<SysvPlan, ThunkError> {
        let mut gprs = 0;
        let mut fprs = 0;
        let mut stack_cursor: i32 = 0;
        let mut frame_cursor: u64 = 0;

        let mut preserved = 0;
        let struct_return = if let SigType::Struct { shape, size } = signature.ret {
            let class = classify_struct(shape, size, 0, 0);
            if class == StructClass::Memory {
                gprs += 1;
                preserved = 8;
            }
            Some((class, frame_offset(u64::from(size))?))
        } else {
            None
        };

        let mut moves = SmallVec::new();
        let mut copies = SmallVec::<[Move; 4]>::new();
        for param in signature.params.iter().copied() {
            let to = frame_offset(frame_cursor)?;
            frame_cursor += param.arg_size();
            match param {
                SigType::Void => {
                    return Err(ThunkError::UnsupportedSignature("void parameter"));
                }
                SigType::Char
                | SigType::Short
                | SigType::Int32
                | SigType::Int64
                | SigType::Pointer => {
                    if gprs < GPR_PARAMS.len() {
                        moves.push(Move::Gpr {
                            reg: GPR_PARAMS[gprs],
                            to,
                        });
                        gprs += 1;
                    } else {
                        moves.push(Move::StackGpr {
                            from: stack_cursor,
                            to,
                        });
                        stack_cursor += 8;
                    }
                }
                SigType::Float | SigType::Double => {
                    let width = if param == SigType::Float {
                        FloatWidth::Single
                    } else {
                        FloatWidth::Double
                    };
                    if fprs < FPR_PARAM_COUNT {
                        moves.push(Move::Xmm {
                            reg: Xmm::ALL[fprs],
                            width,
                            to,
                        });
                        fprs += 1;
                    } else {
                        moves.push(Move::StackXmm {
                            from: stack_cursor,
                            width,
                            to,
                        });
                        stack_cursor += 8;
                    }
                }
                SigType::Struct { shape, size } => {
                    let eightbyte = |index: usize| Xmm::ALL[index];
                    let d = FloatWidth::Double;
                    match classify_struct(shape, size, gprs, fprs) {
                        StructClass::Memory => {
                            let rounded = frame_offset(param.arg_size())?;
                            copies.push(Move::StackCopy {
                                from: stack_cursor,
                                to,
                                size: frame_offset(u64::from(size))?,
                            });
                            stack_cursor += rounded;
                        }
                        StructClass::OneFpr => {
                            moves.push(Move::Xmm { reg: eightbyte(fprs), width: d, to });
                            fprs += 1;
                        }
                        StructClass::TwoFpr => {
                            moves.push(Move::Xmm { reg: eightbyte(fprs), width: d, to });
                            moves.push(Move::Xmm {
                                reg: eightbyte(fprs + 1),
                                width: d,
                                to: to + 8,
                            });
                            fprs += 2;
                        }
                        StructClass::OneGprOneFpr => {
                            moves.push(Move::Gpr { reg: GPR_PARAMS[gprs], to });
                            moves.push(Move::Xmm {
                                reg: eightbyte(fprs),
                                width: d,
                                to: to + 8,
                            });
                            gprs += 1;
                            fprs += 1;
                        }
                        StructClass::OneFprOneGpr => {
                            moves.push(Move::Xmm { reg: eightbyte(fprs), width: d, to });
                            moves.push(Move::Gpr {
                                reg: GPR_PARAMS[gprs],
                                to: to + 8,
                            });
                            gprs += 1;
                            fprs += 1;
                        }
                        StructClass::OneGpr => {
                            moves.push(Move::Gpr { reg: GPR_PARAMS[gprs], to });
                            gprs += 1;
                        }
                        StructClass::TwoGpr => {
                            moves.push(Move::Gpr { reg: GPR_PARAMS[gprs], to });
                            moves.push(Move::Gpr {
                                reg: GPR_PARAMS[gprs + 1],
                                to: to + 8,
                            });
                            gprs += 2;
                        }
                    }
                }
            }
        }
        moves.extend(copies);

        let frame_size = align_frame(frame_offset(signature.arg_list_size())?, preserved);
        // Stack arguments are addressed past the frame
        frame_offset(
            u64::from(frame_size.unsigned_abs()) + u64::from(stack_cursor.unsigned_abs()) + 16,
        )?;

        Ok(SysvPlan {
            moves,
            frame_size,
            preserved,
            struct_return,
        })
    }

    fn emit(&self, plan: &SysvPlan, metadata: u64, out: &mut dyn Emitter) {
        let hidden = plan.hidden_return();
        if hidden {
            push(out, Gpr::Rbx);
        }
        sub_rsp(out, plan.frame_size);
        if hidden {
            mov_gpr(out, Gpr::Rbx, Gpr::Rdi);
        }

        let stack_args = plan.stack_args();
        for mv in plan.moves.iter().copied() {
            match mv {
                Move::Gpr { reg, to } => store_gpr(out, to, reg),
                Move::Xmm { reg, width, to } => store_xmm(out, width, to, reg),
                Move::StackGpr { from, to } => {
                    load_gpr(out, Gpr::Rax, stack_args + from);
                    store_gpr(out, to, Gpr::Rax);
                }
                Move::StackXmm { from, width, to } => {
                    load_xmm(out, width, Xmm::Xmm0, stack_args + from);
                    store_xmm(out, width, to, Xmm::Xmm0);
                }
                Move::StackCopy { from, to, size } => {
                    copy_on_stack(out, stack_args + from, to, size);
                }
            }
        }

        mov_imm64(out, Gpr::Rdi, metadata);
        mov_gpr(out, Gpr::Rsi, Gpr::Rsp);
        call_indirect(out, Gpr::Rdi, DISPATCHER_OFFSET);

        // The aggregate dispatcher returns a pointer to the value in rax
        if let Some((class, size)) = plan.struct_return {
            let d = FloatWidth::Double;
            match class {
                StructClass::Memory => {
                    mov_gpr(out, Gpr::Rsi, Gpr::Rax);
                    mov_gpr(out, Gpr::Rdi, Gpr::Rbx);
                    mov_imm32(out, Gpr::Rcx, size);
                    rep_movsb(out);
                    mov_gpr(out, Gpr::Rax, Gpr::Rbx);
                }
                StructClass::OneFpr => load_xmm_from(out, d, Xmm::Xmm0, Gpr::Rax, 0),
                StructClass::TwoFpr => {
                    load_xmm_from(out, d, Xmm::Xmm0, Gpr::Rax, 0);
                    load_xmm_from(out, d, Xmm::Xmm1, Gpr::Rax, 8);
                }
                StructClass::OneGprOneFpr => {
                    load_xmm_from(out, d, Xmm::Xmm0, Gpr::Rax, 8);
                    load_gpr_from(out, Gpr::Rax, Gpr::Rax, 0);
                }
                StructClass::OneFprOneGpr => {
                    load_xmm_from(out, d, Xmm::Xmm0, Gpr::Rax, 0);
                    load_gpr_from(out, Gpr::Rax, Gpr::Rax, 8);
                }
                StructClass::OneGpr => load_gpr_from(out, Gpr::Rax, Gpr::Rax, 0),
                StructClass::TwoGpr => {
                    load_gpr_from(out, Gpr::Rdx, Gpr::Rax, 8);
                    load_gpr_from(out, Gpr::Rax, Gpr::Rax, 0);
                }
            }
        }

        add_rsp(out, plan.frame_size);
        if hidden {
            pop(out, Gpr::Rbx);
        }
        ret(out);
    }
}
