//! Thunks for the Windows x64 calling convention.
//!
//! The first four arguments go in `rcx, rdx, r8, r9` or `xmm0-3` by position, so a float in the
//! second position uses `xmm1` and leaves `rdx` unused. Aggregates of 1, 2, 4 or 8 bytes are
//! passed as integers, everything else by a pointer to a copy the caller made. The caller always
//! reserves 32 bytes of stack above the return address for the callee to spill registers to.

use smallvec::SmallVec;

use crate::{
    driver::{Emitter, ThunkGenerator},
    frame_offset,
    sig::{SigType, Signature},
    ThunkError, DISPATCHER_OFFSET,
};

use super::{
    add_rsp, align_frame, call_indirect, copy_to_stack, lea_rsp, load_gpr, load_gpr_from,
    load_xmm, mov_gpr, mov_imm32, mov_imm64, pop, push, rep_movsb, ret, store_gpr, store_xmm,
    sub_rsp, FloatWidth, Gpr, Xmm,
};

pub const GPR_PARAMS: [Gpr; 4] = [Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9];
pub const REGISTER_PARAM_COUNT: usize = 4;
/// Stack that every caller reserves for the callee's register arguments
pub const SHADOW_SPACE: i32 = 32;

/// Whether an aggregate of `size` bytes is passed by value in an integer register (or slot)
#[must_use]
pub fn passed_by_value(size: u32) -> bool {
    matches!(size, 1 | 2 | 4 | 8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Move {
    Gpr { reg: Gpr, to: i32 },
    Xmm { reg: Xmm, width: FloatWidth, to: i32 },
    StackGpr { from: i32, to: i32 },
    StackXmm { from: i32, width: FloatWidth, to: i32 },
    /// Copy an aggregate which the register points at
    CopyFromRegister { reg: Gpr, to: i32, size: i32 },
    /// Copy an aggregate which a pointer on the stack points at
    CopyFromStack { from: i32, to: i32, size: i32 },
}

#[derive(Debug, Clone)]
pub struct Win64Plan {
    pub moves: SmallVec<[Move; 16]>,
    pub frame_size: i32,
    /// Registers pushed in the prologue, in order
    pub pushed: SmallVec<[Gpr; 3]>,
    pub struct_return: Option<Win64Return>,
}
impl Win64Plan {
    #[must_use]
    pub fn stack_args(&self) -> i32 {
        self.frame_size + self.pushed_size() + 8 + SHADOW_SPACE
    }

    fn pushed_size(&self) -> i32 {
        self.pushed.len() as i32 * 8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Win64Return {
    /// Returned in rax
    Register,
    /// Copied to the buffer the caller passed as a hidden first argument
    Memory { size: i32 },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Win64;
impl ThunkGenerator for Win64 {
    type Plan = Win64Plan;

    fn plan(&self, signature: &Signature) -> Result<Win64Plan, ThunkError> {
        let mut position = 0;
        let mut stack_cursor: i32 = 0;
        let mut frame_cursor = u64::from(SHADOW_SPACE.unsigned_abs());
        let mut hidden = false;
        let mut preserve_copy_registers = false;

        let struct_return = match signature.ret {
            SigType::Struct { size, .. } if passed_by_value(size) => Some(Win64Return::Register),
            SigType::Struct { size, .. } => {
                hidden = true;
                preserve_copy_registers = true;
                position += 1;
                Some(Win64Return::Memory {
                    size: frame_offset(u64::from(size))?,
                })
            }
            _ => None,
        };

        let mut moves = SmallVec::new();
        for param in signature.params.iter().copied() {
            let to = frame_offset(frame_cursor)?;
            frame_cursor += param.arg_size();
            let in_register = position < REGISTER_PARAM_COUNT;
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
                    if in_register {
                        moves.push(Move::Xmm {
                            reg: Xmm::ALL[position],
                            width,
                            to,
                        });
                    } else {
                        moves.push(Move::StackXmm {
                            from: stack_cursor,
                            width,
                            to,
                        });
                        stack_cursor += 8;
                    }
                }
                SigType::Struct { size, .. } if !passed_by_value(size) => {
                    let size = frame_offset(u64::from(size))?;
                    preserve_copy_registers = true;
                    if in_register {
                        moves.push(Move::CopyFromRegister {
                            reg: GPR_PARAMS[position],
                            to,
                            size,
                        });
                    } else {
                        moves.push(Move::CopyFromStack {
                            from: stack_cursor,
                            to,
                            size,
                        });
                        stack_cursor += 8;
                    }
                }
                _ => {
                    if in_register {
                        moves.push(Move::Gpr {
                            reg: GPR_PARAMS[position],
                            to,
                        });
                    } else {
                        moves.push(Move::StackGpr {
                            from: stack_cursor,
                            to,
                        });
                        stack_cursor += 8;
                    }
                }
            }
            position += 1;
        }

        let mut pushed = SmallVec::new();
        if hidden {
            pushed.push(Gpr::Rbx);
        }
        // rsi and rdi are callee saved here, and the copies use them
        if preserve_copy_registers {
            pushed.push(Gpr::Rdi);
            pushed.push(Gpr::Rsi);
        }

        let frame = frame_offset(frame_cursor)?;
        let frame_size = align_frame(frame, pushed.len() as i32 * 8);
        // Stack arguments are addressed past the frame and the pushed registers
        frame_offset(
            u64::from(frame_size.unsigned_abs())
                + pushed.len() as u64 * 8
                + 8
                + u64::from(SHADOW_SPACE.unsigned_abs())
                + u64::from(stack_cursor.unsigned_abs()),
        )?;

        Ok(Win64Plan {
            moves,
            frame_size,
            pushed,
            struct_return,
        })
    }

    fn emit(&self, plan: &Win64Plan, metadata: u64, out: &mut dyn Emitter) {
        for reg in plan.pushed.iter().copied() {
            push(out, reg);
        }
        sub_rsp(out, plan.frame_size);
        let hidden = matches!(plan.struct_return, Some(Win64Return::Memory { .. }));
        if hidden {
            mov_gpr(out, Gpr::Rbx, Gpr::Rcx);
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
                // Arguments are moved in order, so an earlier argument in rcx has already been
                // stored when the copy overwrites it
                Move::CopyFromRegister { reg, to, size } => copy_to_stack(out, reg, to, size),
                Move::CopyFromStack { from, to, size } => {
                    load_gpr(out, Gpr::Rsi, stack_args + from);
                    copy_to_stack(out, Gpr::Rsi, to, size);
                }
            }
        }

        mov_imm64(out, Gpr::Rcx, metadata);
        lea_rsp(out, Gpr::Rdx, SHADOW_SPACE);
        call_indirect(out, Gpr::Rcx, DISPATCHER_OFFSET);

        match plan.struct_return {
            Some(Win64Return::Register) => load_gpr_from(out, Gpr::Rax, Gpr::Rax, 0),
            Some(Win64Return::Memory { size }) => {
                mov_gpr(out, Gpr::Rsi, Gpr::Rax);
                mov_gpr(out, Gpr::Rdi, Gpr::Rbx);
                mov_imm32(out, Gpr::Rcx, size);
                rep_movsb(out);
                mov_gpr(out, Gpr::Rax, Gpr::Rbx);
            }
            None => {}
        }

        add_rsp(out, plan.frame_size);
        for reg in plan.pushed.iter().rev().copied() {
            pop(out, reg);
        }
        ret(out);
    }
}
