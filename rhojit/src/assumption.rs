//! Runtime assumptions: a record of a place in generated code which is only correct while some
//! fact about the running program holds, and how to patch it once that fact stops holding.

use rhojit_base::id::{BodyId, ClassId, MethodId};
use smallvec::SmallVec;

use crate::code_memory::{displacement, fits_signed, u32_at, u64_at, CodeMemory, CodePatchError};

/// What event an assumption is waiting on.
/// Each kind has its own hash table inside of the assumption table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeAssumptionKind {
    ClassUnload,
    ClassPreInitialize,
    ClassExtend,
    MethodOverride,
    RegisterNative,
    /// Resolved PIC site holding a class pointer
    ClassRedefinitionPic,
    /// Unresolved PIC site, which is found by what it currently holds rather than its key
    ClassRedefinitionUpic,
    ClassRedefinitionNop,
    StaticFinalFieldModification,
    MutableCallSiteChange,
    MethodBreakpoint,
    JProfilingValue,
}
impl RuntimeAssumptionKind {
    pub const COUNT: usize = 12;
    pub const ALL: [RuntimeAssumptionKind; RuntimeAssumptionKind::COUNT] = [
        RuntimeAssumptionKind::ClassUnload,
        RuntimeAssumptionKind::ClassPreInitialize,
        RuntimeAssumptionKind::ClassExtend,
        RuntimeAssumptionKind::MethodOverride,
        RuntimeAssumptionKind::RegisterNative,
        RuntimeAssumptionKind::ClassRedefinitionPic,
        RuntimeAssumptionKind::ClassRedefinitionUpic,
        RuntimeAssumptionKind::ClassRedefinitionNop,
        RuntimeAssumptionKind::StaticFinalFieldModification,
        RuntimeAssumptionKind::MutableCallSiteChange,
        RuntimeAssumptionKind::MethodBreakpoint,
        RuntimeAssumptionKind::JProfilingValue,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            RuntimeAssumptionKind::ClassUnload => "ClassUnload",
            RuntimeAssumptionKind::ClassPreInitialize => "ClassPreInitialize",
            RuntimeAssumptionKind::ClassExtend => "ClassExtend",
            RuntimeAssumptionKind::MethodOverride => "MethodOverride",
            RuntimeAssumptionKind::RegisterNative => "RegisterNative",
            RuntimeAssumptionKind::ClassRedefinitionPic => "ClassRedefinitionPIC",
            RuntimeAssumptionKind::ClassRedefinitionUpic => "ClassRedefinitionUPIC",
            RuntimeAssumptionKind::ClassRedefinitionNop => "ClassRedefinitionNOP",
            RuntimeAssumptionKind::StaticFinalFieldModification => "StaticFinalFieldModification",
            RuntimeAssumptionKind::MutableCallSiteChange => "MutableCallSiteChange",
            RuntimeAssumptionKind::MethodBreakpoint => "MethodBreakpoint",
            RuntimeAssumptionKind::JProfilingValue => "JProfilingValue",
        }
    }

    /// Whether assumptions of this kind may outlive the body they were made for, since they
    /// are attached to persistent method information rather than the code itself
    #[must_use]
    pub fn is_redefinition(self) -> bool {
        matches!(
            self,
            RuntimeAssumptionKind::ClassRedefinitionPic
                | RuntimeAssumptionKind::ClassRedefinitionUpic
                | RuntimeAssumptionKind::ClassRedefinitionNop
        )
    }
}

/// The architecture that generated code is encoded for.
/// All targets are little endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchTarget {
    X86_64,
    Aarch64,
    Ppc64,
}
impl PatchTarget {
    #[must_use]
    pub fn host() -> PatchTarget {
        if cfg!(target_arch = "aarch64") {
            PatchTarget::Aarch64
        } else if cfg!(target_arch = "powerpc64") {
            PatchTarget::Ppc64
        } else {
            PatchTarget::X86_64
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<PatchTarget> {
        match name {
            "x86_64" | "x86-64" | "amd64" => Some(PatchTarget::X86_64),
            "aarch64" | "arm64" => Some(PatchTarget::Aarch64),
            "ppc64" | "ppc64le" | "powerpc64" => Some(PatchTarget::Ppc64),
            _ => None,
        }
    }

    /// Encode an unconditional jump at `from` to `to`
    pub fn encode_jump(
        self,
        from: usize,
        to: usize,
    ) -> Result<SmallVec<[u8; 8]>, CodePatchError> {
        let mut out = SmallVec::new();
        match self {
            PatchTarget::X86_64 => {
                let short = displacement(from + 2, to);
                if fits_signed(short, 8) {
                    out.push(0xEB);
                    // Checked to fit above
                    #[allow(clippy::cast_possible_truncation)]
                    out.push(short as i8 as u8);
                } else {
                    let near = displacement(from + 5, to);
                    if !fits_signed(near, 32) {
                        return Err(CodePatchError::BranchOutOfRange { from, to });
                    }
                    out.push(0xE9);
                    #[allow(clippy::cast_possible_truncation)]
                    out.extend_from_slice(&(near as i32).to_le_bytes());
                }
            }
            PatchTarget::Aarch64 => {
                let disp = displacement(from, to);
                if disp & 0b11 != 0 {
                    return Err(CodePatchError::MisalignedBranch { from, to });
                }
                if !fits_signed(disp, 28) {
                    return Err(CodePatchError::BranchOutOfRange { from, to });
                }
                // b imm26
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let word = 0x1400_0000 | (((disp >> 2) as u32) & 0x03FF_FFFF);
                out.extend_from_slice(&word.to_le_bytes());
            }
            PatchTarget::Ppc64 => {
                let disp = displacement(from, to);
                if disp & 0b11 != 0 {
                    return Err(CodePatchError::MisalignedBranch { from, to });
                }
                if !fits_signed(disp, 26) {
                    return Err(CodePatchError::BranchOutOfRange { from, to });
                }
                // b LI, with AA=0 LK=0
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let word = 0x4800_0000 | ((disp as u32) & 0x03FF_FFFC);
                out.extend_from_slice(&word.to_le_bytes());
            }
        }

        Ok(out)
    }

    /// Number of bytes at an unresolved PIC site that make up the address materialization
    /// sequence
    #[must_use]
    pub fn materialization_len(self) -> u32 {
        match self {
            // REX.W MOV r64, imm64
            PatchTarget::X86_64 => 10,
            // movz, movk, movk, movk
            PatchTarget::Aarch64 => 16,
            // lis, ori, rldicr, oris, ori
            PatchTarget::Ppc64 => 20,
        }
    }

    /// Decode the address that the materialization sequence in `code` loads.
    /// `None` if the bytes are not a sequence this target emits.
    #[must_use]
    pub fn decode_materialization(self, code: &[u8]) -> Option<u64> {
        match self {
            PatchTarget::X86_64 => {
                let rex = *code.first()?;
                let mov = *code.get(1)?;
                if (rex & 0xF0) == 0x40 && (mov & 0xF8) == 0xB8 {
                    u64_at(code, 2)
                } else {
                    None
                }
            }
            PatchTarget::Aarch64 => {
                let first = u32_at(code, 0)?;
                let reg = first & 0x1F;
                let mut value = 0u64;
                for hw in 0..4u32 {
                    let word = u32_at(code, (hw * 4) as usize)?;
                    let opcode = if hw == 0 { 0xD280_0000 } else { 0xF280_0000 };
                    let is_expected = (word & 0xFF80_0000) == opcode
                        && ((word >> 21) & 0b11) == hw
                        && (word & 0x1F) == reg;
                    if !is_expected {
                        return None;
                    }
                    value |= u64::from((word >> 5) & 0xFFFF) << (16 * hw);
                }
                Some(value)
            }
            PatchTarget::Ppc64 => {
                let lis = u32_at(code, 0)?;
                let ori = u32_at(code, 4)?;
                let rldicr = u32_at(code, 8)?;
                let oris = u32_at(code, 12)?;
                let ori2 = u32_at(code, 16)?;
                let is_expected = (lis >> 26) == 0x0F
                    && (ori >> 26) == 0x18
                    && (rldicr >> 26) == 0x1E
                    && (oris >> 26) == 0x19
                    && (ori2 >> 26) == 0x18;
                if !is_expected {
                    return None;
                }
                Some(
                    (u64::from(lis & 0xFFFF) << 48)
                        | (u64::from(ori & 0xFFFF) << 32)
                        | (u64::from(oris & 0xFFFF) << 16)
                        | u64::from(ori2 & 0xFFFF),
                )
            }
        }
    }

    /// Replace the address loaded by a materialization sequence that [`decode_materialization`]
    /// accepted, keeping the registers and opcodes.
    ///
    /// [`decode_materialization`]: PatchTarget::decode_materialization
    pub fn encode_materialization(self, code: &mut [u8], value: u64) {
        match self {
            PatchTarget::X86_64 => code[2..10].copy_from_slice(&value.to_le_bytes()),
            PatchTarget::Aarch64 => {
                for hw in 0..4usize {
                    let offset = hw * 4;
                    let word = u32_at(code, offset).unwrap_or(0);
                    // Masked to sixteen bits
                    #[allow(clippy::cast_possible_truncation)]
                    let piece = ((value >> (16 * hw)) & 0xFFFF) as u32;
                    let word = (word & !(0xFFFF << 5)) | (piece << 5);
                    code[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
                }
            }
            PatchTarget::Ppc64 => {
                #[allow(clippy::cast_possible_truncation)]
                let pieces = [
                    (0, (value >> 48) as u32),
                    (4, ((value >> 32) & 0xFFFF) as u32),
                    (12, ((value >> 16) & 0xFFFF) as u32),
                    (16, (value & 0xFFFF) as u32),
                ];
                for (offset, piece) in pieces {
                    let word = (u32_at(code, offset).unwrap_or(0) & 0xFFFF_0000) | piece;
                    code[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
                }
            }
        }
    }
}

/// Where and how an assumption patches code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchSite {
    /// A PIC slot caching a class, which is invalidated (with `-1`) once the class is unloaded
    UnloadedClassPic {
        location: usize,
        width: u8,
        pic_value: usize,
    },
    /// A PIC slot caching a class, rewritten to the replacement class on redefinition
    RedefinedClassPic { location: usize, width: u8 },
    /// Code that holds a class pointer it may have resolved at runtime.
    /// `materialization` is whether that is a load immediate instruction sequence rather than a
    /// plain data word.
    RedefinedClassUpic {
        location: usize,
        materialization: bool,
    },
    /// A guard emitted as a nop, which is patched into a jump to `destination`
    NopGuard { location: usize, destination: usize },
    /// A call to a native method, patched to the registered address
    JniCallSite { location: usize },
    /// Compensated by recompiling the body starting at `start_pc`
    Recompile { start_pc: usize },
    /// A JProfiling value site, which jumps to its profiling code once patched
    ProfilingValue {
        location: usize,
        destination: usize,
        signature: Box<[u8]>,
    },
}
impl PatchSite {
    /// The first pc this site patches, used to decide which body it belongs to
    #[must_use]
    pub fn assuming_pc(&self) -> usize {
        match self {
            PatchSite::UnloadedClassPic { location, .. }
            | PatchSite::RedefinedClassPic { location, .. }
            | PatchSite::RedefinedClassUpic { location, .. }
            | PatchSite::NopGuard { location, .. }
            | PatchSite::JniCallSite { location }
            | PatchSite::ProfilingValue { location, .. } => *location,
            PatchSite::Recompile { start_pc } => *start_pc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeAssumption {
    kind: RuntimeAssumptionKind,
    key: usize,
    site: PatchSite,
}
impl RuntimeAssumption {
    #[must_use]
    pub fn new(kind: RuntimeAssumptionKind, key: usize, site: PatchSite) -> RuntimeAssumption {
        debug_assert!(
            site_fits_kind(kind, &site),
            "{:?} can't be used for a {} assumption",
            site,
            kind.name()
        );
        RuntimeAssumption { kind, key, site }
    }

    /// A PIC slot which caches `pic_value` on behalf of `assuming`
    #[must_use]
    pub fn unloaded_class_pic(
        assuming: ClassId,
        location: usize,
        width: u8,
        pic_value: usize,
    ) -> RuntimeAssumption {
        RuntimeAssumption::new(
            RuntimeAssumptionKind::ClassUnload,
            assuming.get(),
            PatchSite::UnloadedClassPic {
                location,
                width,
                pic_value,
            },
        )
    }

    #[must_use]
    pub fn redefined_class_pic(class: ClassId, location: usize, width: u8) -> RuntimeAssumption {
        RuntimeAssumption::new(
            RuntimeAssumptionKind::ClassRedefinitionPic,
            class.get(),
            PatchSite::RedefinedClassPic { location, width },
        )
    }

    #[must_use]
    pub fn redefined_class_upic(
        key: usize,
        location: usize,
        materialization: bool,
    ) -> RuntimeAssumption {
        RuntimeAssumption::new(
            RuntimeAssumptionKind::ClassRedefinitionUpic,
            key,
            PatchSite::RedefinedClassUpic {
                location,
                materialization,
            },
        )
    }

    /// A nop guard for a kind whose sites are all nop guards
    #[must_use]
    pub fn nop_guard(
        kind: RuntimeAssumptionKind,
        key: usize,
        location: usize,
        destination: usize,
    ) -> RuntimeAssumption {
        RuntimeAssumption::new(
            kind,
            key,
            PatchSite::NopGuard {
                location,
                destination,
            },
        )
    }

    /// Recompile the body at `start_pc` once `class` is extended
    #[must_use]
    pub fn recompile_on_class_extend(class: ClassId, start_pc: usize) -> RuntimeAssumption {
        RuntimeAssumption::new(
            RuntimeAssumptionKind::ClassExtend,
            class.get(),
            PatchSite::Recompile { start_pc },
        )
    }

    /// Recompile the body at `start_pc` once `method` is overridden
    #[must_use]
    pub fn recompile_on_method_override(method: MethodId, start_pc: usize) -> RuntimeAssumption {
        RuntimeAssumption::new(
            RuntimeAssumptionKind::MethodOverride,
            method.get(),
            PatchSite::Recompile { start_pc },
        )
    }

    #[must_use]
    pub fn register_native(method: MethodId, location: usize) -> RuntimeAssumption {
        RuntimeAssumption::new(
            RuntimeAssumptionKind::RegisterNative,
            method.get(),
            PatchSite::JniCallSite { location },
        )
    }

    #[must_use]
    pub fn profiling_value(
        key: usize,
        location: usize,
        destination: usize,
        signature: Box<[u8]>,
    ) -> RuntimeAssumption {
        RuntimeAssumption::new(
            RuntimeAssumptionKind::JProfilingValue,
            key,
            PatchSite::ProfilingValue {
                location,
                destination,
                signature,
            },
        )
    }

    #[must_use]
    pub fn kind(&self) -> RuntimeAssumptionKind {
        self.kind
    }

    #[must_use]
    pub fn key(&self) -> usize {
        self.key
    }

    pub(crate) fn set_key(&mut self, key: usize) {
        self.key = key;
    }

    #[must_use]
    pub fn site(&self) -> &PatchSite {
        &self.site
    }

    #[must_use]
    pub fn matches(&self, key: usize) -> bool {
        self.key == key
    }

    /// Patch the code so that it no longer relies on this assumption.
    /// `value` is the replacement for sites which are rewritten to a new value (the new class of
    /// a redefinition, the address of a registered native) and is otherwise ignored.
    pub fn compensate(
        &self,
        target: PatchTarget,
        code: &mut dyn CodeMemory,
        value: Option<usize>,
    ) -> Result<(), CodePatchError> {
        tracing::trace!(
            "Compensating {} assumption key={:#x} at {:#x}",
            self.kind.name(),
            self.key,
            self.site.assuming_pc()
        );

        match &self.site {
            PatchSite::UnloadedClassPic {
                location, width, ..
            } => match target {
                PatchTarget::X86_64 | PatchTarget::Aarch64 => {
                    code.write_sized(*location, *width, u64::MAX)
                }
                PatchTarget::Ppc64 => {
                    // Always a single instruction word, regardless of the slot width
                    let word = code.read_u32(*location)?;
                    code.write_u32(*location, word | 1)
                }
            },
            PatchSite::RedefinedClassPic { location, width } => {
                let value = value.unwrap_or(0) as u64;
                code.write_sized(*location, *width, value)
            }
            // These are rewritten by scanning for the old class, not by their key
            PatchSite::RedefinedClassUpic { .. } => Ok(()),
            PatchSite::NopGuard {
                location,
                destination,
            }
            | PatchSite::ProfilingValue {
                location,
                destination,
                ..
            } => {
                let jump = target.encode_jump(*location, *destination)?;
                code.write_bytes(*location, &jump)
            }
            PatchSite::JniCallSite { location } => {
                code.write_u64(*location, value.unwrap_or(0) as u64)
            }
            PatchSite::Recompile { start_pc } => code.induce_recompilation(*start_pc),
        }
    }
}

fn site_fits_kind(kind: RuntimeAssumptionKind, site: &PatchSite) -> bool {
    match site {
        PatchSite::UnloadedClassPic { .. } => kind == RuntimeAssumptionKind::ClassUnload,
        PatchSite::RedefinedClassPic { .. } => kind == RuntimeAssumptionKind::ClassRedefinitionPic,
        PatchSite::RedefinedClassUpic { .. } => {
            kind == RuntimeAssumptionKind::ClassRedefinitionUpic
        }
        PatchSite::JniCallSite { .. } => kind == RuntimeAssumptionKind::RegisterNative,
        PatchSite::ProfilingValue { .. } => kind == RuntimeAssumptionKind::JProfilingValue,
        PatchSite::Recompile { .. } => matches!(
            kind,
            RuntimeAssumptionKind::ClassExtend
                | RuntimeAssumptionKind::MethodOverride
                | RuntimeAssumptionKind::ClassPreInitialize
        ),
        PatchSite::NopGuard { .. } => matches!(
            kind,
            RuntimeAssumptionKind::ClassExtend
                | RuntimeAssumptionKind::MethodOverride
                | RuntimeAssumptionKind::ClassPreInitialize
                | RuntimeAssumptionKind::ClassRedefinitionNop
                | RuntimeAssumptionKind::StaticFinalFieldModification
                | RuntimeAssumptionKind::MutableCallSiteChange
                | RuntimeAssumptionKind::MethodBreakpoint
        ),
    }
}

/// The address ranges that belong to one compiled body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyRange {
    pub body: BodyId,
    /// Start of the code cache allocation, which includes the pre-prologue
    pub allocation_start: usize,
    /// The interpreter entry point
    pub start_pc: usize,
    pub end_warm_pc: usize,
    /// `(start_cold_pc, end_pc)` if the body has a cold section
    pub cold: Option<(usize, usize)>,
    pub metadata_start: usize,
    pub metadata_end: usize,
}
impl BodyRange {
    /// Whether an assumption patching `pc` belongs to this body.
    /// Pre-prologue pcs are only included when `reclaim_pre_prologue` is set, which is the case
    /// when the body is going away because its class was unloaded.
    #[must_use]
    pub fn is_assuming(&self, pc: usize, reclaim_pre_prologue: bool) -> bool {
        let start = if reclaim_pre_prologue {
            self.allocation_start
        } else {
            self.start_pc
        };
        let in_range = |start: usize, end: usize| start <= pc && pc < end;

        in_range(start, self.end_warm_pc)
            || self.cold.map_or(false, |(start, end)| in_range(start, end))
            || in_range(self.metadata_start, self.metadata_end)
    }
}

#[cfg(test)]
mod tests {
    use rhojit_base::id::{BodyId, ClassId};

    use crate::code_memory::{BufferCodeMemory, CodeMemory, CodePatchError};

    use super::{BodyRange, PatchTarget, RuntimeAssumption, RuntimeAssumptionKind};

    #[test]
    fn test_jump_encodings() {
        let x86 = PatchTarget::X86_64;
        assert_eq!(x86.encode_jump(0x1000, 0x1010).unwrap().as_slice(), &[0xEB, 0x0E]);
        assert_eq!(
            x86.encode_jump(0x1000, 0x2000).unwrap().as_slice(),
            &[0xE9, 0xFB, 0x0F, 0x00, 0x00]
        );
        // Backwards short jump to itself
        assert_eq!(x86.encode_jump(0x1000, 0x1000).unwrap().as_slice(), &[0xEB, 0xFE]);

        let arm = PatchTarget::Aarch64;
        assert_eq!(
            arm.encode_jump(0x1000, 0x1010).unwrap().as_slice(),
            &0x1400_0004u32.to_le_bytes()
        );
        assert_eq!(
            arm.encode_jump(0x1010, 0x1000).unwrap().as_slice(),
            &0x17FF_FFFCu32.to_le_bytes()
        );
        assert!(matches!(
            arm.encode_jump(0x1000, 0x1002),
            Err(CodePatchError::MisalignedBranch { .. })
        ));
        assert!(matches!(
            arm.encode_jump(0, 1 << 28),
            Err(CodePatchError::BranchOutOfRange { .. })
        ));

        let ppc = PatchTarget::Ppc64;
        assert_eq!(
            ppc.encode_jump(0x1000, 0x1010).unwrap().as_slice(),
            &0x4800_0010u32.to_le_bytes()
        );
        assert!(matches!(
            ppc.encode_jump(0, 1 << 26),
            Err(CodePatchError::BranchOutOfRange { .. })
        ));
    }

    #[test]
    fn test_unloaded_pic_compensation() {
        let class = ClassId::new_unchecked(0x8000);
        let mut mem = BufferCodeMemory::new(0x1000, 32);

        let a = RuntimeAssumption::unloaded_class_pic(class, 0x1000, 4, 0x9000);
        a.compensate(PatchTarget::X86_64, &mut mem, None).unwrap();
        assert_eq!(mem.read_u32(0x1000), Ok(u32::MAX));
        assert_eq!(mem.read_u32(0x1004), Ok(0));

        let a = RuntimeAssumption::unloaded_class_pic(class, 0x1008, 8, 0x9000);
        a.compensate(PatchTarget::Aarch64, &mut mem, None).unwrap();
        assert_eq!(mem.read_u64(0x1008), Ok(u64::MAX));

        mem.write_u32(0x1010, 0x3860_0000).unwrap();
        let a = RuntimeAssumption::unloaded_class_pic(class, 0x1010, 8, 0x9000);
        a.compensate(PatchTarget::Ppc64, &mut mem, None).unwrap();
        assert_eq!(mem.read_u32(0x1010), Ok(0x3860_0001));
        assert_eq!(mem.read_u32(0x1014), Ok(0));
    }

    #[test]
    fn test_recompile_compensation() {
        let mut mem = BufferCodeMemory::new(0x1000, 32);
        let a = RuntimeAssumption::recompile_on_class_extend(ClassId::new_unchecked(0x40), 0x1000);
        assert_eq!(a.kind(), RuntimeAssumptionKind::ClassExtend);
        a.compensate(PatchTarget::X86_64, &mut mem, None).unwrap();
        assert_eq!(mem.recompilations(), &[0x1000]);
        assert!(mem.bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_materialization_patterns() {
        // mov rax, 0x1122334455667788
        let mut x86 = vec![0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11];
        assert_eq!(
            PatchTarget::X86_64.decode_materialization(&x86),
            Some(0x1122_3344_5566_7788)
        );
        PatchTarget::X86_64.encode_materialization(&mut x86, 0xAABB);
        assert_eq!(PatchTarget::X86_64.decode_materialization(&x86), Some(0xAABB));
        // Not a mov
        assert_eq!(PatchTarget::X86_64.decode_materialization(&[0x48, 0x89, 0, 0]), None);

        // movz x3, #0x7788; movk x3, #0x5566, lsl 16; movk x3, #0x3344, lsl 32;
        // movk x3, #0x1122, lsl 48
        let words: [u32; 4] = [
            0xD280_0000 | (0x7788 << 5) | 3,
            0xF2A0_0000 | (0x5566 << 5) | 3,
            0xF2C0_0000 | (0x3344 << 5) | 3,
            0xF2E0_0000 | (0x1122 << 5) | 3,
        ];
        let mut arm: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        assert_eq!(
            PatchTarget::Aarch64.decode_materialization(&arm),
            Some(0x1122_3344_5566_7788)
        );
        PatchTarget::Aarch64.encode_materialization(&mut arm, 0xDEAD_BEEF_0000_1234);
        assert_eq!(
            PatchTarget::Aarch64.decode_materialization(&arm),
            Some(0xDEAD_BEEF_0000_1234)
        );
        assert_eq!(arm[0] & 0x1F, 3);

        // lis r3, 0x1122; ori r3, r3, 0x3344; rldicr r3, r3, 32, 31; oris r3, r3, 0x5566;
        // ori r3, r3, 0x7788
        let words: [u32; 5] = [
            0x3C60_1122,
            0x6063_3344,
            0x7863_07C6,
            0x6463_5566,
            0x6063_7788,
        ];
        let mut ppc: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        assert_eq!(
            PatchTarget::Ppc64.decode_materialization(&ppc),
            Some(0x1122_3344_5566_7788)
        );
        PatchTarget::Ppc64.encode_materialization(&mut ppc, 0x0102_0304_0506_0708);
        assert_eq!(
            PatchTarget::Ppc64.decode_materialization(&ppc),
            Some(0x0102_0304_0506_0708)
        );
        // The rldicr is left alone
        assert_eq!(&ppc[8..12], &0x7863_07C6u32.to_le_bytes());
    }

    #[test]
    fn test_body_range() {
        let body = BodyRange {
            body: BodyId::new_unchecked(0x5000),
            allocation_start: 0x1000,
            start_pc: 0x1020,
            end_warm_pc: 0x1100,
            cold: Some((0x2000, 0x2100)),
            metadata_start: 0x5000,
            metadata_end: 0x5100,
        };
        assert!(body.is_assuming(0x1020, false));
        assert!(!body.is_assuming(0x1010, false));
        assert!(body.is_assuming(0x1010, true));
        assert!(!body.is_assuming(0x1100, false));
        assert!(body.is_assuming(0x20FF, false));
        assert!(body.is_assuming(0x5008, false));
        assert!(!body.is_assuming(0x9000, true));
    }
}
