use rhojit_base::{
    id::{CpIndex, MethodId, OwningMethodIndex, SymRefNumber},
    types::DataType,
};

use super::{
    oracle::{ConstantKind, MethodKind, RecognizedField},
    SymbolTableError,
};

bitflags::bitflags! {
    pub struct SymbolFlags: u32 {
        const VOLATILE = 1 << 0;
        const PRIVATE = 1 << 1;
        const FINAL = 1 << 2;
        /// Accessed through `sun/misc/Unsafe`, may alias anything of its type
        const UNSAFE = 1 << 3;
        const ARRAY_SHADOW = 1 << 4;
        /// Has a qualified name, usually because it was fabricated
        const NAMED = 1 << 5;
        const CONST_STRING = 1 << 6;
        const CONST_METHOD_TYPE = 1 << 7;
        const CONST_METHOD_HANDLE = 1 << 8;
        const CONSTANT_DYNAMIC = 1 << 9;
        const CALL_SITE_TABLE_ENTRY = 1 << 10;
        const METHOD_TYPE_TABLE_ENTRY = 1 << 11;
        /// A generic int shadow, which is used for raw accesses into objects
        const GENERIC_INT_SHADOW = 1 << 12;
        /// Primitive constant dynamic values are boxed
        const CONSTANT_DYNAMIC_PRIMITIVE = 1 << 13;
    }
}

/// Fold the flags of a new reference into the flags of the symbol it is going to share.
///
/// The result is never less restrictive than `existing`: volatility can be gained but never lost,
/// while privacy and finality are only kept if both sides agree on them.
/// This means that a symbol first created for an unresolved field (which is assumed volatile)
/// stays volatile even once a resolved reference shows that the field isn't.
#[must_use]
pub fn merge_conservative(existing: SymbolFlags, incoming: SymbolFlags) -> SymbolFlags {
    let mut merged = existing;
    if incoming.contains(SymbolFlags::VOLATILE) {
        merged.insert(SymbolFlags::VOLATILE);
    }
    if !incoming.contains(SymbolFlags::PRIVATE) {
        merged.remove(SymbolFlags::PRIVATE);
    }
    if !incoming.contains(SymbolFlags::FINAL) {
        merged.remove(SymbolFlags::FINAL);
    }
    merged
}

/// Identity of a runtime helper routine that compiled code calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeHelper {
    MethodMonitorEntry,
    MethodMonitorExit,
    ThrowCurrentException,
    StackOverflow,
    WriteBarrierStore,
    WriteBarrierStoreGenerational,
    TypeCheckArrayStore,
    ANewArray,
    MultiANewArray,
    ReportMethodEnter,
    ReportMethodExit,
    AcquireVmAccess,
    ReleaseVmAccess,
    IncompatibleReceiver,
    IncompatibleClassChangeError,
    MethodTypeCheck,
    InvokeExactJ2IThunk,
}

/// Runtime structures that compiled code reads directly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnown {
    CountForRecompile,
    CurrentThread,
    ConstantPoolAddress,
    ClassFlags,
    ClassAndDepthFlags,
    ArrayComponentType,
    ClassRomPtr,
    InitializeStatusFromClass,
    JavaLangClassFromClass,
    ClassFromJavaLangClass,
    HeaderFlags,
    DiscontiguousArraySize,
    OsrBuffer,
    OsrScratchBuffer,
    OsrFrameIndex,
}
impl WellKnown {
    #[must_use]
    pub fn data_type(self) -> DataType {
        match self {
            WellKnown::CountForRecompile
            | WellKnown::ClassFlags
            | WellKnown::InitializeStatusFromClass
            | WellKnown::HeaderFlags
            | WellKnown::DiscontiguousArraySize
            | WellKnown::OsrFrameIndex => DataType::Int32,
            WellKnown::ClassAndDepthFlags => DataType::Int64,
            WellKnown::CurrentThread
            | WellKnown::ConstantPoolAddress
            | WellKnown::ArrayComponentType
            | WellKnown::ClassRomPtr
            | WellKnown::JavaLangClassFromClass
            | WellKnown::ClassFromJavaLangClass
            | WellKnown::OsrBuffer
            | WellKnown::OsrScratchBuffer => DataType::Address,
        }
    }

    /// Whether the value lives at a fixed address rather than inside of some object
    #[must_use]
    pub fn is_static(self) -> bool {
        matches!(
            self,
            WellKnown::CountForRecompile
                | WellKnown::CurrentThread
                | WellKnown::OsrBuffer
                | WellKnown::OsrScratchBuffer
                | WellKnown::OsrFrameIndex
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolKind {
    /// An instance field, or an element of an array
    Shadow,
    /// `address` is `None` until resolved
    Static { address: Option<usize> },
    Method {
        method: Option<MethodId>,
        kind: MethodKind,
    },
    Helper(RuntimeHelper),
    Constant {
        kind: ConstantKind,
        address: Option<usize>,
    },
}

/// A runtime entity that compiled code refers to.
/// Symbols may be shared between several symbol references.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub data_type: DataType,
    pub kind: SymbolKind,
    pub flags: SymbolFlags,
    pub recognized_field: Option<RecognizedField>,
    /// Qualified name of a fabricated field, like `java/lang/String.value [B`
    pub name: Option<String>,
}
impl Symbol {
    #[must_use]
    pub fn new(data_type: DataType, kind: SymbolKind, flags: SymbolFlags) -> Symbol {
        Symbol {
            data_type,
            kind,
            flags,
            recognized_field: None,
            name: None,
        }
    }

    #[must_use]
    pub fn is_shadow(&self) -> bool {
        matches!(self.kind, SymbolKind::Shadow)
    }

    #[must_use]
    pub fn is_static(&self) -> bool {
        matches!(self.kind, SymbolKind::Static { .. })
    }

    #[must_use]
    pub fn is_method(&self) -> bool {
        matches!(self.kind, SymbolKind::Method { .. })
    }

    #[must_use]
    pub fn is_volatile(&self) -> bool {
        self.flags.contains(SymbolFlags::VOLATILE)
    }

    #[must_use]
    pub fn is_private(&self) -> bool {
        self.flags.contains(SymbolFlags::PRIVATE)
    }

    #[must_use]
    pub fn is_final(&self) -> bool {
        self.flags.contains(SymbolFlags::FINAL)
    }

    #[must_use]
    pub fn is_array_shadow(&self) -> bool {
        self.flags.contains(SymbolFlags::ARRAY_SHADOW)
    }
}

/// Index of a [`Symbol`] inside of its table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub(crate) u32);

/// Whether a symbol reference can be accessed while the compiled code runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeAccess {
    No,
    Maybe,
}

/// One use of a symbol by compiled code
#[derive(Debug, Clone)]
pub struct SymbolReference {
    number: SymRefNumber,
    symbol: SymbolId,
    owning_method: OwningMethodIndex,
    cp_index: CpIndex,
    pub offset: u32,
    /// Which unresolved reference of the compilation this is, `None` when resolved
    unresolved_index: Option<u32>,
    resolved: bool,
    /// The constant pool entry was unresolved when the bytecode was looked at, even if the
    /// reference itself is resolved now
    pub unresolved_in_cp: bool,
    /// Another reference uses the same symbol
    pub really_shares_symbol: bool,
    pub accessed_at_runtime: RuntimeAccess,
    /// Index into the known object table, for references to objects whose identity is known
    pub known_object: Option<u32>,
    pub can_gc_and_return: bool,
    pub can_gc_and_except: bool,
    pub preserves_all_registers: bool,
}
impl SymbolReference {
    pub(crate) fn new(
        number: SymRefNumber,
        symbol: SymbolId,
        owning_method: OwningMethodIndex,
        cp_index: CpIndex,
        offset: u32,
    ) -> SymbolReference {
        SymbolReference {
            number,
            symbol,
            owning_method,
            cp_index,
            offset,
            unresolved_index: None,
            resolved: false,
            unresolved_in_cp: false,
            really_shares_symbol: false,
            accessed_at_runtime: RuntimeAccess::Maybe,
            known_object: None,
            can_gc_and_return: false,
            can_gc_and_except: false,
            preserves_all_registers: false,
        }
    }

    #[must_use]
    pub fn number(&self) -> SymRefNumber {
        self.number
    }

    #[must_use]
    pub fn symbol(&self) -> SymbolId {
        self.symbol
    }

    #[must_use]
    pub fn owning_method(&self) -> OwningMethodIndex {
        self.owning_method
    }

    /// `-1` for references which were made up by the compiler
    #[must_use]
    pub fn cp_index(&self) -> CpIndex {
        self.cp_index
    }

    #[must_use]
    pub fn is_unresolved(&self) -> bool {
        self.unresolved_index.is_some()
    }

    #[must_use]
    pub fn unresolved_index(&self) -> Option<u32> {
        self.unresolved_index
    }

    /// Mark the reference as unresolved.
    /// A reference which has been resolved can't go back, since code may already rely on it.
    pub fn set_unresolved(&mut self, index: u32) -> Result<(), SymbolTableError> {
        if self.resolved {
            return Err(SymbolTableError::ResolvedToUnresolved(self.number));
        }
        self.unresolved_index = Some(index);
        Ok(())
    }

    /// The reference was found to be resolved
    pub fn set_resolved(&mut self) {
        self.unresolved_index = None;
        self.resolved = true;
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    pub fn set_can_gc(&mut self) {
        self.can_gc_and_return = true;
        self.can_gc_and_except = true;
    }
}

#[cfg(test)]
mod tests {
    use rhojit_base::id::SymRefNumber;

    use super::{merge_conservative, SymbolFlags, SymbolId, SymbolReference};
    use crate::symref::SymbolTableError;

    #[test]
    fn test_merge_never_loses_volatile() {
        // An unresolved field was assumed volatile, the resolved one turns out not to be
        let existing = SymbolFlags::VOLATILE;
        let merged = merge_conservative(existing, SymbolFlags::PRIVATE | SymbolFlags::FINAL);
        assert_eq!(merged, SymbolFlags::VOLATILE);

        let merged = merge_conservative(SymbolFlags::empty(), SymbolFlags::VOLATILE);
        assert!(merged.contains(SymbolFlags::VOLATILE));
    }

    #[test]
    fn test_merge_needs_agreement_for_private_final() {
        let existing = SymbolFlags::PRIVATE | SymbolFlags::FINAL;
        assert_eq!(merge_conservative(existing, existing), existing);
        assert_eq!(
            merge_conservative(existing, SymbolFlags::FINAL),
            SymbolFlags::FINAL
        );
        assert_eq!(
            merge_conservative(existing, SymbolFlags::empty()),
            SymbolFlags::empty()
        );
        // Unrelated flags are kept
        assert_eq!(
            merge_conservative(SymbolFlags::NAMED, SymbolFlags::empty()),
            SymbolFlags::NAMED
        );
    }

    #[test]
    fn test_resolution_direction() {
        let mut symref =
            SymbolReference::new(SymRefNumber::new_unchecked(4), SymbolId(0), 0, 12, 0);
        symref.set_unresolved(0).unwrap();
        assert!(symref.is_unresolved());

        symref.set_resolved();
        assert!(!symref.is_unresolved());
        assert!(matches!(
            symref.set_unresolved(1),
            Err(SymbolTableError::ResolvedToUnresolved(n)) if n.get() == 4
        ));
    }
}
