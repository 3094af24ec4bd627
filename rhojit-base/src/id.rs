use std::hash::{Hash, Hasher};

/// Identity of a loaded class, as handed to us by the class-loading subsystem.
/// This is an opaque class block pointer, we never look inside of it.
#[derive(Debug, Copy, Clone)]
pub struct ClassId(usize);
impl ClassId {
    #[must_use]
    pub const fn new_unchecked(raw: usize) -> ClassId {
        ClassId(raw)
    }

    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }
}

// Two ids are only the same class if they came from the same host
impl PartialEq for ClassId {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for ClassId {}
impl Hash for ClassId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.0)
    }
}

/// Identity of a method block in the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MethodId(usize);
impl MethodId {
    #[must_use]
    pub const fn new_unchecked(raw: usize) -> MethodId {
        MethodId(raw)
    }

    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }
}

/// Identity of one compiled method body (its metadata block).
/// All runtime assumptions made while compiling a body hang off of this.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BodyId(usize);
impl BodyId {
    #[must_use]
    pub const fn new_unchecked(raw: usize) -> BodyId {
        BodyId(raw)
    }

    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }
}

/// Slot of a runtime assumption inside of the assumption table's arena.
/// Only meaningful for the table that produced it.
#[derive(Debug, Copy, Clone)]
pub struct AssumptionId(u32);
impl AssumptionId {
    #[must_use]
    pub const fn new_unchecked(id: u32) -> AssumptionId {
        AssumptionId(id)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}
impl PartialEq for AssumptionId {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for AssumptionId {}
impl Hash for AssumptionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.0)
    }
}
#[cfg(feature = "implementation-cheaper-map-hashing")]
impl nohash_hasher::IsEnabled for AssumptionId {}

/// The dense identity of a symbol reference within one compilation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SymRefNumber(u32);
impl SymRefNumber {
    #[must_use]
    pub const fn new_unchecked(id: u32) -> SymRefNumber {
        SymRefNumber(id)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}
impl Hash for SymRefNumber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.0)
    }
}
#[cfg(feature = "implementation-cheaper-map-hashing")]
impl nohash_hasher::IsEnabled for SymRefNumber {}

/// Index of the method that owns a symbol reference, within one compilation.
/// Index 0 is the method being compiled, inlined callees get later indices.
pub type OwningMethodIndex = u32;

/// Constant pool index as seen by the symbol table.
/// `-1` is used for synthesized references which do not have an entry.
pub type CpIndex = i32;
