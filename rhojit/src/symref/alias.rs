use rhojit_base::{id::SymRefNumber, types::DataType};
use usize_cast::IntoUsize;

/// A growable set of symbol reference numbers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymRefSet {
    bits: Vec<u64>,
}
impl SymRefSet {
    #[must_use]
    pub fn new() -> SymRefSet {
        SymRefSet { bits: Vec::new() }
    }

    #[must_use]
    pub fn with_capacity(numbers: usize) -> SymRefSet {
        SymRefSet {
            bits: vec![0; (numbers + 63) / 64],
        }
    }

    fn ensure_capacity(&mut self, index: usize) {
        let words = index / 64 + 1;
        if self.bits.len() < words {
            self.bits.resize(words, 0);
        }
    }

    /// Returns whether the number was not already in the set
    pub fn insert(&mut self, number: SymRefNumber) -> bool {
        let index = number.get().into_usize();
        self.ensure_capacity(index);
        let word = &mut self.bits[index / 64];
        let mask = 1 << (index % 64);
        let added = *word & mask == 0;
        *word |= mask;
        added
    }

    pub fn remove(&mut self, number: SymRefNumber) -> bool {
        let index = number.get().into_usize();
        if let Some(word) = self.bits.get_mut(index / 64) {
            let mask = 1 << (index % 64);
            let had = *word & mask != 0;
            *word &= !mask;
            had
        } else {
            false
        }
    }

    #[must_use]
    pub fn contains(&self, number: SymRefNumber) -> bool {
        let index = number.get().into_usize();
        self.bits
            .get(index / 64)
            .map_or(false, |word| word & (1 << (index % 64)) != 0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|word| *word == 0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.iter().map(|word| word.count_ones().into_usize()).sum()
    }

    pub fn union_with(&mut self, other: &SymRefSet) {
        if other.bits.len() > self.bits.len() {
            self.bits.resize(other.bits.len(), 0);
        }
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= *b;
        }
    }

    #[must_use]
    pub fn intersects(&self, other: &SymRefSet) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// The numbers in the set, lowest first
    pub fn iter(&self) -> impl Iterator<Item = SymRefNumber> + '_ {
        self.bits
            .iter()
            .enumerate()
            .flat_map(|(word_index, word)| {
                let word = *word;
                (0..64u32)
                    .filter(move |bit| word & (1 << bit) != 0)
                    .map(move |bit| word_index * 64 + bit.into_usize())
            })
            .filter_map(|index| u32::try_from(index).ok())
            .map(SymRefNumber::new_unchecked)
    }
}

/// Whether a memory access is to an instance field or to a static
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Shadow,
    Static,
}

/// The partition of memory accessing symbol references that alias analysis starts from.
/// Two references in the same set may touch the same memory, references in different sets never
/// do (except through the unsafe set, which aliases with everything of its type).
#[derive(Debug, Default)]
pub struct AliasSets {
    pub address_shadows: SymRefSet,
    pub int_shadows: SymRefSet,
    pub non_int_shadows: SymRefSet,
    pub address_statics: SymRefSet,
    pub int_statics: SymRefSet,
    pub non_int_statics: SymRefSet,
    /// Everything that was unresolved when created
    pub unresolved: SymRefSet,
    pub call_site_table_entries: SymRefSet,
    pub method_type_table_entries: SymRefSet,
    pub unsafe_accesses: SymRefSet,
    /// References that have a real constant pool entry
    pub cp_sym_refs: SymRefSet,
    pub generic_int_shadows: SymRefSet,
    /// A generic int shadow that may be written has been created
    pub mutable_generic_int_shadow_created: bool,
    /// Shadows created after a mutable generic int shadow exist have to alias with it
    pub conservative_generic_int_shadow_aliasing: bool,
}
impl AliasSets {
    /// The set that a memory access of `data_type` belongs to
    #[must_use]
    pub fn set_for(&self, access: AccessKind, data_type: DataType) -> &SymRefSet {
        match (access, category(data_type)) {
            (AccessKind::Shadow, Category::Address) => &self.address_shadows,
            (AccessKind::Shadow, Category::Int) => &self.int_shadows,
            (AccessKind::Shadow, Category::NonInt) => &self.non_int_shadows,
            (AccessKind::Static, Category::Address) => &self.address_statics,
            (AccessKind::Static, Category::Int) => &self.int_statics,
            (AccessKind::Static, Category::NonInt) => &self.non_int_statics,
        }
    }

    pub fn set_for_mut(&mut self, access: AccessKind, data_type: DataType) -> &mut SymRefSet {
        match (access, category(data_type)) {
            (AccessKind::Shadow, Category::Address) => &mut self.address_shadows,
            (AccessKind::Shadow, Category::Int) => &mut self.int_shadows,
            (AccessKind::Shadow, Category::NonInt) => &mut self.non_int_shadows,
            (AccessKind::Static, Category::Address) => &mut self.address_statics,
            (AccessKind::Static, Category::Int) => &mut self.int_statics,
            (AccessKind::Static, Category::NonInt) => &mut self.non_int_statics,
        }
    }
}

enum Category {
    Address,
    Int,
    NonInt,
}
fn category(data_type: DataType) -> Category {
    if data_type == DataType::Address {
        Category::Address
    } else if data_type.is_int() {
        Category::Int
    } else {
        Category::NonInt
    }
}

#[cfg(test)]
mod tests {
    use rhojit_base::{id::SymRefNumber, types::DataType};

    use super::{AccessKind, AliasSets, SymRefSet};

    fn n(v: u32) -> SymRefNumber {
        SymRefNumber::new_unchecked(v)
    }

    #[test]
    fn test_set_grows() {
        let mut set = SymRefSet::new();
        assert!(set.is_empty());
        assert!(set.insert(n(3)));
        assert!(!set.insert(n(3)));
        assert!(set.insert(n(200)));
        assert!(set.contains(n(200)));
        assert!(!set.contains(n(199)));
        assert!(!set.contains(n(5000)));
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![n(3), n(200)]);

        assert!(set.remove(n(3)));
        assert!(!set.remove(n(3)));
        assert!(!set.remove(n(5000)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_union_and_intersect() {
        let mut a = SymRefSet::with_capacity(64);
        a.insert(n(1));
        let mut b = SymRefSet::new();
        b.insert(n(130));
        assert!(!a.intersects(&b));

        a.union_with(&b);
        assert!(a.contains(n(130)));
        assert!(a.intersects(&b));
    }

    #[test]
    fn test_partitions() {
        let mut sets = AliasSets::default();
        sets.set_for_mut(AccessKind::Shadow, DataType::Int16).insert(n(1));
        sets.set_for_mut(AccessKind::Shadow, DataType::Double).insert(n(2));
        sets.set_for_mut(AccessKind::Static, DataType::Address).insert(n(3));

        assert!(sets.int_shadows.contains(n(1)));
        assert!(sets.non_int_shadows.contains(n(2)));
        assert!(sets.address_statics.contains(n(3)));
        assert!(sets.address_shadows.is_empty());
        assert!(sets.set_for(AccessKind::Shadow, DataType::Int64).contains(n(1)));
    }
}
