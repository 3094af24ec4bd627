use rhojit_base::{address_set::AddressSet, id::ClassId};
use usize_cast::IntoUsize;

/// Addresses of classes and method code that have been unloaded.
/// Lives behind the assumption table lock, see
/// [`AssumptionTable::is_unloaded_class`](crate::rat::AssumptionTable::is_unloaded_class).
#[derive(Debug, Clone)]
pub struct UnloadedAddresses {
    classes: AddressSet,
    methods: AddressSet,
}
impl UnloadedAddresses {
    #[must_use]
    pub fn new(max_ranges: usize) -> UnloadedAddresses {
        UnloadedAddresses {
            classes: AddressSet::new(max_ranges),
            methods: AddressSet::new(max_ranges),
        }
    }

    /// Record that `class` was unloaded, along with the `size` bytes of its method code
    /// starting at `method_start`
    pub fn add_unloaded_class(&mut self, class: ClassId, method_start: usize, size: u32) {
        self.classes.add_single(class.get());
        self.methods
            .add(method_start, method_start.saturating_add(size.into_usize()));
    }

    /// May return `true` for a class that was never unloaded, never `false` for one that was
    #[must_use]
    pub fn is_unloaded_class(&self, address: usize) -> bool {
        self.classes.may_contain(address)
    }

    #[must_use]
    pub fn is_in_unloaded_method(&self, address: usize) -> bool {
        self.methods.may_contain(address)
    }

    #[must_use]
    pub fn classes(&self) -> &AddressSet {
        &self.classes
    }

    #[must_use]
    pub fn methods(&self) -> &AddressSet {
        &self.methods
    }
}

#[cfg(test)]
mod tests {
    use rhojit_base::id::ClassId;

    use super::UnloadedAddresses;

    #[test]
    fn test_unloaded_class() {
        let mut unloaded = UnloadedAddresses::new(4);
        unloaded.add_unloaded_class(ClassId::new_unchecked(0x8000), 0x10_0000, 0x200);

        assert!(unloaded.is_unloaded_class(0x8000));
        assert!(!unloaded.is_unloaded_class(0x8008));
        assert!(unloaded.is_in_unloaded_method(0x10_0000));
        assert!(unloaded.is_in_unloaded_method(0x10_0200));
        assert!(!unloaded.is_in_unloaded_method(0x10_0201));
    }
}
