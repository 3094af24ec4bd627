use std::{
    collections::{HashMap, HashSet},
    hash::{BuildHasherDefault, Hasher},
};

// We wrap this because the alternative hasher is not generic
// and Rust doesn't allow unused generics.
// But this allows us to have that.
pub trait HashWrapperTrait<T> {
    type HashMapHasher;
}
pub struct HashWrapper;
impl<T> HashWrapperTrait<T> for HashWrapper {
    #[cfg(feature = "implementation-cheaper-map-hashing")]
    type HashMapHasher = nohash_hasher::BuildNoHashHasher<T>;
    #[cfg(not(feature = "implementation-cheaper-map-hashing"))]
    type HashMapHasher = std::collections::hash_map::RandomState;
}

/// A map keyed by a dense id, which is already as good as a hash.
pub type IdMap<K, V> = HashMap<K, V, <HashWrapper as HashWrapperTrait<K>>::HashMapHasher>;

/// Hasher for opaque addresses (class blocks, method bodies).
/// Addresses are aligned and clustered, so using them directly would put everything in a few
/// buckets, instead they're spread with the 64 bit golden ratio.
#[derive(Debug, Default, Clone, Copy)]
pub struct AddressHasher(u64);
impl Hasher for AddressHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 = (self.0.rotate_left(8) ^ u64::from(*byte)).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        }
    }

    fn write_usize(&mut self, value: usize) {
        self.write_u64(value as u64);
    }

    fn write_u64(&mut self, value: u64) {
        self.0 = (self.0 ^ (value >> 2)).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    }
}

pub type AddressMap<K, V> = HashMap<K, V, BuildHasherDefault<AddressHasher>>;

#[must_use]
pub fn new_address_map<K, V>() -> AddressMap<K, V> {
    HashMap::with_hasher(BuildHasherDefault::default())
}

pub type AddressHashSet<K> = HashSet<K, BuildHasherDefault<AddressHasher>>;

#[must_use]
pub fn new_address_hash_set<K>() -> AddressHashSet<K> {
    HashSet::with_hasher(BuildHasherDefault::default())
}

#[must_use]
pub fn new_id_map<K, V>() -> IdMap<K, V> {
    HashMap::with_hasher(Default::default())
}

/// Size in bytes of a value of the type, known without having one
pub trait StaticMemorySize {
    const MEMORY_SIZE: usize;
}

macro_rules! static_memory_size {
    ($($t:ty = $size:expr),* $(,)?) => {
        $(
            impl StaticMemorySize for $t {
                const MEMORY_SIZE: usize = $size;
            }
        )*
    };
}
static_memory_size!(u8 = 1, i8 = 1, u16 = 2, i16 = 2, u32 = 4, i32 = 4, u64 = 8, i64 = 8);

#[cfg(test)]
mod tests {
    use std::hash::Hasher;

    use super::AddressHasher;

    #[test]
    fn test_address_hasher_spreads() {
        let hash = |v: usize| {
            let mut hasher = AddressHasher::default();
            hasher.write_usize(v);
            hasher.finish()
        };
        // Neighbouring aligned addresses should not share their top bits
        assert_ne!(hash(0x1000) >> 57, hash(0x1008) >> 57);
        assert_eq!(hash(0x1000), hash(0x1000));
    }
}
