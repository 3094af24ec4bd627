#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
// This would be nice to re-enable eventually, but not while in active dev
#![allow(clippy::missing_errors_doc)]
// Shadowing is nice.
#![allow(clippy::shadow_unrelated)]
// Cool idea but highlights entire function and is too aggressive.
#![allow(clippy::option_if_let_else)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::semicolon_if_nothing_returned)]
#![allow(clippy::unused_self)]

//! Shared pieces of the jit runtime layer: opaque identity handles for the host's class blocks,
//! methods and compiled bodies, the data types the symbol table talks in, and the bounded
//! [`AddressSet`](address_set::AddressSet).

use usize_cast::IntoUsize;

pub mod address_set;
pub mod id;
pub mod types;
pub mod util;

/// Golden ratio multiplier used for hashing opaque addresses into fixed bucket tables.
pub const GOLDEN_RATIO_32: u32 = 2_654_435_761;

/// Hash an opaque key into one of `size` buckets.
/// The low two bits of the key are discarded since keys are (almost always) aligned pointers.
#[must_use]
pub fn bucket_index(key: usize, size: usize) -> usize {
    debug_assert!(size > 0);
    // Truncation is intended, only the low bits of the address are mixed
    #[allow(clippy::cast_possible_truncation)]
    let key = (key >> 2) as u32;
    let hashed = key.wrapping_mul(GOLDEN_RATIO_32);
    hashed.into_usize() % size
}

#[cfg(test)]
mod tests {
    use crate::bucket_index;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0, 251), 0);
        // Low bits are ignored
        assert_eq!(bucket_index(0x1000, 251), bucket_index(0x1003, 251));
        for key in (0..4096usize).step_by(8) {
            assert!(bucket_index(key, 251) < 251);
        }
        // 4 >> 2 == 1, so the result is the multiplier reduced
        assert_eq!(bucket_index(4, 4001), 2_654_435_761 % 4001);
    }
}
