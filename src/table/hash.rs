//! Tuple hashing and bucket scaling

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::OnceLock;

use ahash::RandomState;
use rand::Rng;

use crate::tuple::Tuple;

static SEED: OnceLock<RandomState> = OnceLock::new();

fn seed() -> &'static RandomState {
    SEED.get_or_init(|| {
        let mut rng = rand::thread_rng();
        RandomState::with_seeds(rng.gen(), rng.gen(), rng.gen(), rng.gen())
    })
}

/// Raw 32-bit hash of a tuple in a zone and namespace
///
/// Direction is not hashed: a reply tuple lands wherever its own addresses
/// and ports put it, independent of the original.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn hash_tuple(tuple: &Tuple, zone_id: u16, ns_mix: u32) -> u32 {
    let mut hasher = seed().build_hasher();
    tuple.hash(&mut hasher);
    zone_id.hash(&mut hasher);
    ns_mix.hash(&mut hasher);
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

/// Map a raw hash onto `size` buckets by multiplication, so any size works
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn scale(hash: u32, size: usize) -> usize {
    ((hash as u64 * size as u64) >> 32) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::Direction;

    fn tuple() -> Tuple {
        Tuple::tcp("192.0.2.1:40000".parse().unwrap(), "198.51.100.7:443".parse().unwrap())
    }

    #[test]
    fn test_hash_ignores_direction() {
        let t = tuple();
        assert_eq!(
            hash_tuple(&t, 0, 1),
            hash_tuple(&t.with_dir(Direction::Reply), 0, 1)
        );
    }

    #[test]
    fn test_hash_depends_on_zone_and_namespace() {
        let t = tuple();
        let base = hash_tuple(&t, 0, 1);
        // 32-bit collisions are possible in principle but not for these inputs in practice
        assert_ne!(base, hash_tuple(&t, 1, 1));
        assert_ne!(base, hash_tuple(&t, 0, 2));
    }

    #[test]
    fn test_inverse_hashes_independently() {
        let t = tuple();
        assert_ne!(hash_tuple(&t, 0, 1), hash_tuple(&t.swapped(), 0, 1));
    }

    #[test]
    fn test_scale_in_range() {
        for size in [1usize, 16, 1000, 65_536, 100_003] {
            assert_eq!(scale(0, size), 0);
            assert_eq!(scale(u32::MAX, size), size - 1);
            assert!(scale(0x8000_0000, size) < size);
        }
    }
}
