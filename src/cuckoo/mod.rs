//! Cuckoo Filter Implementation
//!
//! Approximate-membership filters for asset recognition. Each committed
//! asset filter may carry a cuckoo filter body that summarizes the set of
//! devices it recognizes, enabling constant-time membership tests against
//! every scanned advertisement without storing the device list itself.
//!
//! ## Properties
//!
//! - Supports removal, unlike a Bloom filter, which is what allows filter
//!   sets to be edited incrementally across uploads.
//! - Fingerprints are 16-bit CRCs of the key; zero is reserved as the
//!   empty-nest sentinel.
//! - Both candidate buckets of an entry are pure functions of its
//!   fingerprint, so an entry can be displaced ("kicked") between buckets
//!   without remembering where it came from.
//! - The eviction sequence is seeded from a hash of the entire filter
//!   state: two nodes holding identical committed state perform identical
//!   evictions and stay byte-for-byte identical.

mod filter;

use thiserror::Error;

pub use filter::{CuckooFilter, CuckooView};

use crate::util::crc16;

/// A 16-bit fingerprint stored in a nest. Zero means the nest is empty.
pub type Fingerprint = u16;

/// Maximum number of evictions attempted before an insert gives up and
/// parks the displaced entry in the victim slot.
pub const MAX_KICK_ATTEMPTS: usize = 100;

/// Upper bound on `bucket_count_log2`, keeping bucket indices within u16.
pub const MAX_BUCKET_COUNT_LOG2: u8 = 15;

/// Serialized size of the fixed filter header:
/// log2 byte, nests byte, and the 6-byte victim.
pub const SERIALIZED_HEADER_SIZE: usize = 8;

/// Fingerprint substituted when a key's CRC-16 happens to be the empty-nest
/// sentinel, keeping every real entry representable.
const ZERO_FINGERPRINT_SUBSTITUTE: Fingerprint = 0x8000;

/// Errors related to cuckoo filter construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CuckooError {
    #[error("bucket count must be nonzero and at most 2^{MAX_BUCKET_COUNT_LOG2}, got {0}")]
    InvalidBucketCount(u16),

    #[error("nests per bucket must be nonzero")]
    ZeroNests,

    #[error("serialized filter truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
}

/// A fingerprint together with its two candidate bucket indices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtendedFingerprint {
    pub fingerprint: Fingerprint,
    pub bucket_a: u16,
    pub bucket_b: u16,
}

/// Hash a key to its nonzero fingerprint.
pub fn fingerprint(key: &[u8]) -> Fingerprint {
    match crc16(key, None) {
        0 => ZERO_FINGERPRINT_SUBSTITUTE,
        f => f,
    }
}

/// Compute the extended fingerprint of a key for a filter with
/// `bucket_count = bucket_mask + 1` buckets (a power of two).
///
/// bucketA re-hashes the fingerprint; bucketB is bucketA XOR the
/// fingerprint. Because the bucket count is a power of two, the modulo is a
/// mask and XOR distributes over it, which makes the pair derivable from the
/// fingerprint alone.
pub fn extended_fingerprint(key: &[u8], bucket_mask: u16) -> ExtendedFingerprint {
    let finger = fingerprint(key);
    let hashed = crc16(&finger.to_le_bytes(), None);
    ExtendedFingerprint {
        fingerprint: finger,
        bucket_a: hashed & bucket_mask,
        bucket_b: (hashed ^ finger) & bucket_mask,
    }
}

/// Recompute the extended fingerprint of an entry currently resident in
/// `bucket_index`. The alternate bucket falls out of the XOR relation.
pub fn extended_from_bucket(
    finger: Fingerprint,
    bucket_index: u16,
    bucket_mask: u16,
) -> ExtendedFingerprint {
    ExtendedFingerprint {
        fingerprint: finger,
        bucket_a: bucket_index & bucket_mask,
        bucket_b: (bucket_index ^ finger) & bucket_mask,
    }
}
