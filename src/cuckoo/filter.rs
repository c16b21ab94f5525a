//! Owned cuckoo filter data structure.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{
    extended_from_bucket, extended_fingerprint, CuckooError, ExtendedFingerprint, Fingerprint,
    MAX_BUCKET_COUNT_LOG2, MAX_KICK_ATTEMPTS, SERIALIZED_HEADER_SIZE,
};
use crate::util::crc16;

/// A cuckoo filter with a fixed bucket/nest geometry and a single victim
/// slot.
///
/// Invariants:
/// - `victim.fingerprint == 0` iff the last insert did not fail.
/// - Within any bucket, nonzero fingerprints are front-loaded: no zero nest
///   precedes a nonzero one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CuckooFilter {
    bucket_count_log2: u8,
    nests_per_bucket: u8,
    victim: ExtendedFingerprint,
    buckets: Vec<Fingerprint>,
}

impl CuckooFilter {
    /// Create an empty filter.
    ///
    /// `bucket_count` is rounded up to the next power of two and stored in
    /// log2 form.
    pub fn new(bucket_count: u16, nests_per_bucket: u8) -> Result<Self, CuckooError> {
        if bucket_count == 0 {
            return Err(CuckooError::InvalidBucketCount(bucket_count));
        }
        if nests_per_bucket == 0 {
            return Err(CuckooError::ZeroNests);
        }

        let bucket_count_log2 = ceil_log2(bucket_count);
        if bucket_count_log2 > MAX_BUCKET_COUNT_LOG2 {
            return Err(CuckooError::InvalidBucketCount(bucket_count));
        }

        let total = (1usize << bucket_count_log2) * nests_per_bucket as usize;
        Ok(Self {
            bucket_count_log2,
            nests_per_bucket,
            victim: ExtendedFingerprint::default(),
            buckets: vec![0; total],
        })
    }

    /// Reconstruct a filter from its serialized form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CuckooError> {
        if bytes.len() < SERIALIZED_HEADER_SIZE {
            return Err(CuckooError::Truncated {
                expected: SERIALIZED_HEADER_SIZE,
                got: bytes.len(),
            });
        }
        let bucket_count_log2 = bytes[0];
        let nests_per_bucket = bytes[1];
        if bucket_count_log2 > MAX_BUCKET_COUNT_LOG2 {
            return Err(CuckooError::InvalidBucketCount(0));
        }
        if nests_per_bucket == 0 {
            return Err(CuckooError::ZeroNests);
        }

        let total = (1usize << bucket_count_log2) * nests_per_bucket as usize;
        let expected = SERIALIZED_HEADER_SIZE + total * 2;
        if bytes.len() != expected {
            return Err(CuckooError::Truncated {
                expected,
                got: bytes.len(),
            });
        }

        let victim = ExtendedFingerprint {
            fingerprint: u16::from_le_bytes([bytes[2], bytes[3]]),
            bucket_a: u16::from_le_bytes([bytes[4], bytes[5]]),
            bucket_b: u16::from_le_bytes([bytes[6], bytes[7]]),
        };
        let buckets = bytes[SERIALIZED_HEADER_SIZE..]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        Ok(Self {
            bucket_count_log2,
            nests_per_bucket,
            victim,
            buckets,
        })
    }

    /// Serialize to the little-endian wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_size());
        out.push(self.bucket_count_log2);
        out.push(self.nests_per_bucket);
        out.extend_from_slice(&self.victim.fingerprint.to_le_bytes());
        out.extend_from_slice(&self.victim.bucket_a.to_le_bytes());
        out.extend_from_slice(&self.victim.bucket_b.to_le_bytes());
        for finger in &self.buckets {
            out.extend_from_slice(&finger.to_le_bytes());
        }
        out
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        SERIALIZED_HEADER_SIZE + self.buckets.len() * 2
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> u16 {
        1 << self.bucket_count_log2
    }

    /// Nests per bucket.
    pub fn nests_per_bucket(&self) -> u8 {
        self.nests_per_bucket
    }

    /// Total nest capacity.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// The parked entry from the last failed insert, if any.
    pub fn victim(&self) -> ExtendedFingerprint {
        self.victim
    }

    /// Hash of the entire filter state.
    ///
    /// Seeds the eviction RNG so identical states evolve identically on
    /// every node.
    pub fn filter_hash(&self) -> u16 {
        crc16(&self.to_bytes(), None)
    }

    /// Zero all nests and the victim.
    pub fn clear(&mut self) {
        self.buckets.fill(0);
        self.victim = ExtendedFingerprint::default();
    }

    /// Insert a key.
    ///
    /// Returns `false` only when both candidate buckets are full, the kick
    /// sequence exhausted its attempts, and the victim slot was already
    /// occupied (the filter is saturated until a removal frees space).
    pub fn add(&mut self, key: &[u8]) -> bool {
        let efp = extended_fingerprint(key, self.bucket_mask());
        self.add_extended(efp)
    }

    /// Test membership of a key.
    ///
    /// No false negatives for resident entries; the single victim is not
    /// consulted, so an entry that failed to place reports absent.
    pub fn contains(&self, key: &[u8]) -> bool {
        let efp = extended_fingerprint(key, self.bucket_mask());
        self.contains_extended(&efp)
    }

    /// Remove a key.
    ///
    /// Returns `false` without side effects when the key is absent. After a
    /// successful removal the victim, if present, is given a chance to take
    /// the freed space. A key whose entry is currently parked as the victim
    /// is removed from the victim slot directly.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let efp = extended_fingerprint(key, self.bucket_mask());
        if self.remove_from_bucket(efp.fingerprint, efp.bucket_a)
            || self.remove_from_bucket(efp.fingerprint, efp.bucket_b)
        {
            self.try_reinsert_victim();
            return true;
        }
        if self.victim.fingerprint != 0 && self.victim.fingerprint == efp.fingerprint {
            self.victim = ExtendedFingerprint::default();
            return true;
        }
        false
    }

    fn bucket_mask(&self) -> u16 {
        (self.bucket_count() - 1) as u16
    }

    fn nest(&self, bucket: u16, index: u8) -> Fingerprint {
        self.buckets[bucket as usize * self.nests_per_bucket as usize + index as usize]
    }

    fn nest_mut(&mut self, bucket: u16, index: u8) -> &mut Fingerprint {
        &mut self.buckets[bucket as usize * self.nests_per_bucket as usize + index as usize]
    }

    fn contains_extended(&self, efp: &ExtendedFingerprint) -> bool {
        // Buckets are scanned separately to keep each scan within one cache
        // line.
        for index in 0..self.nests_per_bucket {
            if self.nest(efp.bucket_a, index) == efp.fingerprint {
                return true;
            }
        }
        for index in 0..self.nests_per_bucket {
            if self.nest(efp.bucket_b, index) == efp.fingerprint {
                return true;
            }
        }
        false
    }

    fn add_extended(&mut self, efp: ExtendedFingerprint) -> bool {
        if self.contains_extended(&efp) {
            return true;
        }
        if self.victim.fingerprint != 0 {
            return false;
        }
        self.place(efp)
    }

    /// Place an entry, kicking residents as needed.
    ///
    /// The RNG is seeded from the filter-state hash, which makes the kick
    /// sequence a pure function of the state and the inserted entry.
    fn place(&mut self, mut entry: ExtendedFingerprint) -> bool {
        let mut rng = StdRng::seed_from_u64(self.filter_hash() as u64);

        for _ in 0..MAX_KICK_ATTEMPTS {
            if self.add_to_bucket(entry.fingerprint, entry.bucket_a)
                || self.add_to_bucket(entry.fingerprint, entry.bucket_b)
            {
                return true;
            }

            // Both buckets full: evict a random nest from a random candidate
            // bucket and retry with the displaced entry.
            let kicked_bucket = if rng.gen_range(0..2u8) == 1 {
                entry.bucket_a
            } else {
                entry.bucket_b
            };
            let kicked_nest = rng.gen_range(0..self.nests_per_bucket);

            let slot = self.nest_mut(kicked_bucket, kicked_nest);
            let displaced = *slot;
            *slot = entry.fingerprint;
            entry = extended_from_bucket(displaced, kicked_bucket, self.bucket_mask());
        }

        self.victim = entry;
        false
    }

    fn add_to_bucket(&mut self, finger: Fingerprint, bucket: u16) -> bool {
        for index in 0..self.nests_per_bucket {
            let slot = self.nest_mut(bucket, index);
            if *slot == 0 {
                *slot = finger;
                return true;
            }
        }
        false
    }

    fn remove_from_bucket(&mut self, finger: Fingerprint, bucket: u16) -> bool {
        for index in 0..self.nests_per_bucket {
            if self.nest(bucket, index) == finger {
                *self.nest_mut(bucket, index) = 0;
                self.refill_hole(bucket, index);
                return true;
            }
        }
        false
    }

    /// Restore the front-loading invariant after a removal: pull the last
    /// nonzero nest of the bucket into the hole.
    fn refill_hole(&mut self, bucket: u16, hole: u8) {
        for index in (hole + 1..self.nests_per_bucket).rev() {
            let finger = self.nest(bucket, index);
            if finger != 0 {
                *self.nest_mut(bucket, hole) = finger;
                *self.nest_mut(bucket, index) = 0;
                return;
            }
        }
    }

    fn try_reinsert_victim(&mut self) {
        if self.victim.fingerprint == 0 {
            return;
        }
        // Direct placement only: an eviction cascade here could park a
        // different entry as victim, letting a fully drained filter keep a
        // stale one.
        let victim = self.victim;
        if self.add_to_bucket(victim.fingerprint, victim.bucket_a)
            || self.add_to_bucket(victim.fingerprint, victim.bucket_b)
        {
            self.victim = ExtendedFingerprint::default();
        }
    }
}

/// Borrowed view over a serialized cuckoo filter.
///
/// Committed filter bodies are matched in place; the view validates the
/// geometry once and reads nests straight from the underlying bytes. It must
/// not outlive the buffer it borrows, which the store guarantees by handing
/// out views only for the duration of one operation.
#[derive(Clone, Copy, Debug)]
pub struct CuckooView<'a> {
    bucket_count_log2: u8,
    nests_per_bucket: u8,
    buckets: &'a [u8],
}

impl<'a> CuckooView<'a> {
    /// Parse a serialized filter without copying it.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, CuckooError> {
        if bytes.len() < SERIALIZED_HEADER_SIZE {
            return Err(CuckooError::Truncated {
                expected: SERIALIZED_HEADER_SIZE,
                got: bytes.len(),
            });
        }
        let bucket_count_log2 = bytes[0];
        let nests_per_bucket = bytes[1];
        if bucket_count_log2 > MAX_BUCKET_COUNT_LOG2 {
            return Err(CuckooError::InvalidBucketCount(0));
        }
        if nests_per_bucket == 0 {
            return Err(CuckooError::ZeroNests);
        }
        let total = (1usize << bucket_count_log2) * nests_per_bucket as usize;
        let expected = SERIALIZED_HEADER_SIZE + total * 2;
        if bytes.len() != expected {
            return Err(CuckooError::Truncated {
                expected,
                got: bytes.len(),
            });
        }
        Ok(Self {
            bucket_count_log2,
            nests_per_bucket,
            buckets: &bytes[SERIALIZED_HEADER_SIZE..],
        })
    }

    /// The size a serialized filter with this geometry must have, read from
    /// the two leading geometry bytes. `None` when the prefix is malformed.
    pub fn declared_size(bytes: &[u8]) -> Option<usize> {
        if bytes.len() < 2 || bytes[0] > MAX_BUCKET_COUNT_LOG2 || bytes[1] == 0 {
            return None;
        }
        let total = (1usize << bytes[0]) * bytes[1] as usize;
        Some(SERIALIZED_HEADER_SIZE + total * 2)
    }

    /// Test membership of a key.
    pub fn contains(&self, key: &[u8]) -> bool {
        let mask = ((1u32 << self.bucket_count_log2) - 1) as u16;
        let efp = extended_fingerprint(key, mask);
        self.bucket_holds(efp.bucket_a, efp.fingerprint)
            || self.bucket_holds(efp.bucket_b, efp.fingerprint)
    }

    fn bucket_holds(&self, bucket: u16, finger: Fingerprint) -> bool {
        let start = bucket as usize * self.nests_per_bucket as usize * 2;
        for index in 0..self.nests_per_bucket as usize {
            let offset = start + index * 2;
            let nest = u16::from_le_bytes([self.buckets[offset], self.buckets[offset + 1]]);
            if nest == finger {
                return true;
            }
        }
        false
    }
}

fn ceil_log2(value: u16) -> u8 {
    let mut remaining = value - 1;
    let mut log2 = 0;
    while remaining > 0 {
        remaining >>= 1;
        log2 += 1;
    }
    log2
}
