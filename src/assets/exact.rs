//! Exact-match filter body.
//!
//! A deterministic alternative to the cuckoo body: the full item set is
//! written at upload time as a sorted array of fixed-width items, and
//! membership is a binary search. No false positives, no removal protocol.

use crate::errors::Error;

/// Wire header size of an exact-match body: item count and item size bytes.
pub const EXACT_MATCH_HEADER_SIZE: usize = 2;

/// Borrowed view over a serialized exact-match filter body.
///
/// Wire layout, little-endian:
///
/// ```text
/// [item_count: u8][item_size: u8][items: item_count * item_size bytes]
/// ```
///
/// Items must be sorted ascending in lexicographic byte order.
#[derive(Clone, Copy, Debug)]
pub struct ExactMatchView<'a> {
    item_size: usize,
    items: &'a [u8],
}

impl<'a> ExactMatchView<'a> {
    /// Parse a serialized body without copying it.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < EXACT_MATCH_HEADER_SIZE {
            return Err(Error::WrongPayloadLength);
        }
        let item_count = bytes[0] as usize;
        let item_size = bytes[1] as usize;
        if item_size == 0 {
            return Err(Error::InvalidMessage);
        }
        let expected = EXACT_MATCH_HEADER_SIZE + item_count * item_size;
        if bytes.len() != expected {
            return Err(Error::WrongPayloadLength);
        }
        Ok(Self {
            item_size,
            items: &bytes[EXACT_MATCH_HEADER_SIZE..],
        })
    }

    /// The size a serialized body must have, read from its two leading
    /// bytes. `None` when the prefix is malformed.
    pub fn declared_size(bytes: &[u8]) -> Option<usize> {
        if bytes.len() < EXACT_MATCH_HEADER_SIZE || bytes[1] == 0 {
            return None;
        }
        Some(EXACT_MATCH_HEADER_SIZE + bytes[0] as usize * bytes[1] as usize)
    }

    /// Number of items.
    pub fn item_count(&self) -> usize {
        self.items.len() / self.item_size
    }

    /// Width of each item in bytes.
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Test membership. A candidate whose length differs from the item
    /// width is never contained.
    pub fn contains(&self, key: &[u8]) -> bool {
        if key.len() != self.item_size {
            return false;
        }
        let mut low = 0;
        let mut high = self.item_count();
        while low < high {
            let mid = (low + high) / 2;
            let item = &self.items[mid * self.item_size..(mid + 1) * self.item_size];
            match item.cmp(key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return true,
            }
        }
        false
    }
}

/// Serialize an item set into the exact-match wire form.
///
/// Items are sorted and deduplicated; every item must have the same width.
pub fn encode_exact_match_body(items: &[&[u8]]) -> Result<Vec<u8>, Error> {
    let item_size = match items.first() {
        Some(first) => first.len(),
        None => return Err(Error::InvalidMessage),
    };
    if item_size == 0 || item_size > u8::MAX as usize {
        return Err(Error::InvalidMessage);
    }
    if items.iter().any(|item| item.len() != item_size) {
        return Err(Error::InvalidMessage);
    }

    let mut sorted: Vec<&[u8]> = items.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() > u8::MAX as usize {
        return Err(Error::NoSpace);
    }

    let mut out = Vec::with_capacity(EXACT_MATCH_HEADER_SIZE + sorted.len() * item_size);
    out.push(sorted.len() as u8);
    out.push(item_size as u8);
    for item in sorted {
        out.extend_from_slice(item);
    }
    Ok(out)
}
