//! Asset filter wire format: metadata descriptions and the body variants.
//!
//! A filter payload as uploaded to the store is a small metadata prefix
//! followed by the filter body:
//!
//! ```text
//! [filter_type: u8][flags: u8][input][output][body]
//! ```
//!
//! `input` and `output.in_format` share one selector encoding:
//!
//! | Byte | Selector        | Extra bytes            |
//! |------|-----------------|------------------------|
//! | 0x00 | MacAddress      | -                      |
//! | 0x01 | AdDataType      | ad_type: u8            |
//! | 0x02 | MaskedAdDataType| ad_type: u8, mask: u32 |
//!
//! `output` is an output format byte (0 Mac, 1 AssetId, 2 AssetIdNearest)
//! followed by the selector describing which advertisement bytes feed the
//! asset-id derivation.
//!
//! All views borrow the underlying payload; they are parsed per operation
//! and never outlive a store mutation.

use crate::cuckoo::CuckooView;
use crate::errors::Error;
use crate::types::AssetId;

use super::exact::ExactMatchView;

/// Filter body kind discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterType {
    Cuckoo = 0,
    ExactMatch = 1,
}

impl FilterType {
    /// Decode a wire byte; unknown values are surfaced, not defaulted, so
    /// the engine can skip filters it does not understand.
    pub fn from_wire(byte: u8) -> Result<Self, Error> {
        match byte {
            0 => Ok(FilterType::Cuckoo),
            1 => Ok(FilterType::ExactMatch),
            _ => Err(Error::UnknownType),
        }
    }
}

/// Flag bit: filters with this bit reject the advertisement for everyone.
const FLAG_EXCLUDE: u8 = 1 << 0;

/// How to select the bytes an advertisement is tested (or hashed) by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputSelector {
    /// The 6-byte peer address.
    MacAddress,
    /// The first advertising-data field of the given type.
    AdDataType { ad_type: u8 },
    /// The first field of the given type, reduced through a byte mask.
    /// Mask bit `i` (LSB-first) selects byte `i` of the field.
    MaskedAdDataType { ad_type: u8, mask: u32 },
}

impl InputSelector {
    /// Parse a selector from the head of `bytes`; returns the selector and
    /// the number of bytes consumed.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), Error> {
        match bytes.first() {
            Some(0) => Ok((InputSelector::MacAddress, 1)),
            Some(1) => {
                if bytes.len() < 2 {
                    return Err(Error::WrongPayloadLength);
                }
                Ok((InputSelector::AdDataType { ad_type: bytes[1] }, 2))
            }
            Some(2) => {
                if bytes.len() < 6 {
                    return Err(Error::WrongPayloadLength);
                }
                let mask = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
                Ok((
                    InputSelector::MaskedAdDataType {
                        ad_type: bytes[1],
                        mask,
                    },
                    6,
                ))
            }
            Some(_) => Err(Error::UnknownType),
            None => Err(Error::WrongPayloadLength),
        }
    }

    /// Append the wire encoding to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            InputSelector::MacAddress => out.push(0),
            InputSelector::AdDataType { ad_type } => {
                out.push(1);
                out.push(*ad_type);
            }
            InputSelector::MaskedAdDataType { ad_type, mask } => {
                out.push(2);
                out.push(*ad_type);
                out.extend_from_slice(&mask.to_le_bytes());
            }
        }
    }
}

/// What an accepting filter forwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Forward the device MAC address.
    Mac = 0,
    /// Forward the derived 3-byte asset id.
    AssetId = 1,
    /// Forward the asset id through nearest-node arbitration.
    AssetIdNearest = 2,
}

impl OutputFormat {
    fn from_wire(byte: u8) -> Result<Self, Error> {
        match byte {
            0 => Ok(OutputFormat::Mac),
            1 => Ok(OutputFormat::AssetId),
            2 => Ok(OutputFormat::AssetIdNearest),
            _ => Err(Error::UnknownType),
        }
    }
}

/// Parsed filter metadata.
///
/// Cheap to re-parse per operation; holds no reference to the payload
/// except the body offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterMetadata {
    pub filter_type: FilterType,
    pub exclude: bool,
    pub input: InputSelector,
    pub output_format: OutputFormat,
    /// Selector feeding the asset-id derivation.
    pub output_input: InputSelector,
    /// Offset of the filter body within the payload.
    pub body_offset: usize,
}

impl FilterMetadata {
    /// Parse the metadata prefix of a filter payload.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() < 2 {
            return Err(Error::WrongPayloadLength);
        }
        let filter_type = FilterType::from_wire(payload[0])?;
        let exclude = payload[1] & FLAG_EXCLUDE != 0;

        let mut offset = 2;
        let (input, consumed) = InputSelector::parse(&payload[offset..])?;
        offset += consumed;

        let output_format = OutputFormat::from_wire(
            *payload.get(offset).ok_or(Error::WrongPayloadLength)?,
        )?;
        offset += 1;
        let (output_input, consumed) = InputSelector::parse(&payload[offset..])?;
        offset += consumed;

        Ok(Self {
            filter_type,
            exclude,
            input,
            output_format,
            output_input,
            body_offset: offset,
        })
    }
}

/// A filter body, dispatched by its wire type.
#[derive(Clone, Copy, Debug)]
pub enum FilterBody<'a> {
    Cuckoo(CuckooView<'a>),
    ExactMatch(ExactMatchView<'a>),
}

impl<'a> FilterBody<'a> {
    /// Parse the body of a filter payload according to its metadata.
    pub fn parse(metadata: &FilterMetadata, payload: &'a [u8]) -> Result<Self, Error> {
        let body = payload
            .get(metadata.body_offset..)
            .ok_or(Error::WrongPayloadLength)?;
        match metadata.filter_type {
            FilterType::Cuckoo => CuckooView::parse(body)
                .map(FilterBody::Cuckoo)
                .map_err(|_| Error::WrongPayloadLength),
            FilterType::ExactMatch => ExactMatchView::parse(body).map(FilterBody::ExactMatch),
        }
    }

    /// Test membership of the prepared input bytes.
    pub fn contains(&self, key: &[u8]) -> bool {
        match self {
            FilterBody::Cuckoo(view) => view.contains(key),
            FilterBody::ExactMatch(view) => view.contains(key),
        }
    }

    /// Derive the short asset id of the prepared input bytes.
    pub fn asset_id(&self, key: &[u8]) -> AssetId {
        AssetId::from_crc32(crc32fast::hash(key))
    }
}

/// Compute the total size a filter payload must have from its own
/// declarations: metadata prefix plus the body's self-described size.
pub fn declared_payload_size(payload: &[u8]) -> Result<usize, Error> {
    let metadata = FilterMetadata::parse(payload)?;
    let body = payload
        .get(metadata.body_offset..)
        .ok_or(Error::WrongPayloadLength)?;
    let body_size = match metadata.filter_type {
        FilterType::Cuckoo => CuckooView::declared_size(body),
        FilterType::ExactMatch => ExactMatchView::declared_size(body),
    };
    body_size
        .map(|size| metadata.body_offset + size)
        .ok_or(Error::WrongPayloadLength)
}

/// Assemble a complete filter payload. Used by tests and upload tooling.
pub fn encode_filter_payload(
    filter_type: FilterType,
    exclude: bool,
    input: InputSelector,
    output_format: OutputFormat,
    output_input: InputSelector,
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + body.len());
    out.push(filter_type as u8);
    out.push(if exclude { FLAG_EXCLUDE } else { 0 });
    input.encode(&mut out);
    out.push(output_format as u8);
    output_input.encode(&mut out);
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::exact::encode_exact_match_body;

    #[test]
    fn test_selector_round_trip() {
        for selector in [
            InputSelector::MacAddress,
            InputSelector::AdDataType { ad_type: 0x16 },
            InputSelector::MaskedAdDataType {
                ad_type: 0xFF,
                mask: 0b10101,
            },
        ] {
            let mut bytes = Vec::new();
            selector.encode(&mut bytes);
            let (parsed, consumed) = InputSelector::parse(&bytes).unwrap();
            assert_eq!(parsed, selector);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn test_metadata_parse() {
        let body = encode_exact_match_body(&[b"abc"]).unwrap();
        let payload = encode_filter_payload(
            FilterType::ExactMatch,
            true,
            InputSelector::AdDataType { ad_type: 0x16 },
            OutputFormat::AssetId,
            InputSelector::MacAddress,
            &body,
        );
        let metadata = FilterMetadata::parse(&payload).unwrap();
        assert_eq!(metadata.filter_type, FilterType::ExactMatch);
        assert!(metadata.exclude);
        assert_eq!(metadata.input, InputSelector::AdDataType { ad_type: 0x16 });
        assert_eq!(metadata.output_format, OutputFormat::AssetId);
        assert_eq!(metadata.output_input, InputSelector::MacAddress);
        assert_eq!(declared_payload_size(&payload).unwrap(), payload.len());
    }

    #[test]
    fn test_unknown_filter_type_surfaces() {
        let payload = [9u8, 0, 0, 1, 0, 0, 0];
        assert_eq!(FilterMetadata::parse(&payload), Err(Error::UnknownType));
    }

    #[test]
    fn test_declared_size_mismatch_detected() {
        let body = encode_exact_match_body(&[b"abc"]).unwrap();
        let mut payload = encode_filter_payload(
            FilterType::ExactMatch,
            false,
            InputSelector::MacAddress,
            OutputFormat::Mac,
            InputSelector::MacAddress,
            &body,
        );
        let declared = declared_payload_size(&payload).unwrap();
        assert_eq!(declared, payload.len());
        payload.push(0);
        assert_ne!(declared_payload_size(&payload).unwrap(), payload.len());
    }
}
