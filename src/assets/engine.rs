//! Asset filter engine.
//!
//! Applies the committed filter set to every scanned advertisement. The
//! matching is two-pass: any accepting exclude filter rejects the
//! advertisement outright; otherwise every accepting non-exclude filter
//! contributes a bit to one of three output bitmasks and forwards its
//! result, subject to per-asset throttling.
//!
//! The engine raises no errors for malformed advertisements or filters: a
//! filter it cannot parse is logged and skipped, and an advertisement no
//! filter accepts produces no event.

use tracing::{debug, warn};

use crate::bus::{Event, EventQueue};
use crate::errors::Error;
use crate::types::{AssetId, ScannedDevice, MAX_BLE_ADV_DATA_LENGTH};
use crate::util::{find_ad_field, is_bit_set, set_bit};

use super::forward::AssetForwarder;
use super::filter::{FilterMetadata, InputSelector, OutputFormat};
use super::records::AssetStore;
use super::store::{AssetFilter, AssetFilterStore};
use super::MAX_FILTER_IDS;

/// Per-output-format accept bitmasks, indexed by filter index.
#[derive(Clone, Copy, Debug, Default)]
struct OutputBitmasks {
    forward_mac: u32,
    forward_asset_id: u32,
    forward_nearest_asset_id: u32,
}

impl OutputBitmasks {
    fn combined(&self) -> u32 {
        self.forward_mac | self.forward_asset_id | self.forward_nearest_asset_id
    }
}

/// Applies filters to scanned advertisements and routes the results.
#[derive(Debug)]
pub struct AssetFilterEngine {
    _private: (),
}

impl AssetFilterEngine {
    /// Create the engine.
    ///
    /// Fails with [`Error::Mismatch`] if the store could hold more filters
    /// than the output bitmasks can index.
    pub fn new() -> Result<Self, Error> {
        if MAX_FILTER_IDS > u32::BITS as usize {
            return Err(Error::Mismatch);
        }
        Ok(Self { _private: () })
    }

    /// Run one advertisement through the committed filter set.
    pub fn handle_scanned_device(
        &self,
        store: &AssetFilterStore,
        records: &mut dyn AssetStore,
        forwarder: &mut dyn AssetForwarder,
        bus: &mut EventQueue,
        device: &ScannedDevice,
    ) {
        if !store.is_ready() {
            return;
        }

        if self.is_rejected(store, device) {
            return;
        }

        let mut masks = OutputBitmasks::default();
        for index in 0..store.filter_count() {
            self.handle_accept_filter(index, store, records, forwarder, bus, device, &mut masks);
        }

        let combined = masks.combined();
        if combined == 0 {
            return;
        }

        debug!(
            forward_asset_id = format_args!("{:#06X}", masks.forward_asset_id),
            forward_mac = format_args!("{:#06X}", masks.forward_mac),
            nearest_asset_id = format_args!("{:#06X}", masks.forward_nearest_asset_id),
            "Advertisement accepted"
        );

        for index in 0..store.filter_count() {
            if !is_bit_set(combined, index) {
                continue;
            }
            let Some(filter) = store.filter(index) else {
                continue;
            };
            let asset_id = self
                .output_asset_id(&filter, device)
                .unwrap_or_default();
            bus.push(Event::AssetAccepted {
                filter_id: filter.filter_id(),
                asset_id,
                accepted_bitmask: combined,
                device: device.clone(),
            });
        }
    }

    /// Pass 1: does any exclude filter accept this advertisement?
    fn is_rejected(&self, store: &AssetFilterStore, device: &ScannedDevice) -> bool {
        for index in 0..store.filter_count() {
            let Some(filter) = store.filter(index) else {
                continue;
            };
            match self.filter_accepts(&filter, device, true) {
                Ok(true) => {
                    debug!(
                        filter_id = filter.filter_id(),
                        address = %device.address,
                        "Excluded device"
                    );
                    return true;
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(
                        filter_id = filter.filter_id(),
                        %error,
                        "Skipping unparsable filter"
                    );
                }
            }
        }
        false
    }

    /// Pass 2 body: run one non-exclude filter and forward on acceptance.
    #[allow(clippy::too_many_arguments)]
    fn handle_accept_filter(
        &self,
        index: u8,
        store: &AssetFilterStore,
        records: &mut dyn AssetStore,
        forwarder: &mut dyn AssetForwarder,
        bus: &mut EventQueue,
        device: &ScannedDevice,
        masks: &mut OutputBitmasks,
    ) -> bool {
        let Some(filter) = store.filter(index) else {
            return false;
        };
        let metadata = match filter.metadata() {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!(
                    filter_id = filter.filter_id(),
                    %error,
                    "Skipping unparsable filter"
                );
                return false;
            }
        };
        if metadata.exclude {
            return false;
        }
        match self.accepts(&filter, &metadata, device) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(error) => {
                warn!(
                    filter_id = filter.filter_id(),
                    %error,
                    "Skipping unparsable filter"
                );
                return false;
            }
        }

        let asset_id = self.output_asset_id(&filter, device).unwrap_or_default();
        let mut filter_bitmask = 0u32;
        set_bit(&mut filter_bitmask, index);

        let throttled = records
            .handle_accepted_asset(device, asset_id)
            .map(|record| record.is_throttled())
            .unwrap_or(false);

        match metadata.output_format {
            OutputFormat::Mac => {
                set_bit(&mut masks.forward_mac, index);
                if !throttled {
                    let bump = forwarder.forward_mac(bus, device);
                    records.add_throttling_bump(asset_id, bump);
                } else {
                    debug!(asset_id = %asset_id, "Throttled asset");
                }
            }
            OutputFormat::AssetId => {
                set_bit(&mut masks.forward_asset_id, index);
                if !throttled {
                    let bump =
                        forwarder.forward_asset_id(bus, device, asset_id, filter_bitmask as u8);
                    records.add_throttling_bump(asset_id, bump);
                } else {
                    debug!(asset_id = %asset_id, "Throttled asset");
                }
            }
            OutputFormat::AssetIdNearest => {
                set_bit(&mut masks.forward_nearest_asset_id, index);
                if !throttled {
                    let bump = forwarder.forward_nearest_asset_id(
                        bus,
                        device,
                        asset_id,
                        filter_bitmask as u8,
                    );
                    records.add_throttling_bump(asset_id, bump);
                } else {
                    debug!(asset_id = %asset_id, "Throttled asset");
                }
            }
        }
        true
    }

    /// Whether a filter accepts a device.
    ///
    /// With `exclude_pass` set, only exclude filters are considered.
    fn filter_accepts(
        &self,
        filter: &AssetFilter<'_>,
        device: &ScannedDevice,
        exclude_pass: bool,
    ) -> Result<bool, Error> {
        let metadata = filter.metadata()?;
        if metadata.exclude != exclude_pass {
            return Ok(false);
        }
        self.accepts(filter, &metadata, device)
    }

    fn accepts(
        &self,
        filter: &AssetFilter<'_>,
        metadata: &FilterMetadata,
        device: &ScannedDevice,
    ) -> Result<bool, Error> {
        let body = filter.body(metadata)?;
        let mut scratch = [0u8; MAX_BLE_ADV_DATA_LENGTH];
        Ok(match extract_input(&metadata.input, device, &mut scratch) {
            Some(input) => body.contains(input),
            None => false,
        })
    }

    /// Derive the asset id an accepting filter outputs for a device.
    fn output_asset_id(
        &self,
        filter: &AssetFilter<'_>,
        device: &ScannedDevice,
    ) -> Option<AssetId> {
        let metadata = filter.metadata().ok()?;
        let body = filter.body(&metadata).ok()?;
        let mut scratch = [0u8; MAX_BLE_ADV_DATA_LENGTH];
        extract_input(&metadata.output_input, device, &mut scratch)
            .map(|input| body.asset_id(input))
    }
}

/// Select the advertisement bytes a selector describes.
///
/// For the masked selector, mask bit `i` (LSB-first) selects byte `i` of
/// the located AD field; selected bytes are gathered into `scratch`
/// preserving order. Fields longer than the 31-byte advertisement limit are
/// rejected.
fn extract_input<'a>(
    selector: &InputSelector,
    device: &'a ScannedDevice,
    scratch: &'a mut [u8; MAX_BLE_ADV_DATA_LENGTH],
) -> Option<&'a [u8]> {
    match selector {
        InputSelector::MacAddress => Some(&device.address.as_bytes()[..]),
        InputSelector::AdDataType { ad_type } => find_ad_field(*ad_type, &device.data),
        InputSelector::MaskedAdDataType { ad_type, mask } => {
            let field = find_ad_field(*ad_type, &device.data)?;
            if field.len() > MAX_BLE_ADV_DATA_LENGTH {
                warn!(len = field.len(), "Advertisement field too large");
                return None;
            }
            let mut gathered = 0;
            for (bit_index, &byte) in field.iter().enumerate() {
                if mask & (1 << bit_index) != 0 {
                    scratch[gathered] = byte;
                    gathered += 1;
                }
            }
            Some(&scratch[..gathered])
        }
    }
}
