//! Per-asset records and output throttling.
//!
//! The engine would otherwise forward every advertisement of a chatty asset
//! several times per second; the record store remembers recently accepted
//! assets and suppresses output while a per-asset countdown runs. Each
//! forwarded message extends the countdown by however long the forwarder
//! says the mesh needs to absorb it.

use tracing::debug;

use crate::types::{AssetId, MacAddress, ScannedDevice};
use crate::TICK_INTERVAL_MS;

/// Default capacity of the in-RAM record store.
pub const DEFAULT_MAX_RECORDS: usize = 64;

/// Throttling state of one recently seen asset.
#[derive(Clone, Copy, Debug)]
pub struct AssetRecord {
    pub asset_id: AssetId,
    pub address: MacAddress,
    pub last_rssi: i8,
    /// Remaining suppression window in milliseconds.
    pub throttling_countdown_ms: u16,
    /// Tick stamp of the last acceptance, for eviction.
    pub last_seen_tick: u32,
}

impl AssetRecord {
    /// Whether output for this asset is currently suppressed.
    pub fn is_throttled(&self) -> bool {
        self.throttling_countdown_ms > 0
    }
}

/// Interface the engine uses to consult and update records.
///
/// The record store is a collaborator of the engine, not part of it; tests
/// substitute their own implementation to observe throttling decisions.
pub trait AssetStore {
    /// Obtain or refresh the record for an accepted asset.
    ///
    /// Returns `None` when no record could be created.
    fn handle_accepted_asset(
        &mut self,
        device: &ScannedDevice,
        asset_id: AssetId,
    ) -> Option<&mut AssetRecord>;

    /// Extend the asset's suppression window.
    fn add_throttling_bump(&mut self, asset_id: AssetId, bump_ms: u16);
}

/// Bounded in-RAM record store.
///
/// When full, the least recently seen record is evicted.
#[derive(Debug)]
pub struct AssetRecords {
    records: Vec<AssetRecord>,
    max_records: usize,
    tick_counter: u32,
}

impl AssetRecords {
    /// Create a store holding at most `max_records` records.
    pub fn new(max_records: usize) -> Self {
        Self {
            records: Vec::with_capacity(max_records.min(DEFAULT_MAX_RECORDS)),
            max_records,
            tick_counter: 0,
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no records exist.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record without refreshing it.
    pub fn get(&self, asset_id: AssetId) -> Option<&AssetRecord> {
        self.records.iter().find(|record| record.asset_id == asset_id)
    }

    /// Per-tick housekeeping: run down every throttling countdown.
    pub fn tick(&mut self) {
        self.tick_counter = self.tick_counter.wrapping_add(1);
        for record in &mut self.records {
            record.throttling_countdown_ms =
                record.throttling_countdown_ms.saturating_sub(TICK_INTERVAL_MS as u16);
        }
    }
}

impl Default for AssetRecords {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORDS)
    }
}

impl AssetStore for AssetRecords {
    fn handle_accepted_asset(
        &mut self,
        device: &ScannedDevice,
        asset_id: AssetId,
    ) -> Option<&mut AssetRecord> {
        let tick = self.tick_counter;

        if let Some(index) = self
            .records
            .iter()
            .position(|record| record.asset_id == asset_id)
        {
            let record = &mut self.records[index];
            record.address = device.address;
            record.last_rssi = device.rssi;
            record.last_seen_tick = tick;
            return Some(&mut self.records[index]);
        }

        if self.records.len() >= self.max_records {
            // Evict the least recently seen record.
            let oldest = self
                .records
                .iter()
                .enumerate()
                .min_by_key(|(_, record)| record.last_seen_tick)
                .map(|(index, _)| index)?;
            debug!(
                evicted = %self.records[oldest].asset_id,
                "Record store full, evicting oldest"
            );
            self.records.swap_remove(oldest);
        }

        self.records.push(AssetRecord {
            asset_id,
            address: device.address,
            last_rssi: device.rssi,
            throttling_countdown_ms: 0,
            last_seen_tick: tick,
        });
        self.records.last_mut()
    }

    fn add_throttling_bump(&mut self, asset_id: AssetId, bump_ms: u16) {
        if let Some(record) = self
            .records
            .iter_mut()
            .find(|record| record.asset_id == asset_id)
        {
            record.throttling_countdown_ms =
                record.throttling_countdown_ms.saturating_add(bump_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(seed: u8) -> ScannedDevice {
        ScannedDevice::new(
            MacAddress::from_bytes([seed, 2, 3, 4, 5, 6]),
            -60,
            Vec::new(),
        )
    }

    fn id(seed: u8) -> AssetId {
        AssetId::from_bytes([seed, 0, 0])
    }

    #[test]
    fn test_record_created_unthrottled() {
        let mut records = AssetRecords::new(4);
        let record = records.handle_accepted_asset(&device(1), id(1)).unwrap();
        assert!(!record.is_throttled());
    }

    #[test]
    fn test_bump_then_tick_down() {
        let mut records = AssetRecords::new(4);
        records.handle_accepted_asset(&device(1), id(1));
        records.add_throttling_bump(id(1), 250);
        assert!(records.get(id(1)).unwrap().is_throttled());

        // 100 ms per tick: throttled for two more ticks, clear on the third.
        records.tick();
        records.tick();
        assert!(records.get(id(1)).unwrap().is_throttled());
        records.tick();
        assert!(!records.get(id(1)).unwrap().is_throttled());
    }

    #[test]
    fn test_eviction_of_oldest() {
        let mut records = AssetRecords::new(2);
        records.handle_accepted_asset(&device(1), id(1));
        records.tick();
        records.handle_accepted_asset(&device(2), id(2));
        records.tick();
        records.handle_accepted_asset(&device(3), id(3));

        assert_eq!(records.len(), 2);
        assert!(records.get(id(1)).is_none());
        assert!(records.get(id(2)).is_some());
        assert!(records.get(id(3)).is_some());
    }

    #[test]
    fn test_bump_saturates() {
        let mut records = AssetRecords::new(2);
        records.handle_accepted_asset(&device(1), id(1));
        records.add_throttling_bump(id(1), u16::MAX);
        records.add_throttling_bump(id(1), 100);
        assert_eq!(records.get(id(1)).unwrap().throttling_countdown_ms, u16::MAX);
    }
}
