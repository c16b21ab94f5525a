//! Forwarding seam between the filter engine and the mesh.
//!
//! The engine decides *that* an accepted asset should be forwarded; how the
//! message leaves the node is a transport concern. Each forwarding call
//! reports how many milliseconds of throttling the mesh wants in return,
//! which the engine adds to the asset's record.

use tracing::debug;

use crate::bus::{Event, EventQueue};
use crate::types::{AssetId, ScannedDevice};

/// Mesh payload tag for a forwarded MAC address.
const MESH_TAG_ASSET_MAC: u8 = 0x01;

/// Mesh payload tag for a forwarded asset id.
const MESH_TAG_ASSET_ID: u8 = 0x02;

/// Mesh payload tag for an asset id routed through nearest-node
/// arbitration.
const MESH_TAG_ASSET_ID_NEAREST: u8 = 0x03;

/// Default throttling granted per forwarded message, in milliseconds.
pub const DEFAULT_THROTTLE_BUMP_MS: u16 = 1000;

/// Outbound side of the engine.
pub trait AssetForwarder {
    /// Forward the device's MAC address. Returns the throttling bump in ms.
    fn forward_mac(&mut self, bus: &mut EventQueue, device: &ScannedDevice) -> u16;

    /// Forward the derived asset id. Returns the throttling bump in ms.
    fn forward_asset_id(
        &mut self,
        bus: &mut EventQueue,
        device: &ScannedDevice,
        asset_id: AssetId,
        filter_bitmask: u8,
    ) -> u16;

    /// Forward the asset id through nearest-node arbitration. Returns the
    /// throttling bump in ms.
    fn forward_nearest_asset_id(
        &mut self,
        bus: &mut EventQueue,
        device: &ScannedDevice,
        asset_id: AssetId,
        filter_bitmask: u8,
    ) -> u16;
}

/// Forwarder that emits broadcast mesh messages.
#[derive(Debug)]
pub struct MeshForwarder {
    throttle_bump_ms: u16,
}

impl MeshForwarder {
    /// Create a forwarder granting `throttle_bump_ms` per message.
    pub fn new(throttle_bump_ms: u16) -> Self {
        Self { throttle_bump_ms }
    }
}

impl Default for MeshForwarder {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE_BUMP_MS)
    }
}

impl AssetForwarder for MeshForwarder {
    fn forward_mac(&mut self, bus: &mut EventQueue, device: &ScannedDevice) -> u16 {
        let mut payload = Vec::with_capacity(8);
        payload.push(MESH_TAG_ASSET_MAC);
        payload.extend_from_slice(device.address.as_bytes());
        payload.push(device.rssi as u8);
        debug!(address = %device.address, "Forwarding asset MAC over mesh");
        bus.push(Event::MeshOutbound {
            stone_id: 0,
            payload,
        });
        self.throttle_bump_ms
    }

    fn forward_asset_id(
        &mut self,
        bus: &mut EventQueue,
        device: &ScannedDevice,
        asset_id: AssetId,
        filter_bitmask: u8,
    ) -> u16 {
        let mut payload = Vec::with_capacity(7);
        payload.push(MESH_TAG_ASSET_ID);
        payload.extend_from_slice(asset_id.as_bytes());
        payload.push(filter_bitmask);
        payload.push(device.rssi as u8);
        debug!(asset_id = %asset_id, "Forwarding asset id over mesh");
        bus.push(Event::MeshOutbound {
            stone_id: 0,
            payload,
        });
        self.throttle_bump_ms
    }

    fn forward_nearest_asset_id(
        &mut self,
        bus: &mut EventQueue,
        device: &ScannedDevice,
        asset_id: AssetId,
        filter_bitmask: u8,
    ) -> u16 {
        let mut payload = Vec::with_capacity(7);
        payload.push(MESH_TAG_ASSET_ID_NEAREST);
        payload.extend_from_slice(asset_id.as_bytes());
        payload.push(filter_bitmask);
        payload.push(device.rssi as u8);
        debug!(asset_id = %asset_id, "Forwarding nearest asset id over mesh");
        bus.push(Event::MeshOutbound {
            stone_id: 0,
            payload,
        });
        self.throttle_bump_ms
    }
}
