//! Core value types shared across the filtering and microapp subsystems.

use std::fmt;

/// Length of a BLE MAC address in bytes.
pub const MAC_ADDRESS_LENGTH: usize = 6;

/// Length of a short asset identifier in bytes.
pub const ASSET_ID_LENGTH: usize = 3;

/// Maximum size of a BLE advertisement payload.
pub const MAX_BLE_ADV_DATA_LENGTH: usize = 31;

/// A BLE device address.
///
/// Stored in over-the-air byte order (least significant byte first), which is
/// also how the scanner hands it to us. `Display` prints the conventional
/// most-significant-first colon notation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; MAC_ADDRESS_LENGTH]);

impl MacAddress {
    /// Create an address from raw bytes in over-the-air order.
    pub fn from_bytes(bytes: [u8; MAC_ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw bytes in over-the-air order.
    pub fn as_bytes(&self) -> &[u8; MAC_ADDRESS_LENGTH] {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[5], self.0[4], self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({})", self)
    }
}

/// Short identifier a filter body derives from advertisement bytes.
///
/// Three bytes is enough to distinguish the assets a single sphere tracks
/// while keeping mesh messages small.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AssetId([u8; ASSET_ID_LENGTH]);

impl AssetId {
    /// Create an asset id from raw bytes.
    pub fn from_bytes(bytes: [u8; ASSET_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Derive an asset id from a 32-bit hash: the low three bytes,
    /// little-endian.
    pub fn from_crc32(hash: u32) -> Self {
        let le = hash.to_le_bytes();
        Self([le[0], le[1], le[2]])
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; ASSET_ID_LENGTH] {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}:{:02X}:{:02X}", self.0[0], self.0[1], self.0[2])
    }
}

impl fmt::Debug for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetId({})", self)
    }
}

/// A scanned BLE advertisement as delivered by the radio.
#[derive(Clone, Debug)]
pub struct ScannedDevice {
    /// Peer address in over-the-air order.
    pub address: MacAddress,
    /// Address type (public, random, ...) as reported by the scanner.
    pub address_type: u8,
    /// Received signal strength in dBm.
    pub rssi: i8,
    /// Advertisement payload: a sequence of AD structures.
    pub data: Vec<u8>,
}

impl ScannedDevice {
    /// Create a scanned device record.
    pub fn new(address: MacAddress, rssi: i8, data: Vec<u8>) -> Self {
        Self {
            address,
            address_type: 0,
            rssi,
            data,
        }
    }
}
