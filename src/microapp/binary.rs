//! Microapp binary header and slot storage.
//!
//! A microapp ships as a flat binary whose first 20 bytes are a packed
//! little-endian header:
//!
//! ```text
//! offset size  field
//! 0      4     start_address
//! 4      1     sdk_version_major
//! 5      1     sdk_version_minor
//! 6      2     size              (binary including this header)
//! 8      2     checksum          (over bytes after the header)
//! 10     2     checksum_header   (over the header with this field zero)
//! 12     4     app_build_version
//! 16     4     reserved (0)
//! ```
//!
//! The storage owns the flash slot the binary lives in and its lifecycle:
//! chunked upload, checksum validation, enable/disable, removal, and the
//! info query. A slot may only be started when it is enabled and validated.

use tracing::{info, warn};

use crate::errors::{CmdOk, CmdResult, Error};
use crate::util::crc16;

use super::{MAX_MICROAPPS, MICROAPP_PROTOCOL};

/// Size of the binary header.
pub const BINARY_HEADER_SIZE: usize = 20;

/// Virtual base address of the microapp flash region.
pub const MICROAPP_FLASH_BASE: u32 = 0x0006_9000;

/// Flash slot size per microapp.
pub const MICROAPP_MAX_SIZE: usize = 0x2000;

/// RAM region size per microapp.
pub const MICROAPP_RAM_SIZE: usize = 0x1000;

/// Maximum upload chunk size.
pub const MICROAPP_UPLOAD_MAX_CHUNK_SIZE: usize = 256;

/// SDK major version this host supports.
pub const SUPPORTED_SDK_MAJOR: u8 = 1;

/// SDK minor version this host supports.
pub const SUPPORTED_SDK_MINOR: u8 = 0;

/// Parsed binary header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BinaryHeader {
    pub start_address: u32,
    pub sdk_version_major: u8,
    pub sdk_version_minor: u8,
    pub size: u16,
    pub checksum: u16,
    pub checksum_header: u16,
    pub app_build_version: u32,
    pub reserved: u32,
}

impl BinaryHeader {
    /// Parse the header from the start of a binary image.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < BINARY_HEADER_SIZE {
            return Err(Error::WrongPayloadLength);
        }
        Ok(Self {
            start_address: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            sdk_version_major: bytes[4],
            sdk_version_minor: bytes[5],
            size: u16::from_le_bytes([bytes[6], bytes[7]]),
            checksum: u16::from_le_bytes([bytes[8], bytes[9]]),
            checksum_header: u16::from_le_bytes([bytes[10], bytes[11]]),
            app_build_version: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            reserved: u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
        })
    }

    /// Serialize the header.
    pub fn to_bytes(&self) -> [u8; BINARY_HEADER_SIZE] {
        let mut out = [0u8; BINARY_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.start_address.to_le_bytes());
        out[4] = self.sdk_version_major;
        out[5] = self.sdk_version_minor;
        out[6..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..10].copy_from_slice(&self.checksum.to_le_bytes());
        out[10..12].copy_from_slice(&self.checksum_header.to_le_bytes());
        out[12..16].copy_from_slice(&self.app_build_version.to_le_bytes());
        out[16..20].copy_from_slice(&self.reserved.to_le_bytes());
        out
    }

    /// CRC-16 of the header with the `checksum_header` field zeroed.
    pub fn compute_header_checksum(header_bytes: &[u8]) -> u16 {
        let mut copy = [0u8; BINARY_HEADER_SIZE];
        copy.copy_from_slice(&header_bytes[..BINARY_HEADER_SIZE]);
        copy[10] = 0;
        copy[11] = 0;
        crc16(&copy, None)
    }
}

/// Outcome of a validation test.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TestState {
    #[default]
    Untested,
    Passed,
    Failed,
}

/// Outcome of the boot test.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BootTestState {
    #[default]
    Untested,
    /// Entry was attempted; still set at boot means the guest took the
    /// node down.
    Trying,
    Passed,
    Failed,
}

/// Lifecycle state of a slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MicroappState {
    pub enabled: bool,
    pub checksum_test: TestState,
    pub boot_test: BootTestState,
}

/// Chunked microapp upload command.
#[derive(Clone, Debug)]
pub struct UploadMicroappCommand<'a> {
    pub protocol: u8,
    pub app_index: u8,
    pub offset: u16,
    pub data: &'a [u8],
}

/// Header shared by the remaining microapp control commands.
#[derive(Clone, Copy, Debug)]
pub struct MicroappCtrlCommand {
    pub protocol: u8,
    pub app_index: u8,
}

/// Status of one slot, as reported by the info query.
#[derive(Clone, Copy, Debug)]
pub struct MicroappStatus {
    pub build_version: u32,
    pub sdk_version_major: u8,
    pub sdk_version_minor: u8,
    pub state: MicroappState,
}

/// Response of the info query.
#[derive(Clone, Debug)]
pub struct MicroappInfo {
    pub protocol: u8,
    pub max_apps: u8,
    pub max_app_size: u16,
    pub max_chunk_size: u16,
    pub max_ram_usage: u16,
    pub sdk_version_major: u8,
    pub sdk_version_minor: u8,
    pub apps: Vec<MicroappStatus>,
}

/// Owns the flash slot of the single supported microapp.
#[derive(Debug)]
pub struct MicroappStorage {
    /// Slot contents; erased flash reads as 0xFF.
    slot: Vec<u8>,
    state: MicroappState,
}

impl MicroappStorage {
    /// Create storage with an erased slot.
    pub fn new() -> Self {
        Self {
            slot: vec![0xFF; MICROAPP_MAX_SIZE],
            state: MicroappState::default(),
        }
    }

    /// Current slot state.
    pub fn state(&self) -> MicroappState {
        self.state
    }

    /// Whether the slot may be started: enabled, validated, and not
    /// implicated in a previous crash.
    pub fn is_startable(&self) -> bool {
        self.state.enabled
            && self.state.checksum_test == TestState::Passed
            && self.state.boot_test != BootTestState::Failed
    }

    /// Record the outcome of a boot attempt.
    pub fn set_boot_test(&mut self, state: BootTestState) {
        self.state.boot_test = state;
    }

    /// Disable the slot. Used both by the disable command and by crash
    /// recovery.
    pub fn disable(&mut self) {
        self.state.enabled = false;
    }

    /// Parse the binary header of the stored image.
    pub fn header(&self) -> Result<BinaryHeader, Error> {
        BinaryHeader::parse(&self.slot)
    }

    /// Raw slot bytes.
    pub fn slot_bytes(&self) -> &[u8] {
        &self.slot
    }

    /// Whether `address` lies within the flash slot of `app_index`.
    pub fn check_flash_bounds(app_index: usize, address: u32) -> Result<(), Error> {
        if app_index >= MAX_MICROAPPS {
            return Err(Error::Unsafe);
        }
        let low = MICROAPP_FLASH_BASE + (app_index * MICROAPP_MAX_SIZE) as u32;
        let high = low + MICROAPP_MAX_SIZE as u32;
        if address < low || address > high {
            return Err(Error::Unsafe);
        }
        Ok(())
    }

    // === Command interface ===

    /// Store one chunk of a microapp binary.
    ///
    /// Any upload invalidates the slot: it is disabled and must be
    /// re-validated and re-enabled before it can run.
    pub fn handle_upload(&mut self, cmd: &UploadMicroappCommand<'_>) -> CmdResult {
        if cmd.protocol != MICROAPP_PROTOCOL {
            return Err(Error::ProtocolUnsupported(cmd.protocol));
        }
        if cmd.app_index as usize >= MAX_MICROAPPS {
            return Err(Error::NotFound);
        }
        if cmd.offset % 4 != 0 {
            return Err(Error::InvalidMessage);
        }
        if cmd.data.len() > MICROAPP_UPLOAD_MAX_CHUNK_SIZE {
            return Err(Error::WrongPayloadLength);
        }
        let end = cmd.offset as usize + cmd.data.len();
        if end > MICROAPP_MAX_SIZE {
            return Err(Error::NoSpace);
        }

        self.state = MicroappState::default();
        self.slot[cmd.offset as usize..end].copy_from_slice(cmd.data);
        Ok(CmdOk::Success)
    }

    /// Validate the stored binary against its header checksums.
    pub fn handle_validate(&mut self, cmd: &MicroappCtrlCommand) -> CmdResult {
        if cmd.protocol != MICROAPP_PROTOCOL {
            return Err(Error::ProtocolUnsupported(cmd.protocol));
        }
        if cmd.app_index as usize >= MAX_MICROAPPS {
            return Err(Error::NotFound);
        }

        let header = self.header()?;
        let size = header.size as usize;
        if size < BINARY_HEADER_SIZE || size > MICROAPP_MAX_SIZE {
            warn!(size, "Microapp binary size out of range");
            self.state.checksum_test = TestState::Failed;
            return Err(Error::InvalidMessage);
        }

        let header_crc = BinaryHeader::compute_header_checksum(&self.slot);
        if header_crc != header.checksum_header {
            warn!(
                computed = format_args!("{:#06X}", header_crc),
                stored = format_args!("{:#06X}", header.checksum_header),
                "Microapp header checksum mismatch"
            );
            self.state.checksum_test = TestState::Failed;
            return Err(Error::Mismatch);
        }

        let payload_crc = crc16(&self.slot[BINARY_HEADER_SIZE..size], None);
        if payload_crc != header.checksum {
            warn!(
                computed = format_args!("{:#06X}", payload_crc),
                stored = format_args!("{:#06X}", header.checksum),
                "Microapp payload checksum mismatch"
            );
            self.state.checksum_test = TestState::Failed;
            return Err(Error::Mismatch);
        }

        self.state.checksum_test = TestState::Passed;
        info!(
            build_version = header.app_build_version,
            size, "Microapp binary validated"
        );
        Ok(CmdOk::Success)
    }

    /// Enable the slot for starting.
    pub fn handle_enable(&mut self, cmd: &MicroappCtrlCommand) -> CmdResult {
        if cmd.protocol != MICROAPP_PROTOCOL {
            return Err(Error::ProtocolUnsupported(cmd.protocol));
        }
        if cmd.app_index as usize >= MAX_MICROAPPS {
            return Err(Error::NotFound);
        }
        if self.state.checksum_test != TestState::Passed {
            return Err(Error::WrongState);
        }
        let header = self.header()?;
        if header.sdk_version_major != SUPPORTED_SDK_MAJOR {
            warn!(
                sdk_major = header.sdk_version_major,
                supported = SUPPORTED_SDK_MAJOR,
                "Microapp SDK version unsupported"
            );
            return Err(Error::ProtocolUnsupported(header.sdk_version_major));
        }
        if self.state.enabled {
            return Ok(CmdOk::NoChange);
        }
        self.state.enabled = true;
        self.state.boot_test = BootTestState::Untested;
        info!("Microapp enabled");
        Ok(CmdOk::Success)
    }

    /// Disable the slot.
    pub fn handle_disable(&mut self, cmd: &MicroappCtrlCommand) -> CmdResult {
        if cmd.protocol != MICROAPP_PROTOCOL {
            return Err(Error::ProtocolUnsupported(cmd.protocol));
        }
        if cmd.app_index as usize >= MAX_MICROAPPS {
            return Err(Error::NotFound);
        }
        if !self.state.enabled {
            return Ok(CmdOk::NoChange);
        }
        self.state.enabled = false;
        info!("Microapp disabled");
        Ok(CmdOk::Success)
    }

    /// Erase the slot.
    pub fn handle_remove(&mut self, cmd: &MicroappCtrlCommand) -> CmdResult {
        if cmd.protocol != MICROAPP_PROTOCOL {
            return Err(Error::ProtocolUnsupported(cmd.protocol));
        }
        if cmd.app_index as usize >= MAX_MICROAPPS {
            return Err(Error::NotFound);
        }
        if self.slot.iter().all(|&byte| byte == 0xFF) {
            return Ok(CmdOk::NoChange);
        }
        self.slot.fill(0xFF);
        self.state = MicroappState::default();
        info!("Microapp removed");
        Ok(CmdOk::Success)
    }

    /// Info about supported microapps and the status of this slot.
    pub fn info(&self) -> MicroappInfo {
        let status = match self.header() {
            Ok(header) => MicroappStatus {
                build_version: header.app_build_version,
                sdk_version_major: header.sdk_version_major,
                sdk_version_minor: header.sdk_version_minor,
                state: self.state,
            },
            Err(_) => MicroappStatus {
                build_version: 0,
                sdk_version_major: 0,
                sdk_version_minor: 0,
                state: self.state,
            },
        };
        MicroappInfo {
            protocol: MICROAPP_PROTOCOL,
            max_apps: MAX_MICROAPPS as u8,
            max_app_size: MICROAPP_MAX_SIZE as u16,
            max_chunk_size: MICROAPP_UPLOAD_MAX_CHUNK_SIZE as u16,
            max_ram_usage: MICROAPP_RAM_SIZE as u16,
            sdk_version_major: SUPPORTED_SDK_MAJOR,
            sdk_version_minor: SUPPORTED_SDK_MINOR,
            apps: vec![status],
        }
    }
}

impl Default for MicroappStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a valid binary image around a payload: header with both checksums
/// filled in. Used by tests and upload tooling.
pub fn build_binary_image(
    start_address: u32,
    app_build_version: u32,
    payload: &[u8],
) -> Vec<u8> {
    let size = (BINARY_HEADER_SIZE + payload.len()) as u16;
    let mut header = BinaryHeader {
        start_address,
        sdk_version_major: SUPPORTED_SDK_MAJOR,
        sdk_version_minor: SUPPORTED_SDK_MINOR,
        size,
        checksum: crc16(payload, None),
        checksum_header: 0,
        app_build_version,
        reserved: 0,
    };
    header.checksum_header = BinaryHeader::compute_header_checksum(&header.to_bytes());
    let mut image = header.to_bytes().to_vec();
    image.extend_from_slice(payload);
    image
}
