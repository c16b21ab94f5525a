//! IPC frames and the reserved RAM page.
//!
//! Two fixed 48-byte buffers carry messages between host and guest; their
//! ownership alternates strictly with the coroutine handoff, so the host
//! only locks them while the guest is suspended.
//!
//! The reserved RAM page survives a watchdog reset. The host writes the
//! guest's operating state into it around every resume; finding `Running`
//! there at boot means the previous boot died inside the guest, and the
//! recovery policy is to disable the guest.

use std::sync::Arc;

use parking_lot::Mutex;

use super::abi::MAX_PAYLOAD;
use super::MAX_MICROAPPS;

/// Protocol version of the boot data the host leaves for the guest.
pub const IPC_DATA_PROTOCOL: u8 = 1;

/// Major version of the reboot data layout.
pub const REBOOT_DATA_MAJOR: u8 = 1;

/// Minor version of the reboot data layout.
pub const REBOOT_DATA_MINOR: u8 = 0;

/// The dual message buffers shared between host and guest.
#[derive(Clone, Debug)]
pub struct IoBuffers {
    /// Guest-to-host payload.
    pub guest_to_host: [u8; MAX_PAYLOAD],
    /// Host-to-guest payload.
    pub host_to_guest: [u8; MAX_PAYLOAD],
}

impl IoBuffers {
    pub fn new() -> Self {
        Self {
            guest_to_host: [0; MAX_PAYLOAD],
            host_to_guest: [0; MAX_PAYLOAD],
        }
    }
}

impl Default for IoBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to the IPC frames.
///
/// The mutex enforces the alternation contract at the language level; by
/// protocol it is never contended, because the host only locks while the
/// guest is suspended and the guest only locks while running.
pub type SharedIoBuffers = Arc<Mutex<IoBuffers>>;

/// Create a fresh pair of zeroed IPC frames.
pub fn shared_io_buffers() -> SharedIoBuffers {
    Arc::new(Mutex::new(IoBuffers::new()))
}

/// Whether the guest was running when the node last went down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatingState {
    NotRunning,
    Running,
}

/// Boot data the host leaves for the guest before first entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootData {
    /// Protocol version the guest checks before calling back.
    pub data_protocol: u8,
    /// Address of the host's yield entry point, as seen by the guest.
    pub callback_address: u32,
}

/// Reboot-surviving data: per-guest operating state plus layout version.
#[derive(Clone, Copy, Debug)]
struct RebootData {
    major: u8,
    minor: u8,
    running: [bool; MAX_MICROAPPS],
}

/// The reserved RAM page.
///
/// Modeled as a small struct behind a shared handle; the node creates it at
/// boot and it outlives any one supervisor, which is what lets a freshly
/// constructed supervisor observe the previous boot's state.
#[derive(Debug)]
pub struct IpcRam {
    boot_data: Option<BootData>,
    reboot_data: Option<RebootData>,
}

impl IpcRam {
    pub fn new() -> Self {
        Self {
            boot_data: None,
            reboot_data: None,
        }
    }

    /// Write the boot data for the guest.
    pub fn set_boot_data(&mut self, boot_data: BootData) {
        self.boot_data = Some(boot_data);
    }

    /// Read the boot data, as the guest does on startup.
    pub fn boot_data(&self) -> Option<BootData> {
        self.boot_data
    }

    /// Record the operating state of one guest.
    pub fn set_operating_state(&mut self, app_index: usize, state: OperatingState) {
        if app_index >= MAX_MICROAPPS {
            return;
        }
        let mut data = self.reboot_data.unwrap_or(RebootData {
            major: REBOOT_DATA_MAJOR,
            minor: REBOOT_DATA_MINOR,
            running: [false; MAX_MICROAPPS],
        });
        data.major = REBOOT_DATA_MAJOR;
        data.minor = REBOOT_DATA_MINOR;
        data.running[app_index] = state == OperatingState::Running;
        self.reboot_data = Some(data);
    }

    /// Layout version of the stored reboot data, if any was written.
    pub fn reboot_data_version(&self) -> Option<(u8, u8)> {
        self.reboot_data.map(|data| (data.major, data.minor))
    }

    /// Read the operating state of one guest.
    ///
    /// Data written by an incompatible layout version reads as
    /// `NotRunning`; an over-eager crash verdict would disable a healthy
    /// guest.
    pub fn operating_state(&self, app_index: usize) -> OperatingState {
        if app_index >= MAX_MICROAPPS {
            return OperatingState::NotRunning;
        }
        match self.reboot_data {
            Some(data) if data.major == REBOOT_DATA_MAJOR => {
                if data.running[app_index] {
                    OperatingState::Running
                } else {
                    OperatingState::NotRunning
                }
            }
            _ => OperatingState::NotRunning,
        }
    }
}

impl Default for IpcRam {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to the reserved page.
pub type IpcRamHandle = Arc<Mutex<IpcRam>>;

/// Create a fresh reserved page.
pub fn ipc_ram_handle() -> IpcRamHandle {
    Arc::new(Mutex::new(IpcRam::new()))
}
