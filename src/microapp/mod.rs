//! Microapp Hosting
//!
//! Runs one untrusted user program ("microapp") as a cooperative coroutine
//! next to the node's own logic. Host and guest exchange messages through
//! two fixed 48-byte shared buffers; the guest only ever runs between a
//! host resume and its own yield, and everything it may do is mediated by
//! the request handler.
//!
//! ## Components
//!
//! - [`binary::MicroappStorage`] owns the flash slot, the binary header
//!   checks, and the upload/validate/enable lifecycle.
//! - [`coroutine::Coroutine`] is the resume/yield primitive.
//! - [`supervisor::MicroappSupervisor`] schedules every entry into the
//!   guest and enforces the work bounds.
//! - [`request::MicroappRequestHandler`] decodes guest messages into host
//!   events.

pub mod abi;
pub mod binary;
pub mod coroutine;
pub mod ipc;
pub mod request;
pub mod supervisor;

pub use abi::{Ack, MessageType};
pub use binary::{BinaryHeader, MicroappInfo, MicroappStorage};
pub use coroutine::{Coroutine, GuestEnv, MicroappProgram, ResumeOutcome};
pub use ipc::{ipc_ram_handle, IpcRam, IpcRamHandle, OperatingState};
pub use request::{MicroappRequestHandler, RequestContext};
pub use supervisor::{InterruptRegistry, MicroappSupervisor, RegistryError};

/// Number of microapp slots.
pub const MAX_MICROAPPS: usize = 1;

/// Protocol version of the microapp control command set.
pub const MICROAPP_PROTOCOL: u8 = 1;

/// Ticks between guest continue exchanges.
pub const MICROAPP_LOOP_FREQUENCY: u32 = 10;

/// Maximum extra resumes after a non-yielding request within one exchange.
pub const MICROAPP_MAX_NUMBER_CONSECUTIVE_CALLS: u8 = 8;

/// Maximum soft interrupts raised into the guest within one tick window.
pub const MICROAPP_MAX_SOFT_INTERRUPTS_WITHIN_A_TICK: u8 = 10;

/// Maximum soft-interrupt registrations the guest may hold.
pub const MICROAPP_MAX_SOFT_INTERRUPT_REGISTRATIONS: usize = 10;

/// Number of presence profiles the host tracks.
pub const MAX_PRESENCE_PROFILES: usize = 8;

/// Read-only host state the request handler serves to the guest.
pub trait HostState {
    /// Filtered power usage in milliwatts.
    fn power_usage_milliwatt(&self) -> i32;

    /// Presence bitmask of a profile: one bit per location.
    fn presence_bitmask(&self, profile_id: u8) -> u64;

    /// This node's stone id in the mesh.
    fn stone_id(&self) -> u8;

    /// Read bytes from a TWI slave into `buffer`.
    fn twi_read(&self, address: u8, buffer: &mut [u8]) -> Result<usize, crate::errors::Error> {
        let _ = (address, buffer);
        Err(crate::errors::Error::NotImplemented)
    }
}

/// Fixed host state, for tests and the demo daemon.
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticHostState {
    pub power_usage_milliwatt: i32,
    pub presence: [u64; MAX_PRESENCE_PROFILES],
    pub stone_id: u8,
}

impl HostState for StaticHostState {
    fn power_usage_milliwatt(&self) -> i32 {
        self.power_usage_milliwatt
    }

    fn presence_bitmask(&self, profile_id: u8) -> u64 {
        self.presence
            .get(profile_id as usize)
            .copied()
            .unwrap_or(0)
    }

    fn stone_id(&self) -> u8 {
        self.stone_id
    }
}
