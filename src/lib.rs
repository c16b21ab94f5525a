//! Emberstone node runtime core.
//!
//! The Emberstone is a smart-plug / smart-lighting mesh node. This crate is
//! the part of its firmware where the runtime contract lives:
//!
//! - **Asset filtering** ([`assets`]): a versioned, operator-uploaded set
//!   of filters applied to every scanned BLE advertisement, with per-asset
//!   output throttling. Filter bodies are deterministic [`cuckoo`] filters
//!   or exact-match sets.
//! - **Microapp hosting** ([`microapp`]): one untrusted user program run as
//!   a cooperative coroutine over a 48-byte shared-memory message ABI, with
//!   bounded work per tick and a crash-survival state machine.
//! - **Node assembly** ([`node`]): explicit construction of every component
//!   at boot and the cooperative tick loop that drives them.
//!
//! Everything else a real node needs (radio, mesh transport, drivers,
//! flash) is an external collaborator reached through [`bus::Event`]s and
//! small traits.

pub mod assets;
pub mod bus;
pub mod config;
pub mod cuckoo;
pub mod errors;
pub mod microapp;
pub mod node;
pub mod types;
pub mod util;

pub use bus::{Event, EventQueue};
pub use config::{ConfigError, NodeConfig};
pub use errors::{CmdOk, CmdResult, Error};
pub use node::{Node, NodeCommand, NodeError};
pub use types::{AssetId, MacAddress, ScannedDevice};

/// Milliseconds between ticks of the cooperative loop.
pub const TICK_INTERVAL_MS: u64 = 100;

/// Ticks per second, derived from [`TICK_INTERVAL_MS`].
pub const TICKS_PER_SECOND: usize = (1000 / TICK_INTERVAL_MS) as usize;
