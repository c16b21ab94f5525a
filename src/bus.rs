//! Internal event queue.
//!
//! The core components never talk to drivers, the mesh, or each other
//! directly; they push events into a FIFO queue handed to them by the caller,
//! and the node drains the queue after each unit of work. This keeps every
//! component constructible in isolation and makes event ordering observable
//! in tests.

use std::collections::VecDeque;

use crate::types::{AssetId, MacAddress, ScannedDevice};

/// Requested GPIO pin direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpioDirection {
    Input,
    /// Input with edge detection; generates sense events.
    Sense,
    Output,
}

/// Edge polarity for sense pins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpioPolarity {
    None,
    LowToHigh,
    HighToLow,
    Toggle,
}

/// Events produced by the core components.
///
/// Consumers (drivers, mesh transport, UART, downstream trackers) live
/// outside the core; the node routes drained events to them.
#[derive(Clone, Debug)]
pub enum Event {
    /// An advertisement passed at least one accepting filter. Carries the
    /// combined output bitmask of every filter that accepted it.
    AssetAccepted {
        filter_id: u8,
        asset_id: AssetId,
        accepted_bitmask: u32,
        device: ScannedDevice,
    },

    /// The filter set was committed and is now in effect.
    FiltersCommitted { master_version: u16, master_crc: u32 },

    /// The store's modification-in-progress state changed.
    FilterModificationInProgress(bool),

    /// Switch the relay / dimmer.
    SwitchCommand { value: u8 },

    /// Initialize a GPIO pin.
    GpioInit {
        pin: u8,
        direction: GpioDirection,
        pull_up: bool,
        polarity: GpioPolarity,
    },

    /// Write a level to a GPIO pin.
    GpioWrite { pin: u8, value: u8 },

    /// Initialize the TWI (i2c) peripheral.
    TwiInit,

    /// Write bytes to a TWI slave.
    TwiWrite {
        address: u8,
        data: Vec<u8>,
        stop: bool,
    },

    /// Send a mesh message. `stone_id` 0 means broadcast.
    MeshOutbound { stone_id: u8, payload: Vec<u8> },

    /// Advertise microapp service data.
    MicroappAdvertise { app_uuid: u16, data: Vec<u8> },

    /// A control command issued by the microapp.
    ControlCommand {
        protocol: u8,
        command_type: u16,
        data: Vec<u8>,
    },

    /// Initiate a BLE central connection.
    BleCentralConnect { address: MacAddress },
}

/// FIFO event queue drained by the node loop.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    pub fn push(&mut self, event: Event) {
        self.events.push_back(event);
    }

    /// Pop the oldest event.
    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drain all queued events in FIFO order.
    pub fn drain(&mut self) -> impl Iterator<Item = Event> + '_ {
        self.events.drain(..)
    }
}
