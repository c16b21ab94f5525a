//! Microapp supervisor.
//!
//! Drives the guest coroutine: starts it after validating the binary,
//! resumes it on a fixed cadence, dispatches its requests, raises soft
//! interrupts into it, and keeps the crash-survival flag in the reserved
//! IPC page current around every resume.
//!
//! Work per tick is bounded twice over: a guest that keeps issuing requests
//! is cut off after a fixed number of consecutive resumes, and interrupts
//! stop once the per-tick budget or the guest's advertised free slots run
//! out. A guest that misbehaves beyond that (bad entry address, returning
//! instead of yielding) is disabled; the host stays up.

use thiserror::Error as ThisError;
use tracing::{debug, error, info, warn};

use crate::bus::EventQueue;
use crate::errors::{CmdOk, Error};

use super::abi::{
    self, ble, mesh, write_ack, write_header, Ack, BleMessage, MeshMessage, MessageType,
    PinRequest, MAX_PAYLOAD,
};
use super::binary::MicroappStorage;
use super::coroutine::{Coroutine, MicroappProgram, ResumeOutcome};
use super::ipc::{
    shared_io_buffers, BootData, IpcRamHandle, OperatingState, SharedIoBuffers, IPC_DATA_PROTOCOL,
};
use super::request::{MicroappRequestHandler, RequestContext};
use super::{
    HostState, MICROAPP_LOOP_FREQUENCY, MICROAPP_MAX_NUMBER_CONSECUTIVE_CALLS,
    MICROAPP_MAX_SOFT_INTERRUPTS_WITHIN_A_TICK, MICROAPP_MAX_SOFT_INTERRUPT_REGISTRATIONS,
};

/// Virtual address the guest uses to call back into the host.
const CALLBACK_ADDRESS: u32 = 0x0002_0001;

/// Errors of the soft-interrupt registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ThisError)]
pub enum RegistryError {
    #[error("interrupt already registered")]
    AlreadyExists,

    #[error("no interrupt registration slots left")]
    NoSpace,
}

/// Soft-interrupt registrations: (message type, id) pairs the guest
/// declared interest in.
#[derive(Debug, Default)]
pub struct InterruptRegistry {
    registrations: Vec<(u8, u8)>,
}

impl InterruptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in an interrupt.
    pub fn register(&mut self, message_type: u8, id: u8) -> Result<(), RegistryError> {
        if self.is_registered(message_type, id) {
            info!(message_type, id, "Interrupt already registered");
            return Err(RegistryError::AlreadyExists);
        }
        if self.registrations.len() >= MICROAPP_MAX_SOFT_INTERRUPT_REGISTRATIONS {
            warn!("No empty interrupt registration slots left");
            return Err(RegistryError::NoSpace);
        }
        self.registrations.push((message_type, id));
        debug!(message_type, id, "Registered soft interrupt");
        Ok(())
    }

    /// Whether the pair is registered.
    pub fn is_registered(&self, message_type: u8, id: u8) -> bool {
        self.registrations.contains(&(message_type, id))
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Drop all registrations.
    pub fn clear(&mut self) {
        self.registrations.clear();
    }
}

/// Hosts the guest coroutine and schedules every entry into it.
pub struct MicroappSupervisor {
    io: SharedIoBuffers,
    ipc: IpcRamHandle,
    coroutine: Option<Coroutine>,
    registry: InterruptRegistry,
    scanning: bool,
    tick_counter: u32,
    soft_interrupt_counter: u8,
    empty_interrupt_slots: u8,
    consecutive_call_counter: u8,
}

impl MicroappSupervisor {
    /// Create a supervisor around the given reserved IPC page.
    pub fn new(ipc: IpcRamHandle) -> Self {
        Self {
            io: shared_io_buffers(),
            ipc,
            coroutine: None,
            registry: InterruptRegistry::new(),
            scanning: false,
            tick_counter: 0,
            soft_interrupt_counter: 0,
            empty_interrupt_slots: 1,
            consecutive_call_counter: 0,
        }
    }

    /// Shared handle to the IPC frames, for tests and guest construction.
    pub fn io_buffers(&self) -> SharedIoBuffers {
        self.io.clone()
    }

    /// Whether a guest is currently hosted.
    pub fn is_running(&self) -> bool {
        self.coroutine.is_some()
    }

    /// Whether the guest is currently scanning.
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// The guest's advertised number of free interrupt slots.
    pub fn empty_interrupt_slots(&self) -> u8 {
        self.empty_interrupt_slots
    }

    /// Registry accessor for tests.
    pub fn registry(&self) -> &InterruptRegistry {
        &self.registry
    }

    /// Apply the crash-survival policy at boot.
    ///
    /// If the reserved page says the previous boot died while the guest was
    /// running, the guest is disabled. Returns whether recovery fired.
    pub fn recover_from_reboot(&self, storage: &mut MicroappStorage) -> bool {
        let mut ipc = self.ipc.lock();
        if ipc.operating_state(0) == OperatingState::Running {
            warn!("Previous boot died inside the microapp, disabling it");
            storage.set_boot_test(super::binary::BootTestState::Failed);
            storage.disable();
            ipc.set_operating_state(0, OperatingState::NotRunning);
            return true;
        }
        false
    }

    /// Start the guest.
    ///
    /// Validates the slot and the binary's entry address, writes the boot
    /// data into the reserved page, and runs the guest up to its first
    /// yield.
    pub fn start(
        &mut self,
        storage: &mut MicroappStorage,
        program: Box<dyn MicroappProgram>,
    ) -> Result<(), Error> {
        if self.coroutine.is_some() {
            return Err(Error::Busy);
        }
        if !storage.is_startable() {
            info!("Microapp not startable");
            return Err(Error::WrongState);
        }

        let header = storage.header()?;
        MicroappStorage::check_flash_bounds(0, header.start_address).map_err(|error| {
            error!(
                start_address = format_args!("{:#010X}", header.start_address),
                "Microapp entry address outside its flash slot"
            );
            error
        })?;

        {
            let mut ipc = self.ipc.lock();
            ipc.set_boot_data(BootData {
                data_protocol: IPC_DATA_PROTOCOL,
                callback_address: CALLBACK_ADDRESS,
            });
        }

        storage.set_boot_test(super::binary::BootTestState::Trying);
        info!(
            start_address = format_args!("{:#010X}", header.start_address),
            build_version = header.app_build_version,
            "Starting microapp"
        );

        let coroutine = Coroutine::spawn(program, self.io.clone())
            .map_err(|_| Error::NoSpace)?;
        self.coroutine = Some(coroutine);

        // Run the guest's setup up to its first yield.
        if !self.call_microapp() {
            error!("Microapp ended during setup");
            storage.set_boot_test(super::binary::BootTestState::Failed);
            storage.disable();
            self.coroutine = None;
            return Err(Error::Unsafe);
        }
        self.consume_initial_yield();
        storage.set_boot_test(super::binary::BootTestState::Passed);
        Ok(())
    }

    /// Tear the guest down without touching the slot state.
    pub fn stop(&mut self) {
        self.coroutine = None;
        self.scanning = false;
        self.registry.clear();
        self.empty_interrupt_slots = 1;
        self.ipc
            .lock()
            .set_operating_state(0, OperatingState::NotRunning);
    }

    /// Per-tick entry. Every `MICROAPP_LOOP_FREQUENCY` ticks the guest gets
    /// a continue exchange.
    pub fn tick(
        &mut self,
        handler: &MicroappRequestHandler,
        bus: &mut EventQueue,
        host: &dyn HostState,
    ) {
        if self.coroutine.is_none() {
            return;
        }
        self.tick_counter += 1;
        if self.tick_counter < MICROAPP_LOOP_FREQUENCY {
            return;
        }
        self.tick_counter = 0;
        self.soft_interrupt_counter = 0;

        {
            let mut io = self.io.lock();
            write_header(
                &mut io.host_to_guest,
                MessageType::Continue,
                Ack::NoRequest,
            );
        }
        self.run_exchange(handler, bus, host);
    }

    /// Raise a scanned-device interrupt into the guest.
    pub fn on_device_scanned(
        &mut self,
        device: &crate::types::ScannedDevice,
        handler: &MicroappRequestHandler,
        bus: &mut EventQueue,
        host: &dyn HostState,
    ) {
        if !self.scanning
            || !self
                .registry
                .is_registered(MessageType::Ble as u8, ble::SCAN_SCANNED_DEVICE)
        {
            return;
        }
        let message = BleMessage {
            ble_type: ble::SCAN_SCANNED_DEVICE,
            address_type: device.address_type,
            address: *device.address.as_bytes(),
            rssi: device.rssi,
            data: device.data.clone(),
        };
        self.generate_soft_interrupt(|frame| message.write(frame), handler, bus, host);
    }

    /// Raise a mesh-message interrupt into the guest.
    pub fn on_mesh_message(
        &mut self,
        stone_id: u8,
        payload: &[u8],
        handler: &MicroappRequestHandler,
        bus: &mut EventQueue,
        host: &dyn HostState,
    ) {
        if !self.registry.is_registered(MessageType::Mesh as u8, mesh::READ) {
            return;
        }
        let message = MeshMessage {
            mesh_type: mesh::READ,
            stone_id,
            data: payload.to_vec(),
        };
        self.generate_soft_interrupt(|frame| message.write(frame), handler, bus, host);
    }

    /// Raise a GPIO sense-edge interrupt into the guest.
    pub fn on_gpio_edge(
        &mut self,
        gpio_pin: u8,
        value: u8,
        handler: &MicroappRequestHandler,
        bus: &mut EventQueue,
        host: &dyn HostState,
    ) {
        if !self.registry.is_registered(MessageType::Pin as u8, gpio_pin) {
            return;
        }
        let message = PinRequest {
            pin: gpio_pin,
            value,
            ..Default::default()
        };
        self.generate_soft_interrupt(|frame| message.write(frame), handler, bus, host);
    }

    /// Whether a new soft interrupt may be raised right now.
    pub fn allows_soft_interrupts(&self) -> bool {
        if self.empty_interrupt_slots == 0 {
            debug!("No empty interrupt slots");
            return false;
        }
        if self.soft_interrupt_counter >= MICROAPP_MAX_SOFT_INTERRUPTS_WITHIN_A_TICK {
            debug!("Soft interrupt budget for this tick exhausted");
            return false;
        }
        true
    }

    // === Internals ===

    /// Write an interrupt payload and drive the guest through it.
    fn generate_soft_interrupt(
        &mut self,
        write_payload: impl FnOnce(&mut [u8]),
        handler: &MicroappRequestHandler,
        bus: &mut EventQueue,
        host: &dyn HostState,
    ) {
        if self.coroutine.is_none() || !self.allows_soft_interrupts() {
            return;
        }
        self.soft_interrupt_counter += 1;

        {
            let mut io = self.io.lock();
            write_payload(&mut io.host_to_guest);
            // The guest must report how the interrupt went.
            write_ack(&mut io.host_to_guest, Ack::Request);
        }
        self.run_exchange(handler, bus, host);
    }

    /// The resume loop shared by ticks and interrupts: resume, read the
    /// guest's ack, serve its requests, repeat within bounds.
    fn run_exchange(
        &mut self,
        handler: &MicroappRequestHandler,
        bus: &mut EventQueue,
        host: &dyn HostState,
    ) {
        loop {
            if !self.call_microapp() {
                return;
            }
            if !self.handle_ack() {
                return;
            }
            if !self.handle_request(handler, bus, host) {
                return;
            }
        }
    }

    /// Resume the guest once, flagging the reserved page around the call.
    ///
    /// Returns `false` when the guest is gone. The `Running` flag is left
    /// standing in that case so a reboot pins the failure on the guest.
    fn call_microapp(&mut self) -> bool {
        let Some(coroutine) = self.coroutine.as_mut() else {
            return false;
        };
        self.ipc
            .lock()
            .set_operating_state(0, OperatingState::Running);
        match coroutine.resume() {
            ResumeOutcome::Yielded => {
                self.ipc
                    .lock()
                    .set_operating_state(0, OperatingState::NotRunning);
                true
            }
            ResumeOutcome::Finished => {
                // A guest must never return from its entry function.
                error!("Microapp coroutine ended");
                self.coroutine = None;
                false
            }
        }
    }

    /// Interpret the guest's ack on the outgoing (host-to-guest) frame.
    ///
    /// Returns whether the guest's own request should be handled. During an
    /// interrupt exchange a finished interrupt ends the exchange, and the
    /// ack tells us what happened to the guest's slot budget.
    fn handle_ack(&mut self) -> bool {
        let ack = {
            let io = self.io.lock();
            abi::read_ack(&io.host_to_guest)
        };
        debug!(ack = ?ack, "Guest ack");

        let in_interrupt_context = ack != Ack::NoRequest;
        if !in_interrupt_context {
            return true;
        }
        let interrupt_done = ack != Ack::InProgress;
        if !interrupt_done {
            return true;
        }
        if ack == Ack::Busy {
            debug!("Guest is full, dropping interrupt");
            // No further interrupts until the guest re-advertises free
            // slots through a yield.
            self.empty_interrupt_slots = 0;
        } else {
            debug!(ack = ?ack, "Guest finished interrupt");
            self.increment_empty_interrupt_slots();
        }
        self.consecutive_call_counter = 0;
        false
    }

    /// Serve the guest's request and decide whether to resume it again.
    fn handle_request(
        &mut self,
        handler: &MicroappRequestHandler,
        bus: &mut EventQueue,
        host: &dyn HostState,
    ) -> bool {
        let message_type = {
            let mut io = self.io.lock();
            let frame: &mut [u8; MAX_PAYLOAD] = &mut io.guest_to_host;
            let message_type = abi::read_message_type(frame);
            let mut ctx = RequestContext {
                registry: &mut self.registry,
                scanning: &mut self.scanning,
                empty_interrupt_slots: &mut self.empty_interrupt_slots,
                bus,
                host,
            };
            match handler.handle(frame, &mut ctx) {
                Ok(CmdOk::WaitForSuccess) => {
                    info!(message_type, "Request completing asynchronously");
                }
                Ok(_) => {}
                Err(error) => {
                    info!(message_type, %error, "Request failed");
                }
            }
            message_type
        };

        if stop_after_request(message_type) {
            self.consecutive_call_counter = 0;
            return false;
        }
        if self.consecutive_call_counter >= MICROAPP_MAX_NUMBER_CONSECUTIVE_CALLS {
            info!("Consecutive call budget exhausted");
            self.consecutive_call_counter = 0;
            return false;
        }
        self.consecutive_call_counter += 1;
        true
    }

    /// After start, the guest's first yield is in the incoming frame; pick
    /// up its advertised free slots without a full dispatch.
    fn consume_initial_yield(&mut self) {
        let io = self.io.lock();
        let frame = &io.guest_to_host;
        if abi::read_message_type(frame) == MessageType::Yield as u8 {
            let request = abi::YieldRequest::parse(frame);
            drop(io);
            self.empty_interrupt_slots = request.empty_interrupt_slots;
        }
    }

    fn increment_empty_interrupt_slots(&mut self) {
        // Saturate rather than wrap to zero.
        if self.empty_interrupt_slots != u8::MAX {
            self.empty_interrupt_slots += 1;
        }
    }
}

/// Whether control returns to the host after serving a request of this
/// type.
///
/// Work requests earn the guest another resume so it can continue past its
/// blocking call; yields and scheduling signals end the exchange.
fn stop_after_request(message_type: u8) -> bool {
    match MessageType::from_wire(message_type) {
        Ok(MessageType::Log)
        | Ok(MessageType::Pin)
        | Ok(MessageType::Switch)
        | Ok(MessageType::ServiceData)
        | Ok(MessageType::Twi)
        | Ok(MessageType::Ble)
        | Ok(MessageType::Mesh)
        | Ok(MessageType::PowerUsage)
        | Ok(MessageType::Presence)
        | Ok(MessageType::ControlCommand) => false,
        Ok(MessageType::None) | Ok(MessageType::Yield) | Ok(MessageType::Continue) => true,
        Err(_) => {
            info!(message_type, "Unknown request type");
            true
        }
    }
}
