//! Microapp request handler.
//!
//! Decodes the guest's message out of the guest-to-host frame, translates
//! it to host events or host-state reads, and writes the resulting ack back
//! into the frame. Scheduling signals (Continue, Yield, None) never reach
//! the event bus; Yield only updates the supervisor's empty-slot count.

use tracing::{debug, info, warn};

use crate::bus::{Event, EventQueue, GpioDirection, GpioPolarity};
use crate::errors::{CmdOk, CmdResult, Error};
use crate::types::MacAddress;

use super::abi::{
    self, ble, mesh, pin, twi, write_ack, Ack, BleMessage, ControlCommandRequest, LogPayload,
    LogRequest, MeshMessage, MessageType, PinRequest, PowerUsageRequest, PresenceRequest,
    ServiceDataRequest, SwitchRequest, TwiRequest, YieldRequest,
};
use super::supervisor::{InterruptRegistry, RegistryError};
use super::{HostState, MAX_PRESENCE_PROFILES};

/// Mutable supervisor state a request may touch.
pub struct RequestContext<'a> {
    pub registry: &'a mut InterruptRegistry,
    pub scanning: &'a mut bool,
    pub empty_interrupt_slots: &'a mut u8,
    pub bus: &'a mut EventQueue,
    pub host: &'a dyn HostState,
}

/// Decodes guest frames and dispatches them.
#[derive(Debug, Default)]
pub struct MicroappRequestHandler {
    _private: (),
}

impl MicroappRequestHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle the message in `frame`, writing the ack in place.
    pub fn handle(&self, frame: &mut [u8], ctx: &mut RequestContext<'_>) -> CmdResult {
        let raw_type = abi::read_message_type(frame);
        let message_type = match MessageType::from_wire(raw_type) {
            Ok(message_type) => message_type,
            Err(_) => {
                info!(message_type = raw_type, "Unknown microapp request type");
                write_ack(frame, Ack::Undefined);
                return Err(Error::UnknownType);
            }
        };
        debug!(message_type = ?message_type, "Handling microapp request");

        match message_type {
            MessageType::None => {
                warn!("Microapp yields without setting a message type");
                Ok(CmdOk::Success)
            }
            MessageType::Log => self.handle_log(frame),
            MessageType::Pin => self.handle_pin(frame, ctx),
            MessageType::Switch => self.handle_switch(frame, ctx),
            MessageType::ServiceData => self.handle_service_data(frame, ctx),
            MessageType::Twi => self.handle_twi(frame, ctx),
            MessageType::Ble => self.handle_ble(frame, ctx),
            MessageType::Mesh => self.handle_mesh(frame, ctx),
            MessageType::PowerUsage => self.handle_power_usage(frame, ctx),
            MessageType::Presence => self.handle_presence(frame, ctx),
            MessageType::ControlCommand => self.handle_control_command(frame, ctx),
            MessageType::Yield => self.handle_yield(frame, ctx),
            MessageType::Continue => {
                // Pure scheduling signal; nothing to dispatch.
                write_ack(frame, Ack::Success);
                Ok(CmdOk::Success)
            }
        }
    }

    fn handle_log(&self, frame: &mut [u8]) -> CmdResult {
        let request = match LogRequest::parse(frame) {
            Ok(request) => request,
            Err(Error::WrongPayloadLength) => {
                write_ack(frame, Ack::TooLarge);
                return Err(Error::WrongPayloadLength);
            }
            Err(error) => {
                write_ack(frame, Ack::Undefined);
                return Err(error);
            }
        };
        match &request.payload {
            LogPayload::Char(value) => info!(target: "microapp", "{}", value),
            LogPayload::Int(value) => info!(target: "microapp", "{}", value),
            LogPayload::Str(value) => info!(target: "microapp", "{}", value),
            LogPayload::Arr(value) => info!(target: "microapp", "{:02X?}", value),
            LogPayload::Float(value) => info!(target: "microapp", "{:.3}", value),
            LogPayload::Double(value) => info!(target: "microapp", "{:.3}", value),
            LogPayload::Uint(value) => info!(target: "microapp", "{}", value),
            LogPayload::Short(value) => info!(target: "microapp", "{}", value),
        }
        write_ack(frame, Ack::Success);
        Ok(CmdOk::Success)
    }

    fn handle_pin(&self, frame: &mut [u8], ctx: &mut RequestContext<'_>) -> CmdResult {
        let request = PinRequest::parse(frame);
        if request.pin > pin::MAX_PIN_INDEX {
            info!(pin = request.pin, "Pin out of range");
            write_ack(frame, Ack::OutOfRange);
            return Err(Error::NotFound);
        }

        match request.pin_type {
            pin::TYPE_INIT => {
                let pull_up = request.direction == pin::DIRECTION_INPUT_PULLUP;
                let (direction, polarity) = match request.direction {
                    pin::DIRECTION_INPUT | pin::DIRECTION_INPUT_PULLUP => match request.polarity {
                        pin::POLARITY_NONE => (GpioDirection::Input, GpioPolarity::None),
                        pin::POLARITY_RISING => (GpioDirection::Sense, GpioPolarity::LowToHigh),
                        pin::POLARITY_FALLING => (GpioDirection::Sense, GpioPolarity::HighToLow),
                        pin::POLARITY_CHANGE => (GpioDirection::Sense, GpioPolarity::Toggle),
                        other => {
                            warn!(polarity = other, "Unknown pin polarity");
                            write_ack(frame, Ack::Undefined);
                            return Err(Error::UnknownType);
                        }
                    },
                    pin::DIRECTION_OUTPUT => (GpioDirection::Output, GpioPolarity::None),
                    other => {
                        warn!(direction = other, "Unknown pin direction");
                        write_ack(frame, Ack::Undefined);
                        return Err(Error::UnknownType);
                    }
                };
                ctx.bus.push(Event::GpioInit {
                    pin: request.pin,
                    direction,
                    pull_up,
                    polarity,
                });
                if direction == GpioDirection::Sense {
                    if let Err(error) = ctx.registry.register(MessageType::Pin as u8, request.pin)
                    {
                        warn!(pin = request.pin, %error, "Pin interrupt registration failed");
                        write_ack(frame, Ack::Error);
                        return Err(registry_error(error));
                    }
                }
            }
            pin::TYPE_ACTION => match request.action {
                pin::ACTION_READ => {
                    write_ack(frame, Ack::NotImplemented);
                    return Err(Error::NotImplemented);
                }
                pin::ACTION_WRITE => match request.value {
                    pin::VALUE_ON | pin::VALUE_OFF => {
                        ctx.bus.push(Event::GpioWrite {
                            pin: request.pin,
                            value: request.value,
                        });
                    }
                    other => {
                        warn!(value = other, "Unknown pin value");
                        write_ack(frame, Ack::Undefined);
                        return Err(Error::UnknownType);
                    }
                },
                other => {
                    warn!(action = other, "Unknown pin action");
                    write_ack(frame, Ack::Undefined);
                    return Err(Error::UnknownType);
                }
            },
            other => {
                warn!(pin_type = other, "Unknown pin request type");
                write_ack(frame, Ack::Undefined);
                return Err(Error::UnknownType);
            }
        }
        write_ack(frame, Ack::Success);
        Ok(CmdOk::Success)
    }

    fn handle_switch(&self, frame: &mut [u8], ctx: &mut RequestContext<'_>) -> CmdResult {
        let request = SwitchRequest::parse(frame);
        debug!(value = request.value, "Microapp switch request");
        ctx.bus.push(Event::SwitchCommand {
            value: request.value,
        });
        write_ack(frame, Ack::Success);
        Ok(CmdOk::Success)
    }

    fn handle_service_data(&self, frame: &mut [u8], ctx: &mut RequestContext<'_>) -> CmdResult {
        let request = match ServiceDataRequest::parse(frame) {
            Ok(request) => request,
            Err(error) => {
                info!("Service data payload too large");
                write_ack(frame, Ack::TooLarge);
                return Err(error);
            }
        };
        ctx.bus.push(Event::MicroappAdvertise {
            app_uuid: request.app_uuid,
            data: request.data,
        });
        write_ack(frame, Ack::Success);
        Ok(CmdOk::Success)
    }

    fn handle_twi(&self, frame: &mut [u8], ctx: &mut RequestContext<'_>) -> CmdResult {
        let request = match TwiRequest::parse(frame) {
            Ok(request) => request,
            Err(error) => {
                write_ack(frame, Ack::TooLarge);
                return Err(error);
            }
        };
        match request.twi_type {
            twi::TYPE_INIT => {
                ctx.bus.push(Event::TwiInit);
            }
            twi::TYPE_WRITE => {
                ctx.bus.push(Event::TwiWrite {
                    address: request.address,
                    data: request.data,
                    stop: request.flags & twi::FLAG_STOP != 0,
                });
            }
            twi::TYPE_READ => {
                let mut buffer = vec![0u8; request.data.len()];
                match ctx.host.twi_read(request.address, &mut buffer) {
                    Ok(read) => {
                        frame[5] = read as u8;
                        frame[6..6 + read].copy_from_slice(&buffer[..read]);
                    }
                    Err(error) => {
                        write_ack(frame, Ack::NotImplemented);
                        return Err(error);
                    }
                }
            }
            other => {
                warn!(twi_type = other, "Unknown TWI type");
                write_ack(frame, Ack::Undefined);
                return Err(Error::UnknownType);
            }
        }
        write_ack(frame, Ack::Success);
        Ok(CmdOk::Success)
    }

    fn handle_ble(&self, frame: &mut [u8], ctx: &mut RequestContext<'_>) -> CmdResult {
        let message = match BleMessage::parse(frame) {
            Ok(message) => message,
            Err(error) => {
                write_ack(frame, Ack::TooLarge);
                return Err(error);
            }
        };
        match message.ble_type {
            ble::SCAN_REGISTER_INTERRUPT => {
                if let Err(error) = ctx
                    .registry
                    .register(MessageType::Ble as u8, ble::SCAN_SCANNED_DEVICE)
                {
                    warn!(%error, "Scan interrupt registration failed");
                    write_ack(frame, Ack::Error);
                    return Err(registry_error(error));
                }
                write_ack(frame, Ack::Success);
            }
            ble::SCAN_START => {
                debug!("Microapp starts scanning");
                *ctx.scanning = true;
                write_ack(frame, Ack::Success);
            }
            ble::SCAN_STOP => {
                debug!("Microapp stops scanning");
                *ctx.scanning = false;
                write_ack(frame, Ack::Success);
            }
            ble::CONNECTION_REQUEST_CONNECT => {
                // The guest supplies the address most-significant-first.
                let mut address = message.address;
                address.reverse();
                ctx.bus.push(Event::BleCentralConnect {
                    address: MacAddress::from_bytes(address),
                });
                write_ack(frame, Ack::InProgress);
                return Ok(CmdOk::WaitForSuccess);
            }
            ble::CONNECTION_REQUEST_DISCONNECT => {
                write_ack(frame, Ack::NotImplemented);
                return Err(Error::NotImplemented);
            }
            other => {
                info!(ble_type = other, "Unknown BLE type");
                write_ack(frame, Ack::Undefined);
                return Err(Error::UnknownType);
            }
        }
        Ok(CmdOk::Success)
    }

    fn handle_mesh(&self, frame: &mut [u8], ctx: &mut RequestContext<'_>) -> CmdResult {
        let message = match MeshMessage::parse(frame) {
            Ok(message) => message,
            Err(error) => {
                info!("Mesh payload too large");
                write_ack(frame, Ack::TooLarge);
                return Err(error);
            }
        };
        match message.mesh_type {
            mesh::SEND => {
                if message.data.is_empty() {
                    info!("Empty mesh message");
                    write_ack(frame, Ack::Empty);
                    return Err(Error::WrongPayloadLength);
                }
                debug!(
                    stone_id = message.stone_id,
                    len = message.data.len(),
                    "Microapp mesh send"
                );
                ctx.bus.push(Event::MeshOutbound {
                    stone_id: message.stone_id,
                    payload: message.data,
                });
                write_ack(frame, Ack::Success);
            }
            mesh::LISTEN => {
                info!("Microapp listens for mesh messages");
                if let Err(error) = ctx.registry.register(MessageType::Mesh as u8, mesh::READ) {
                    warn!(%error, "Mesh interrupt registration failed");
                    write_ack(frame, Ack::Error);
                    return Err(registry_error(error));
                }
                write_ack(frame, Ack::Success);
            }
            mesh::READ_CONFIG => {
                MeshMessage::write_stone_id(frame, ctx.host.stone_id());
                write_ack(frame, Ack::Success);
            }
            mesh::READ => {
                info!("Mesh reads are delivered via interrupts");
                write_ack(frame, Ack::Undefined);
                return Err(Error::WrongState);
            }
            other => {
                info!(mesh_type = other, "Unknown mesh type");
                write_ack(frame, Ack::Undefined);
                return Err(Error::UnknownType);
            }
        }
        Ok(CmdOk::Success)
    }

    fn handle_power_usage(&self, frame: &mut [u8], ctx: &mut RequestContext<'_>) -> CmdResult {
        let _ = PowerUsageRequest::parse(frame);
        PowerUsageRequest::write_value(frame, ctx.host.power_usage_milliwatt());
        write_ack(frame, Ack::Success);
        Ok(CmdOk::Success)
    }

    fn handle_presence(&self, frame: &mut [u8], ctx: &mut RequestContext<'_>) -> CmdResult {
        let request = PresenceRequest::parse(frame);
        if request.profile_id as usize >= MAX_PRESENCE_PROFILES {
            info!(profile_id = request.profile_id, "Presence profile out of range");
            write_ack(frame, Ack::OutOfRange);
            return Err(Error::NotFound);
        }
        PresenceRequest::write_bitmask(frame, ctx.host.presence_bitmask(request.profile_id));
        write_ack(frame, Ack::Success);
        Ok(CmdOk::Success)
    }

    fn handle_control_command(&self, frame: &mut [u8], ctx: &mut RequestContext<'_>) -> CmdResult {
        let request = match ControlCommandRequest::parse(frame) {
            Ok(request) => request,
            Err(error) => {
                info!("Control command too large");
                write_ack(frame, Ack::TooLarge);
                return Err(error);
            }
        };
        if request.data.is_empty() {
            info!("Empty control command");
            write_ack(frame, Ack::Empty);
            return Err(Error::WrongPayloadLength);
        }
        debug!(
            command_type = request.command_type,
            "Microapp control command"
        );
        ctx.bus.push(Event::ControlCommand {
            protocol: request.protocol,
            command_type: request.command_type,
            data: request.data,
        });
        write_ack(frame, Ack::Success);
        Ok(CmdOk::Success)
    }

    fn handle_yield(&self, frame: &mut [u8], ctx: &mut RequestContext<'_>) -> CmdResult {
        let request = YieldRequest::parse(frame);
        debug!(
            yield_type = request.yield_type,
            empty_slots = request.empty_interrupt_slots,
            "Microapp yield"
        );
        *ctx.empty_interrupt_slots = request.empty_interrupt_slots;
        write_ack(frame, Ack::Success);
        Ok(CmdOk::Success)
    }
}

fn registry_error(error: RegistryError) -> Error {
    match error {
        RegistryError::AlreadyExists => Error::WrongState,
        RegistryError::NoSpace => Error::NoSpace,
    }
}
