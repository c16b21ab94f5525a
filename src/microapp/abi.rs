//! Microapp Message ABI
//!
//! Defines the shared-memory message format between the host and the guest.
//! Host and guest each own one 48-byte payload buffer; every message starts
//! with a two-byte header and the remainder is laid out per message type,
//! packed little-endian.
//!
//! ## Header
//!
//! ```text
//! [message_type: u8][ack: i8][type-specific payload]
//! ```
//!
//! ## Message types
//!
//! | Byte | Type           | Direction  | Payload                           |
//! |------|----------------|------------|-----------------------------------|
//! | 0x00 | None           | -          | -                                 |
//! | 0x01 | Log            | guest→host | log type, flags, size, value      |
//! | 0x02 | Pin            | both       | pin, type, dir, polarity, action  |
//! | 0x03 | Switch         | guest→host | value                             |
//! | 0x04 | ServiceData    | guest→host | app uuid, size, data[8]           |
//! | 0x05 | Twi            | guest→host | type, address, flags, size, buf   |
//! | 0x06 | Ble            | both       | type, addr type, mac, rssi, data  |
//! | 0x07 | Mesh           | both       | type, stone id, size, data[7]     |
//! | 0x08 | PowerUsage     | guest→host | type, value i32                   |
//! | 0x09 | Presence       | guest→host | profile id, bitmask u64           |
//! | 0x0A | ControlCommand | guest→host | protocol, type u16, size u16, ... |
//! | 0x0B | Yield          | guest→host | yield type, empty slots           |
//! | 0x0C | Continue       | host→guest | -                                 |

use crate::errors::Error;
use crate::types::{MAC_ADDRESS_LENGTH, MAX_BLE_ADV_DATA_LENGTH};

// ============================================================================
// Sizes
// ============================================================================

/// Size of each IPC payload buffer.
pub const MAX_PAYLOAD: usize = 48;

/// Size of the common message header.
pub const HEADER_SIZE: usize = 2;

/// Size of the log message header (common header + type, flags, size).
pub const LOG_HEADER_SIZE: usize = 5;

/// Maximum length of a logged string or byte array.
pub const MAX_LOG_STRING_LENGTH: usize = MAX_PAYLOAD - LOG_HEADER_SIZE; // 43

/// Maximum TWI transfer size.
pub const MAX_TWI_PAYLOAD_SIZE: usize = MAX_PAYLOAD - (HEADER_SIZE + 4); // 42

/// Maximum mesh payload a microapp may send.
pub const MAX_MESH_PAYLOAD_SIZE: usize = 7;

/// Maximum service-data payload.
pub const MAX_SERVICE_DATA_LENGTH: usize = 8;

/// Maximum control-command payload.
pub const MAX_CONTROL_COMMAND_PAYLOAD_SIZE: usize = MAX_PAYLOAD - (HEADER_SIZE + 5); // 41

// ============================================================================
// Header
// ============================================================================

/// Acknowledgement codes exchanged through the message header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i8)]
pub enum Ack {
    Success = 0,
    /// The sender does not expect a reply.
    NoRequest = 1,
    /// The sender expects the receiver to update this ack.
    Request = 2,
    /// The receiver is still working on the request.
    InProgress = 3,
    Error = 4,
    NotFound = 5,
    Undefined = 6,
    NoSpace = 7,
    NotImplemented = 8,
    Busy = 9,
    OutOfRange = 10,
    Disabled = 11,
    Empty = 12,
    TooLarge = 13,
}

impl Ack {
    /// Decode a raw ack byte; unknown values map to `Undefined`.
    pub fn from_wire(byte: i8) -> Self {
        match byte {
            0 => Ack::Success,
            1 => Ack::NoRequest,
            2 => Ack::Request,
            3 => Ack::InProgress,
            4 => Ack::Error,
            5 => Ack::NotFound,
            7 => Ack::NoSpace,
            8 => Ack::NotImplemented,
            9 => Ack::Busy,
            10 => Ack::OutOfRange,
            11 => Ack::Disabled,
            12 => Ack::Empty,
            13 => Ack::TooLarge,
            _ => Ack::Undefined,
        }
    }
}

/// Message type discriminators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    None = 0x00,
    Log = 0x01,
    Pin = 0x02,
    Switch = 0x03,
    ServiceData = 0x04,
    Twi = 0x05,
    Ble = 0x06,
    Mesh = 0x07,
    PowerUsage = 0x08,
    Presence = 0x09,
    ControlCommand = 0x0A,
    Yield = 0x0B,
    Continue = 0x0C,
}

impl MessageType {
    /// Decode a raw message type byte.
    pub fn from_wire(byte: u8) -> Result<Self, Error> {
        match byte {
            0x00 => Ok(MessageType::None),
            0x01 => Ok(MessageType::Log),
            0x02 => Ok(MessageType::Pin),
            0x03 => Ok(MessageType::Switch),
            0x04 => Ok(MessageType::ServiceData),
            0x05 => Ok(MessageType::Twi),
            0x06 => Ok(MessageType::Ble),
            0x07 => Ok(MessageType::Mesh),
            0x08 => Ok(MessageType::PowerUsage),
            0x09 => Ok(MessageType::Presence),
            0x0A => Ok(MessageType::ControlCommand),
            0x0B => Ok(MessageType::Yield),
            0x0C => Ok(MessageType::Continue),
            _ => Err(Error::UnknownType),
        }
    }
}

/// Read the raw message type byte of a frame.
pub fn read_message_type(frame: &[u8]) -> u8 {
    frame[0]
}

/// Read the ack of a frame.
pub fn read_ack(frame: &[u8]) -> Ack {
    Ack::from_wire(frame[1] as i8)
}

/// Write a bare header, zeroing nothing else.
pub fn write_header(frame: &mut [u8], message_type: MessageType, ack: Ack) {
    frame[0] = message_type as u8;
    frame[1] = ack as i8 as u8;
}

/// Update only the ack byte of a frame.
pub fn write_ack(frame: &mut [u8], ack: Ack) {
    frame[1] = ack as i8 as u8;
}

// ============================================================================
// Field value constants
// ============================================================================

/// Log payload types.
pub mod log_type {
    pub const CHAR: u8 = 0x01;
    pub const INT: u8 = 0x02;
    pub const STR: u8 = 0x03;
    pub const ARR: u8 = 0x04;
    pub const FLOAT: u8 = 0x05;
    pub const DOUBLE: u8 = 0x06;
    pub const UINT: u8 = 0x07;
    pub const SHORT: u8 = 0x08;
}

/// Log flag bits.
pub mod log_flags {
    pub const NEWLINE: u8 = 1 << 0;
}

/// Pin message field values.
pub mod pin {
    pub const TYPE_INIT: u8 = 0x01;
    pub const TYPE_ACTION: u8 = 0x02;

    pub const DIRECTION_INPUT: u8 = 0x01;
    pub const DIRECTION_INPUT_PULLUP: u8 = 0x02;
    pub const DIRECTION_OUTPUT: u8 = 0x03;

    pub const POLARITY_NONE: u8 = 0x01;
    pub const POLARITY_CHANGE: u8 = 0x02;
    pub const POLARITY_RISING: u8 = 0x03;
    pub const POLARITY_FALLING: u8 = 0x04;

    pub const ACTION_READ: u8 = 0x01;
    pub const ACTION_WRITE: u8 = 0x02;

    pub const VALUE_OFF: u8 = 0x00;
    pub const VALUE_ON: u8 = 0x01;

    /// Highest addressable pin index.
    pub const MAX_PIN_INDEX: u8 = 0x11;
}

/// Switch command values.
pub mod switch {
    pub const OFF: u8 = 0x00;
    pub const ON: u8 = 0x64;
    pub const TOGGLE: u8 = 0xFD;
    pub const BEHAVIOUR: u8 = 0xFE;
    pub const SMART_ON: u8 = 0xFF;
}

/// TWI message field values.
pub mod twi {
    pub const TYPE_READ: u8 = 0x01;
    pub const TYPE_WRITE: u8 = 0x02;
    pub const TYPE_INIT: u8 = 0x03;

    pub const FLAG_STOP: u8 = 1 << 0;
}

/// BLE message field values.
pub mod ble {
    pub const SCAN_START: u8 = 0x01;
    pub const SCAN_STOP: u8 = 0x02;
    pub const SCAN_REGISTER_INTERRUPT: u8 = 0x03;
    pub const SCAN_SCANNED_DEVICE: u8 = 0x04;
    pub const CONNECTION_REQUEST_CONNECT: u8 = 0x05;
    pub const CONNECTION_CONNECTED: u8 = 0x06;
    pub const CONNECTION_REQUEST_DISCONNECT: u8 = 0x07;
    pub const CONNECTION_DISCONNECTED: u8 = 0x08;
}

/// Mesh message field values.
pub mod mesh {
    pub const SEND: u8 = 0x01;
    pub const LISTEN: u8 = 0x02;
    pub const READ_CONFIG: u8 = 0x03;
    pub const READ: u8 = 0x04;
}

/// Power usage request types.
pub mod power_usage {
    pub const POWER: u8 = 0x01;
    pub const CURRENT: u8 = 0x02;
    pub const VOLTAGE: u8 = 0x03;
}

/// Yield types.
pub mod yield_type {
    pub const SETUP: u8 = 0x01;
    pub const LOOP: u8 = 0x02;
    pub const ASYNC: u8 = 0x03;
}

// ============================================================================
// Messages
// ============================================================================

/// Log request payload.
#[derive(Clone, Debug, PartialEq)]
pub enum LogPayload {
    Char(u8),
    Int(i32),
    Str(String),
    Arr(Vec<u8>),
    Float(f32),
    Double(f64),
    Uint(u32),
    Short(u16),
}

/// Log request: `[type][flags][size][value]` after the header.
#[derive(Clone, Debug, PartialEq)]
pub struct LogRequest {
    pub flags: u8,
    pub payload: LogPayload,
}

impl LogRequest {
    /// Parse from a frame.
    pub fn parse(frame: &[u8]) -> Result<Self, Error> {
        let kind = frame[2];
        let flags = frame[3];
        let size = frame[4] as usize;
        let body = &frame[LOG_HEADER_SIZE..];
        let payload = match kind {
            log_type::CHAR => LogPayload::Char(body[0]),
            log_type::INT => LogPayload::Int(i32::from_le_bytes([
                body[0], body[1], body[2], body[3],
            ])),
            log_type::STR => {
                if size > MAX_LOG_STRING_LENGTH {
                    return Err(Error::WrongPayloadLength);
                }
                LogPayload::Str(String::from_utf8_lossy(&body[..size]).into_owned())
            }
            log_type::ARR => {
                if size > MAX_LOG_STRING_LENGTH {
                    return Err(Error::WrongPayloadLength);
                }
                LogPayload::Arr(body[..size].to_vec())
            }
            log_type::FLOAT => LogPayload::Float(f32::from_le_bytes([
                body[0], body[1], body[2], body[3],
            ])),
            log_type::DOUBLE => LogPayload::Double(f64::from_le_bytes([
                body[0], body[1], body[2], body[3], body[4], body[5], body[6], body[7],
            ])),
            log_type::UINT => LogPayload::Uint(u32::from_le_bytes([
                body[0], body[1], body[2], body[3],
            ])),
            log_type::SHORT => LogPayload::Short(u16::from_le_bytes([body[0], body[1]])),
            _ => return Err(Error::UnknownType),
        };
        Ok(Self { flags, payload })
    }

    /// Write into a frame with `ack = Request`.
    pub fn write(&self, frame: &mut [u8]) {
        write_header(frame, MessageType::Log, Ack::Request);
        frame[3] = self.flags;
        let body_start = LOG_HEADER_SIZE;
        match &self.payload {
            LogPayload::Char(value) => {
                frame[2] = log_type::CHAR;
                frame[4] = 1;
                frame[body_start] = *value;
            }
            LogPayload::Int(value) => {
                frame[2] = log_type::INT;
                frame[4] = 4;
                frame[body_start..body_start + 4].copy_from_slice(&value.to_le_bytes());
            }
            LogPayload::Str(value) => {
                frame[2] = log_type::STR;
                let bytes = value.as_bytes();
                let len = bytes.len().min(MAX_LOG_STRING_LENGTH);
                frame[4] = len as u8;
                frame[body_start..body_start + len].copy_from_slice(&bytes[..len]);
            }
            LogPayload::Arr(value) => {
                frame[2] = log_type::ARR;
                let len = value.len().min(MAX_LOG_STRING_LENGTH);
                frame[4] = len as u8;
                frame[body_start..body_start + len].copy_from_slice(&value[..len]);
            }
            LogPayload::Float(value) => {
                frame[2] = log_type::FLOAT;
                frame[4] = 4;
                frame[body_start..body_start + 4].copy_from_slice(&value.to_le_bytes());
            }
            LogPayload::Double(value) => {
                frame[2] = log_type::DOUBLE;
                frame[4] = 8;
                frame[body_start..body_start + 8].copy_from_slice(&value.to_le_bytes());
            }
            LogPayload::Uint(value) => {
                frame[2] = log_type::UINT;
                frame[4] = 4;
                frame[body_start..body_start + 4].copy_from_slice(&value.to_le_bytes());
            }
            LogPayload::Short(value) => {
                frame[2] = log_type::SHORT;
                frame[4] = 2;
                frame[body_start..body_start + 2].copy_from_slice(&value.to_le_bytes());
            }
        }
    }
}

/// Pin request: `[pin][type][direction][polarity][action][value]`.
///
/// Field values stay raw so the handler can reject unknown ones with the
/// matching ack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PinRequest {
    pub pin: u8,
    pub pin_type: u8,
    pub direction: u8,
    pub polarity: u8,
    pub action: u8,
    pub value: u8,
}

impl PinRequest {
    pub fn parse(frame: &[u8]) -> Self {
        Self {
            pin: frame[2],
            pin_type: frame[3],
            direction: frame[4],
            polarity: frame[5],
            action: frame[6],
            value: frame[7],
        }
    }

    pub fn write(&self, frame: &mut [u8]) {
        write_header(frame, MessageType::Pin, Ack::Request);
        frame[2] = self.pin;
        frame[3] = self.pin_type;
        frame[4] = self.direction;
        frame[5] = self.polarity;
        frame[6] = self.action;
        frame[7] = self.value;
    }
}

/// Switch request: `[value]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwitchRequest {
    pub value: u8,
}

impl SwitchRequest {
    pub fn parse(frame: &[u8]) -> Self {
        Self { value: frame[2] }
    }

    pub fn write(&self, frame: &mut [u8]) {
        write_header(frame, MessageType::Switch, Ack::Request);
        frame[2] = self.value;
    }
}

/// Service data request: `[app_uuid u16][size][data; 8]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDataRequest {
    pub app_uuid: u16,
    pub data: Vec<u8>,
}

impl ServiceDataRequest {
    /// Parse from a frame. The size field is validated against the maximum.
    pub fn parse(frame: &[u8]) -> Result<Self, Error> {
        let size = frame[4] as usize;
        if size > MAX_SERVICE_DATA_LENGTH {
            return Err(Error::WrongPayloadLength);
        }
        Ok(Self {
            app_uuid: u16::from_le_bytes([frame[2], frame[3]]),
            data: frame[5..5 + size].to_vec(),
        })
    }

    pub fn write(&self, frame: &mut [u8]) {
        write_header(frame, MessageType::ServiceData, Ack::Request);
        frame[2..4].copy_from_slice(&self.app_uuid.to_le_bytes());
        let len = self.data.len().min(MAX_SERVICE_DATA_LENGTH);
        frame[4] = len as u8;
        frame[5..5 + len].copy_from_slice(&self.data[..len]);
    }
}

/// TWI request: `[type][address][flags][size][buf; 42]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TwiRequest {
    pub twi_type: u8,
    pub address: u8,
    pub flags: u8,
    pub data: Vec<u8>,
}

impl TwiRequest {
    pub fn parse(frame: &[u8]) -> Result<Self, Error> {
        let size = frame[5] as usize;
        if size > MAX_TWI_PAYLOAD_SIZE {
            return Err(Error::WrongPayloadLength);
        }
        Ok(Self {
            twi_type: frame[2],
            address: frame[3],
            flags: frame[4],
            data: frame[6..6 + size].to_vec(),
        })
    }

    pub fn write(&self, frame: &mut [u8]) {
        write_header(frame, MessageType::Twi, Ack::Request);
        frame[2] = self.twi_type;
        frame[3] = self.address;
        frame[4] = self.flags;
        let len = self.data.len().min(MAX_TWI_PAYLOAD_SIZE);
        frame[5] = len as u8;
        frame[6..6 + len].copy_from_slice(&self.data[..len]);
    }
}

/// BLE message: `[type][address_type][address; 6][rssi][size][data; 31]`.
///
/// Sent by the guest for scan control and connections, and by the host as
/// the scanned-device interrupt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BleMessage {
    pub ble_type: u8,
    pub address_type: u8,
    pub address: [u8; MAC_ADDRESS_LENGTH],
    pub rssi: i8,
    pub data: Vec<u8>,
}

impl BleMessage {
    pub fn parse(frame: &[u8]) -> Result<Self, Error> {
        let size = frame[11] as usize;
        if size > MAX_BLE_ADV_DATA_LENGTH {
            return Err(Error::WrongPayloadLength);
        }
        let mut address = [0u8; MAC_ADDRESS_LENGTH];
        address.copy_from_slice(&frame[4..10]);
        Ok(Self {
            ble_type: frame[2],
            address_type: frame[3],
            address,
            rssi: frame[10] as i8,
            data: frame[12..12 + size].to_vec(),
        })
    }

    /// Write with the given ack (`Request` both for guest requests and for
    /// host-raised interrupts).
    pub fn write(&self, frame: &mut [u8]) {
        write_header(frame, MessageType::Ble, Ack::Request);
        frame[2] = self.ble_type;
        frame[3] = self.address_type;
        frame[4..10].copy_from_slice(&self.address);
        frame[10] = self.rssi as u8;
        let len = self.data.len().min(MAX_BLE_ADV_DATA_LENGTH);
        frame[11] = len as u8;
        frame[12..12 + len].copy_from_slice(&self.data[..len]);
    }
}

/// Mesh message: `[type][stone_id][size][data; 7]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshMessage {
    pub mesh_type: u8,
    pub stone_id: u8,
    pub data: Vec<u8>,
}

impl MeshMessage {
    pub fn parse(frame: &[u8]) -> Result<Self, Error> {
        let size = frame[4] as usize;
        if size > MAX_MESH_PAYLOAD_SIZE {
            return Err(Error::WrongPayloadLength);
        }
        Ok(Self {
            mesh_type: frame[2],
            stone_id: frame[3],
            data: frame[5..5 + size].to_vec(),
        })
    }

    pub fn write(&self, frame: &mut [u8]) {
        write_header(frame, MessageType::Mesh, Ack::Request);
        frame[2] = self.mesh_type;
        frame[3] = self.stone_id;
        let len = self.data.len().min(MAX_MESH_PAYLOAD_SIZE);
        frame[4] = len as u8;
        frame[5..5 + len].copy_from_slice(&self.data[..len]);
    }

    /// Write the host's reply to a read-config request: the stone id.
    pub fn write_stone_id(frame: &mut [u8], stone_id: u8) {
        frame[3] = stone_id;
    }
}

/// Power usage request: `[type][value i32]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PowerUsageRequest {
    pub usage_type: u8,
    pub value_milliwatt: i32,
}

impl PowerUsageRequest {
    pub fn parse(frame: &[u8]) -> Self {
        Self {
            usage_type: frame[2],
            value_milliwatt: i32::from_le_bytes([frame[3], frame[4], frame[5], frame[6]]),
        }
    }

    pub fn write(&self, frame: &mut [u8]) {
        write_header(frame, MessageType::PowerUsage, Ack::Request);
        frame[2] = self.usage_type;
        frame[3..7].copy_from_slice(&self.value_milliwatt.to_le_bytes());
    }

    /// Write the host's reply value in place.
    pub fn write_value(frame: &mut [u8], value_milliwatt: i32) {
        frame[3..7].copy_from_slice(&value_milliwatt.to_le_bytes());
    }
}

/// Presence request: `[profile_id][bitmask u64]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresenceRequest {
    pub profile_id: u8,
    pub presence_bitmask: u64,
}

impl PresenceRequest {
    pub fn parse(frame: &[u8]) -> Self {
        Self {
            profile_id: frame[2],
            presence_bitmask: u64::from_le_bytes([
                frame[3], frame[4], frame[5], frame[6], frame[7], frame[8], frame[9], frame[10],
            ]),
        }
    }

    pub fn write(&self, frame: &mut [u8]) {
        write_header(frame, MessageType::Presence, Ack::Request);
        frame[2] = self.profile_id;
        frame[3..11].copy_from_slice(&self.presence_bitmask.to_le_bytes());
    }

    /// Write the host's reply bitmask in place.
    pub fn write_bitmask(frame: &mut [u8], bitmask: u64) {
        frame[3..11].copy_from_slice(&bitmask.to_le_bytes());
    }
}

/// Control command: `[protocol][type u16][size u16][payload; 41]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlCommandRequest {
    pub protocol: u8,
    pub command_type: u16,
    pub data: Vec<u8>,
}

impl ControlCommandRequest {
    pub fn parse(frame: &[u8]) -> Result<Self, Error> {
        let size = u16::from_le_bytes([frame[5], frame[6]]) as usize;
        if size > MAX_CONTROL_COMMAND_PAYLOAD_SIZE {
            return Err(Error::WrongPayloadLength);
        }
        Ok(Self {
            protocol: frame[2],
            command_type: u16::from_le_bytes([frame[3], frame[4]]),
            data: frame[7..7 + size].to_vec(),
        })
    }

    pub fn write(&self, frame: &mut [u8]) {
        write_header(frame, MessageType::ControlCommand, Ack::Request);
        frame[2] = self.protocol;
        frame[3..5].copy_from_slice(&self.command_type.to_le_bytes());
        let len = self.data.len().min(MAX_CONTROL_COMMAND_PAYLOAD_SIZE);
        frame[5..7].copy_from_slice(&(len as u16).to_le_bytes());
        frame[7..7 + len].copy_from_slice(&self.data[..len]);
    }
}

/// Yield: `[type][empty_interrupt_slots]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct YieldRequest {
    pub yield_type: u8,
    pub empty_interrupt_slots: u8,
}

impl YieldRequest {
    pub fn parse(frame: &[u8]) -> Self {
        Self {
            yield_type: frame[2],
            empty_interrupt_slots: frame[3],
        }
    }

    pub fn write(&self, frame: &mut [u8]) {
        write_header(frame, MessageType::Yield, Ack::Request);
        frame[2] = self.yield_type;
        frame[3] = self.empty_interrupt_slots;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> [u8; MAX_PAYLOAD] {
        [0u8; MAX_PAYLOAD]
    }

    #[test]
    fn test_header_round_trip() {
        let mut buf = frame();
        write_header(&mut buf, MessageType::Continue, Ack::NoRequest);
        assert_eq!(read_message_type(&buf), MessageType::Continue as u8);
        assert_eq!(read_ack(&buf), Ack::NoRequest);
        write_ack(&mut buf, Ack::TooLarge);
        assert_eq!(read_ack(&buf), Ack::TooLarge);
    }

    #[test]
    fn test_ack_wire_values() {
        assert_eq!(Ack::Success as i8, 0);
        assert_eq!(Ack::NoRequest as i8, 1);
        assert_eq!(Ack::Request as i8, 2);
        assert_eq!(Ack::InProgress as i8, 3);
        assert_eq!(Ack::TooLarge as i8, 13);
        assert_eq!(Ack::from_wire(9), Ack::Busy);
        assert_eq!(Ack::from_wire(-5), Ack::Undefined);
    }

    #[test]
    fn test_log_str_round_trip() {
        let request = LogRequest {
            flags: log_flags::NEWLINE,
            payload: LogPayload::Str("hello".into()),
        };
        let mut buf = frame();
        request.write(&mut buf);
        assert_eq!(read_message_type(&buf), MessageType::Log as u8);
        assert_eq!(LogRequest::parse(&buf).unwrap(), request);
    }

    #[test]
    fn test_log_oversized_str_rejected() {
        let mut buf = frame();
        buf[0] = MessageType::Log as u8;
        buf[2] = log_type::STR;
        buf[4] = MAX_LOG_STRING_LENGTH as u8 + 1;
        assert_eq!(LogRequest::parse(&buf), Err(Error::WrongPayloadLength));
    }

    #[test]
    fn test_pin_round_trip() {
        let request = PinRequest {
            pin: 3,
            pin_type: pin::TYPE_INIT,
            direction: pin::DIRECTION_INPUT,
            polarity: pin::POLARITY_RISING,
            action: 0,
            value: 0,
        };
        let mut buf = frame();
        request.write(&mut buf);
        assert_eq!(PinRequest::parse(&buf), request);
    }

    #[test]
    fn test_service_data_round_trip_and_bound() {
        let request = ServiceDataRequest {
            app_uuid: 0xABCD,
            data: vec![1, 2, 3],
        };
        let mut buf = frame();
        request.write(&mut buf);
        assert_eq!(ServiceDataRequest::parse(&buf).unwrap(), request);

        buf[4] = MAX_SERVICE_DATA_LENGTH as u8 + 1;
        assert_eq!(
            ServiceDataRequest::parse(&buf),
            Err(Error::WrongPayloadLength)
        );
    }

    #[test]
    fn test_ble_round_trip() {
        let message = BleMessage {
            ble_type: ble::SCAN_SCANNED_DEVICE,
            address_type: 1,
            address: [1, 2, 3, 4, 5, 6],
            rssi: -70,
            data: vec![2, 0xFF, 9],
        };
        let mut buf = frame();
        message.write(&mut buf);
        assert_eq!(BleMessage::parse(&buf).unwrap(), message);
    }

    #[test]
    fn test_mesh_round_trip_and_bound() {
        let message = MeshMessage {
            mesh_type: mesh::SEND,
            stone_id: 0,
            data: vec![1, 2, 3, 4, 5, 6, 7],
        };
        let mut buf = frame();
        message.write(&mut buf);
        assert_eq!(MeshMessage::parse(&buf).unwrap(), message);

        buf[4] = MAX_MESH_PAYLOAD_SIZE as u8 + 1;
        assert_eq!(MeshMessage::parse(&buf), Err(Error::WrongPayloadLength));
    }

    #[test]
    fn test_presence_and_power_usage_replies() {
        let mut buf = frame();
        PresenceRequest {
            profile_id: 2,
            presence_bitmask: 0,
        }
        .write(&mut buf);
        PresenceRequest::write_bitmask(&mut buf, 0x0102_0304_0506_0708);
        assert_eq!(
            PresenceRequest::parse(&buf).presence_bitmask,
            0x0102_0304_0506_0708
        );

        let mut buf = frame();
        PowerUsageRequest {
            usage_type: power_usage::POWER,
            value_milliwatt: 0,
        }
        .write(&mut buf);
        PowerUsageRequest::write_value(&mut buf, -1500);
        assert_eq!(PowerUsageRequest::parse(&buf).value_milliwatt, -1500);
    }

    #[test]
    fn test_control_command_round_trip_and_bound() {
        let request = ControlCommandRequest {
            protocol: 5,
            command_type: 0x0102,
            data: vec![9; 10],
        };
        let mut buf = frame();
        request.write(&mut buf);
        assert_eq!(ControlCommandRequest::parse(&buf).unwrap(), request);

        buf[5..7].copy_from_slice(&(MAX_CONTROL_COMMAND_PAYLOAD_SIZE as u16 + 1).to_le_bytes());
        assert_eq!(
            ControlCommandRequest::parse(&buf),
            Err(Error::WrongPayloadLength)
        );
    }

    #[test]
    fn test_yield_round_trip() {
        let request = YieldRequest {
            yield_type: yield_type::LOOP,
            empty_interrupt_slots: 3,
        };
        let mut buf = frame();
        request.write(&mut buf);
        assert_eq!(YieldRequest::parse(&buf), request);
    }

    #[test]
    fn test_message_type_decoding() {
        assert_eq!(MessageType::from_wire(0x0C), Ok(MessageType::Continue));
        assert_eq!(MessageType::from_wire(0x0D), Err(Error::UnknownType));
    }
}
