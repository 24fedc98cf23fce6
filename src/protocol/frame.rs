//! # OpenTherm Frame Constants and Types
//!
//! Core protocol definitions for the OpenTherm data frame.
//!
//! ```text
//!  31  30..28   27..24  23..16    15..0
//! | P | MSG-TYPE | SPARE | DATA-ID | DATA-VALUE |
//! ```

use super::parity::has_even_parity;

/// Number of data bits in a frame (excluding start and stop bits)
pub const FRAME_DATA_BITS: usize = 32;

/// Number of bits on the wire (start + data + stop)
pub const FRAME_WIRE_BITS: usize = FRAME_DATA_BITS + 2;

/// Bit period on the wire in microseconds
pub const BIT_PERIOD_US: u64 = 1000;

/// Half-bit period in microseconds (Manchester symbols are two halves)
pub const HALF_BIT_US: u64 = BIT_PERIOD_US / 2;

/// Slave must start its response within this window after the request ends
pub const RESPONSE_TIMEOUT_MS: u64 = 800;

/// Slave must not respond earlier than this after the request ends
pub const MIN_RESPONSE_DELAY_MS: u64 = 20;

/// Master must wait at least this long between the end of a response and the next request
pub const INTER_FRAME_GAP_MS: u64 = 100;

const PARITY_BIT: u32 = 1 << 31;
const MSG_TYPE_SHIFT: u32 = 28;
const DATA_ID_SHIFT: u32 = 16;

/// OpenTherm message type (3-bit field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Master → slave: read request
    ReadData = 0,
    /// Master → slave: write request
    WriteData = 1,
    /// Master → slave: master data invalid
    InvalidData = 2,
    /// Slave → master: read acknowledge
    ReadAck = 4,
    /// Slave → master: write acknowledge
    WriteAck = 5,
    /// Slave → master: slave data invalid
    DataInvalid = 6,
    /// Slave → master: data-id not supported
    UnknownDataId = 7,
}

impl MessageType {
    /// Parse the 3-bit message type field; the reserved code 3 yields `None`
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0x07 {
            0 => Some(Self::ReadData),
            1 => Some(Self::WriteData),
            2 => Some(Self::InvalidData),
            4 => Some(Self::ReadAck),
            5 => Some(Self::WriteAck),
            6 => Some(Self::DataInvalid),
            7 => Some(Self::UnknownDataId),
            _ => None,
        }
    }

    /// Raw 3-bit value
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// Master-to-slave message types
    pub fn is_request(self) -> bool {
        matches!(self, Self::ReadData | Self::WriteData | Self::InvalidData)
    }

    /// Acknowledge type a well-behaved slave answers a request with
    pub fn expected_ack(self) -> Option<MessageType> {
        match self {
            Self::ReadData => Some(Self::ReadAck),
            Self::WriteData => Some(Self::WriteAck),
            Self::InvalidData => Some(Self::DataInvalid),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ReadData => "READ-DATA",
            Self::WriteData => "WRITE-DATA",
            Self::InvalidData => "INVALID-DATA",
            Self::ReadAck => "READ-ACK",
            Self::WriteAck => "WRITE-ACK",
            Self::DataInvalid => "DATA-INVALID",
            Self::UnknownDataId => "UNKNOWN-DATAID",
        };
        f.write_str(name)
    }
}

/// A 32-bit OpenTherm frame
///
/// Built through [`encode`](super::encoder::encode) (which sets the parity
/// bit) or [`decode`](super::decoder::decode) (which verifies it), so a
/// `Frame` held by the rest of the crate always has a valid message type and
/// even parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame(u32);

impl Frame {
    /// Wrap a raw word that has already been validated
    pub(crate) fn from_raw_unchecked(raw: u32) -> Self {
        Self(raw)
    }

    /// Assemble the 31 non-parity bits of a frame
    pub(crate) fn pack(msg_type: MessageType, data_id: u8, data_value: u16) -> u32 {
        ((msg_type.bits() as u32) << MSG_TYPE_SHIFT)
            | ((data_id as u32) << DATA_ID_SHIFT)
            | data_value as u32
    }

    /// Raw 32-bit word as transmitted
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Message type field
    pub fn msg_type(self) -> MessageType {
        // Construction guarantees a non-reserved type
        MessageType::from_bits(((self.0 >> MSG_TYPE_SHIFT) & 0x07) as u8)
            .unwrap_or(MessageType::InvalidData)
    }

    /// Data-id field
    pub fn data_id(self) -> u8 {
        ((self.0 >> DATA_ID_SHIFT) & 0xFF) as u8
    }

    /// Data-value field
    pub fn data_value(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// High byte of the data value
    pub fn high_byte(self) -> u8 {
        (self.data_value() >> 8) as u8
    }

    /// Low byte of the data value
    pub fn low_byte(self) -> u8 {
        (self.data_value() & 0xFF) as u8
    }

    /// Parity bit as transmitted
    pub fn parity(self) -> bool {
        self.0 & PARITY_BIT != 0
    }

    /// Whether the full word has an even number of set bits
    pub fn is_parity_valid(self) -> bool {
        has_even_parity(self.0)
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} id={} value=0x{:04X}",
            self.msg_type(),
            self.data_id(),
            self.data_value()
        )
    }
}
