//! # OpenTherm Frame Encoder
//!
//! Builds frames and encodes data values.

use super::frame::{Frame, MessageType};
use super::parity::with_parity;

/// Encode the fields of a frame and compute its parity bit
///
/// # Arguments
///
/// * `msg_type` - Message type
/// * `data_id` - Data-id selecting the boiler parameter
/// * `data_value` - 16-bit data value
///
/// # Examples
///
/// ```
/// use opentherm_gateway::protocol::encoder::encode;
/// use opentherm_gateway::protocol::frame::MessageType;
///
/// let frame = encode(MessageType::ReadData, 25, 0);
/// assert_eq!(frame.data_id(), 25);
/// assert!(frame.is_parity_valid());
/// ```
pub fn encode(msg_type: MessageType, data_id: u8, data_value: u16) -> Frame {
    Frame::from_raw_unchecked(with_parity(Frame::pack(msg_type, data_id, data_value)))
}

/// Build a READ-DATA request
pub fn read_request(data_id: u8) -> Frame {
    encode(MessageType::ReadData, data_id, 0)
}

/// Build a WRITE-DATA request
pub fn write_request(data_id: u8, data_value: u16) -> Frame {
    encode(MessageType::WriteData, data_id, data_value)
}

/// Encode a temperature (or any f8.8 quantity) as signed fixed point
///
/// Rounds to the nearest 1/256 and saturates at the i16 range.
///
/// # Examples
///
/// ```
/// use opentherm_gateway::protocol::encoder::f88_from_f32;
///
/// assert_eq!(f88_from_f32(60.0), 0x3C00);
/// assert_eq!(f88_from_f32(-1.0), 0xFF00);
/// ```
pub fn f88_from_f32(value: f32) -> u16 {
    let scaled = (value * 256.0).round();
    let clamped = scaled.clamp(i16::MIN as f32, i16::MAX as f32);
    (clamped as i16) as u16
}

/// Pack two bytes into a data value (high byte first)
pub fn u8_pair(high: u8, low: u8) -> u16 {
    ((high as u16) << 8) | low as u16
}
