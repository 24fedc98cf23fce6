//! # OpenTherm Frame Decoder
//!
//! Validates received words and decodes data values.

use super::frame::{Frame, MessageType};
use super::parity::has_even_parity;
use crate::error::{OpenThermError, Result};

/// Decode a received 32-bit word into a frame
///
/// # Errors
///
/// Returns error if:
/// - The word has odd parity (`Parity`)
/// - The message type is the reserved code 3 (`Framing`)
pub fn decode(raw: u32) -> Result<Frame> {
    if !has_even_parity(raw) {
        return Err(OpenThermError::Parity(raw));
    }

    let type_bits = ((raw >> 28) & 0x07) as u8;
    if MessageType::from_bits(type_bits).is_none() {
        return Err(OpenThermError::Framing(format!(
            "reserved message type {} in frame 0x{:08X}",
            type_bits, raw
        )));
    }

    Ok(Frame::from_raw_unchecked(raw))
}

/// Decode a signed f8.8 fixed-point value
///
/// # Examples
///
/// ```
/// use opentherm_gateway::protocol::decoder::f88_to_f32;
///
/// assert_eq!(f88_to_f32(0x1900), 25.0);
/// assert_eq!(f88_to_f32(0xFF00), -1.0);
/// ```
pub fn f88_to_f32(value: u16) -> f32 {
    (value as i16) as f32 / 256.0
}

/// Split a data value into signed high and low bytes
pub fn s8_pair(value: u16) -> (i8, i8) {
    ((value >> 8) as u8 as i8, (value & 0xFF) as u8 as i8)
}

/// Split a data value into unsigned high and low bytes
pub fn u8_pair(value: u16) -> (u8, u8) {
    ((value >> 8) as u8, (value & 0xFF) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encoder::{encode, f88_from_f32};
    use proptest::prelude::*;

    fn message_type() -> impl Strategy<Value = MessageType> {
        prop_oneof![
            Just(MessageType::ReadData),
            Just(MessageType::WriteData),
            Just(MessageType::InvalidData),
            Just(MessageType::ReadAck),
            Just(MessageType::WriteAck),
            Just(MessageType::DataInvalid),
            Just(MessageType::UnknownDataId),
        ]
    }

    #[test]
    fn test_decode_valid_frame() {
        let frame = decode(0xC019_1900).unwrap();
        assert_eq!(frame.msg_type(), MessageType::ReadAck);
        assert_eq!(frame.data_id(), 25);
        assert_eq!(f88_to_f32(frame.data_value()), 25.0);
    }

    #[test]
    fn test_decode_parity_error() {
        // Same frame with the parity bit cleared
        let result = decode(0x4019_1900);
        assert!(matches!(result, Err(OpenThermError::Parity(0x4019_1900))));
    }

    #[test]
    fn test_decode_reserved_message_type() {
        // msg type 3, two bits set, even parity
        let result = decode(0x3000_0000);
        assert!(matches!(result, Err(OpenThermError::Framing(_))));
    }

    #[test]
    fn test_f88_decoding() {
        assert_eq!(f88_to_f32(0x0000), 0.0);
        assert_eq!(f88_to_f32(0x2D80), 45.5);
        assert_eq!(f88_to_f32(0xFAC0), -5.25);
        assert_eq!(f88_to_f32(0x0180), 1.5);
    }

    #[test]
    fn test_byte_pairs() {
        assert_eq!(s8_pair(0x50_14), (80, 20));
        assert_eq!(s8_pair(0xFF_F6), (-1, -10));
        assert_eq!(u8_pair(0x01_80), (1, 128));
    }

    proptest! {
        #[test]
        fn prop_encode_decode_round_trip(
            msg_type in message_type(),
            data_id in any::<u8>(),
            data_value in any::<u16>(),
        ) {
            let frame = decode(encode(msg_type, data_id, data_value).raw()).unwrap();
            prop_assert_eq!(frame.msg_type(), msg_type);
            prop_assert_eq!(frame.data_id(), data_id);
            prop_assert_eq!(frame.data_value(), data_value);
        }

        #[test]
        fn prop_single_bit_flip_is_rejected(
            data_id in any::<u8>(),
            data_value in any::<u16>(),
            bit in 0u32..32,
        ) {
            let raw = encode(MessageType::ReadAck, data_id, data_value).raw();
            prop_assert!(decode(raw ^ (1 << bit)).is_err());
        }

        #[test]
        fn prop_f88_round_trip(value in -127.0f32..127.0) {
            let decoded = f88_to_f32(f88_from_f32(value));
            prop_assert!((decoded - value).abs() <= 1.0 / 256.0);
        }
    }
}
