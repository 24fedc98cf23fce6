//! # Error Types
//!
//! Custom error types for the OpenTherm gateway using `thiserror`.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the OpenTherm gateway
#[derive(Debug, Error)]
pub enum OpenThermError {
    /// Malformed bit stream (start/stop bit, missing transition, truncated frame)
    #[error("Framing error: {0}")]
    Framing(String),

    /// Frame failed the even-parity check
    #[error("Parity error in frame 0x{0:08X}")]
    Parity(u32),

    /// No response arrived within the protocol window
    #[error("Timeout: no response within {0:?}")]
    Timeout(Duration),

    /// Response message type or data-id does not match the request
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Slave answered DATA-INVALID for the data-id
    #[error("Slave reported data-id {0} as invalid")]
    DataInvalid(u8),

    /// Slave answered UNKNOWN-DATAID
    #[error("Slave does not support data-id {0}")]
    UnknownDataId(u8),

    /// No value has been decoded yet for the data-id
    #[error("No value available for data-id {0}")]
    Unavailable(u8),

    /// Request sat in the queue past its deadline
    #[error("Request for data-id {0} expired before transmission")]
    Expired(u8),

    /// Request was cancelled before transmission
    #[error("Request cancelled")]
    Cancelled,

    /// Command rejected before reaching the line
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// GPIO driver errors
    #[error("GPIO error: {0}")]
    Gpio(String),

    /// Driver task is gone
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OpenThermError {
    /// Whether the failure says something about the health of the line
    ///
    /// An UNKNOWN-DATAID answer is a well-formed response: the link works,
    /// the boiler simply lacks the parameter.
    pub fn counts_as_link_failure(&self) -> bool {
        !matches!(
            self,
            OpenThermError::UnknownDataId(_)
                | OpenThermError::Cancelled
                | OpenThermError::InvalidCommand(_)
                | OpenThermError::Unavailable(_)
        )
    }
}

/// Result type alias for the OpenTherm gateway
pub type Result<T> = std::result::Result<T, OpenThermError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_data_id_is_not_a_link_failure() {
        assert!(!OpenThermError::UnknownDataId(115).counts_as_link_failure());
        assert!(OpenThermError::Timeout(Duration::from_millis(800)).counts_as_link_failure());
        assert!(OpenThermError::Parity(0x8000_0000).counts_as_link_failure());
        assert!(OpenThermError::DataInvalid(25).counts_as_link_failure());
    }

    #[test]
    fn test_error_messages() {
        let err = OpenThermError::Parity(0x1234_5678);
        assert_eq!(err.to_string(), "Parity error in frame 0x12345678");

        let err = OpenThermError::Unavailable(25);
        assert!(err.to_string().contains("25"));
    }
}
