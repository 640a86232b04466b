//! Wire-format error types

use thiserror::Error;

/// Errors raised while decoding USB wire structures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Fewer bytes than the structure requires
    #[error("Descriptor truncated: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// A descriptor claimed a length that cannot be right
    #[error("Invalid descriptor length {length} at offset {offset}")]
    InvalidLength { length: u8, offset: usize },

    /// The descriptor type byte did not match what was requested
    #[error("Unexpected descriptor type {found:#04x} (expected {expected:#04x})")]
    UnexpectedType { expected: u8, found: u8 },

    /// A string descriptor did not contain valid UTF-16
    #[error("Invalid string descriptor encoding")]
    InvalidString,

    /// An endpoint descriptor appeared before any interface descriptor
    #[error("Endpoint descriptor outside of an interface")]
    OrphanEndpoint,
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::Truncated {
            needed: 18,
            available: 8,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("truncated"));
        assert!(msg.contains("18"));
        assert!(msg.contains("8"));
    }

    #[test]
    fn test_unexpected_type_error() {
        let err = ProtocolError::UnexpectedType {
            expected: 0x02,
            found: 0x01,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("0x01"));
        assert!(msg.contains("0x02"));
    }
}
