//! USB host error types

use core::fmt;

/// USB operation result type
pub type Result<T> = core::result::Result<T, UsbError>;

/// USB host error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// No free slot in a descriptor pool (Device, Pipe or Transfer)
    PoolExhausted,
    /// Endpoint returned STALL
    Stall,
    /// Transaction error reported by the controller (CRC, timeout, bad PID)
    TransactionError,
    /// Babble detected (device sent more data than expected)
    Babble,
    /// Data buffer over/underrun during DMA
    BufferError,
    /// Bounded wait expired (enumeration step or register handshake)
    Timeout,
    /// Malformed or inconsistent descriptor data
    ProtocolViolation,
    /// Invalid argument (address, endpoint, packet size out of range)
    InvalidParameter,
    /// Operation not valid in the current state
    InvalidState,
    /// Device no longer attached
    DeviceDisconnected,
}

impl UsbError {
    /// Whether this error was reported by the controller hardware for a
    /// single transfer, as opposed to a software-detected condition.
    pub fn is_transfer_error(&self) -> bool {
        matches!(
            self,
            Self::Stall | Self::TransactionError | Self::Babble | Self::BufferError
        )
    }
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolExhausted => write!(f, "descriptor pool exhausted"),
            Self::Stall => write!(f, "endpoint stalled"),
            Self::TransactionError => write!(f, "transaction error"),
            Self::Babble => write!(f, "babble detected"),
            Self::BufferError => write!(f, "data buffer error"),
            Self::Timeout => write!(f, "timeout"),
            Self::ProtocolViolation => write!(f, "protocol violation in descriptor data"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::DeviceDisconnected => write!(f, "device disconnected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_error_classification() {
        assert!(UsbError::Stall.is_transfer_error());
        assert!(UsbError::TransactionError.is_transfer_error());
        assert!(!UsbError::PoolExhausted.is_transfer_error());
        assert!(!UsbError::Timeout.is_transfer_error());
    }
}
