//! Error types for the control library

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ControlError>;

#[derive(Error, Debug)]
pub enum ControlError {
    /// The serial is not an even-length hex string.
    #[error("invalid serial number format: {0}")]
    InvalidSerialFormat(String),

    /// The serial decodes to more bytes than fit in the 4-byte wire field.
    #[error("serial number is {0} bytes long, at most 4 are allowed")]
    SerialTooLong(usize),

    /// Discovery finished without a matching reply.
    #[error("no device found on the local network")]
    DeviceNotFound,

    /// The last liveness check did not get an answer from the device.
    #[error("device at {0} is unavailable")]
    DeviceUnavailable(String),

    /// The control packet could not be handed to the network stack.
    #[error("failed to transmit command to {0}")]
    CommandTransmissionFailed(String),

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),
}
