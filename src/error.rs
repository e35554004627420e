//! Error types for PCM communication.

use thiserror::Error;

/// Main error type for all VPW dialog operations.
#[derive(Debug, Error)]
pub enum ObdError {
    /// Generic protocol failure, including checksum mismatches and broken
    /// invariants.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Frame shorter than its mode requires.
    #[error("frame truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    /// Frame decoded but did not match the expected response.
    #[error("unexpected response")]
    UnexpectedResponse,

    /// No matching response within the retry window.
    #[error("timed out waiting for response")]
    Timeout,

    /// Cancellation token observed.
    #[error("operation cancelled")]
    Cancelled,

    /// The module returned a negative response for this request.
    #[error("request 0x{mode:02X} refused, code 0x{code:02X}")]
    Refused { mode: u8, code: u8 },

    /// I/O failure in the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port failure in the underlying transport.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl ObdError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        ObdError::Protocol(msg.into())
    }
}

/// Result type alias using ObdError.
pub type Result<T> = std::result::Result<T, ObdError>;

/// Descriptions for the well-known negative response codes.
pub fn refusal_description(code: u8) -> &'static str {
    match code {
        0x10 => "General reject",
        0x11 => "Mode not supported",
        0x12 => "Sub-function not supported",
        0x21 => "Busy - repeat request",
        0x22 => "Conditions not correct",
        0x31 => "Request out of range",
        0x33 => "Security access denied",
        0x35 => "Invalid key",
        0x36 => "Exceeded number of attempts",
        0x37 => "Required time delay not expired",
        0x78 => "Response pending",
        _ => "Unknown refusal code",
    }
}
