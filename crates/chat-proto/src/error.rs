use std::io;

use thiserror::Error;

/// Error taxonomy for the framing codec, sanitiser, and connection state machine.
///
/// Every variant here is handled local to the offending connection; none of
/// them propagate to siblings or to the dispatcher.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("malformed frame: {0}")]
    Framing(#[from] FramingError),

    #[error("socket I/O failed")]
    Io(#[from] io::Error),

    #[error("registration conflict: {0}")]
    RegistrationConflict(String),

    #[error("unexpected status or frame while awaiting a status round-trip")]
    UnexpectedStatus,

    #[error("connection inactive past the configured timeout")]
    InactivityTimeout,

    #[error("resource exhausted while building a task or buffer")]
    ResourceExhaustion,
}

/// Specific ways a frame can fail to parse.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("opcode byte {0:#04x} is not one of {{1,2,3,4}}")]
    BadOpcode(u8),

    #[error("declared length {0} exceeds the 4095 byte maximum")]
    OversizeLength(u16),

    #[error("socket closed or errored mid-frame")]
    PartialFrame,

    #[error("frame did not match the current connection state")]
    UnexpectedFrame,
}
