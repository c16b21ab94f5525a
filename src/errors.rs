//! Command result codes shared across the runtime core.
//!
//! Every public command operation returns `Result<CmdOk, Error>`: the error
//! side enumerates the failure kinds surfaced to command sources, the ok side
//! distinguishes "done", "nothing to do" and "completing asynchronously".

use thiserror::Error;

/// Failure kinds surfaced by command operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("unsupported protocol version: {0}")]
    ProtocolUnsupported(u8),

    #[error("invalid message")]
    InvalidMessage,

    #[error("operation not valid in current state")]
    WrongState,

    #[error("wrong payload length")]
    WrongPayloadLength,

    #[error("no space")]
    NoSpace,

    #[error("not found")]
    NotFound,

    #[error("checksum or version mismatch")]
    Mismatch,

    #[error("unsafe operation refused")]
    Unsafe,

    #[error("busy")]
    Busy,

    #[error("not implemented")]
    NotImplemented,

    #[error("unknown type")]
    UnknownType,
}

/// Successful command completion kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdOk {
    /// The operation completed and changed state.
    Success,
    /// The operation completed but nothing needed to change.
    NoChange,
    /// The operation was accepted and completes asynchronously.
    WaitForSuccess,
}

/// Result type for command operations.
pub type CmdResult = Result<CmdOk, Error>;
