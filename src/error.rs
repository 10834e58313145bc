//! Failures surfaced by the chat service.
//!
//! Lookup failures are never fatal: their `Display` text is the exact line replied to the client
//! that issued the command.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing name")]
    MissingName,
    #[error("not registered")]
    NotRegistered,
    #[error("no such account")]
    NoSuchAccount,
    #[error("account not connected")]
    NotConnected,
    /// Either side is already relaying, or the caller asked to chat with itself.
    #[error("account busy")]
    Busy,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
