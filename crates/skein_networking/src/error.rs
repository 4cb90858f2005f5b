//! # Networking Error Types
//!
//! Errors raised by setup code: configuration, sockets, handshakes.
//! Hot paths report `bool`/`Option` instead and log the cause.

use thiserror::Error;

use crate::wire::FrameError;

/// Errors that can occur while configuring or starting peers.
#[derive(Error, Debug)]
pub enum NetError {
    /// Socket or file operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A TOML file could not be parsed.
    #[error("failed to parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    /// A TOML file could not be written.
    #[error("failed to write toml: {0}")]
    TomlWrite(#[from] toml::ser::Error),

    /// Operation not allowed in the current peer state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// WebSocket handshake or protocol failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Stream framing violation.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Result type for networking setup operations.
pub type NetResult<T> = Result<T, NetError>;
