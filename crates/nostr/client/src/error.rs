//! Client error types

use crate::filter::FilterError;
use crate::message::MessageError;
use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed wire message
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Filter could not be built
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// The relay connection is gone
    #[error("Connection dropped: {0}")]
    ConnectionDropped(String),

    /// None of the requested relays could be reached
    #[error("Failed to connect to any of the given relays")]
    NoRelaysConnected,

    /// Forced pre-auth was refused, so the relay is left out of the pool
    #[error("Authentication refused by {relay}: {reason}")]
    AuthRefused { relay: String, reason: String },
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
