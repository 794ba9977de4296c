use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Synchronous status codes returned by the public API surface.
///
/// Asynchronous outcome failures never travel through this type; they arrive
/// via the `*Failed` client events carrying the server status code.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no such entity: {0}")]
    NoSuchEntity(String),
    #[error("not connected: {0}")]
    NotConnected(String),
    #[error("request submission failed: {0}")]
    Transport(String),
}

impl ClientError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn no_such_entity(message: impl Into<String>) -> Self {
        Self::NoSuchEntity(message.into())
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::NotConnected(message.into())
    }
}

/// Status codes carried by responses and events; zero is success.
pub mod status {
    pub const OK: i32 = 0;

    /// DNS/socket class failures the backend surfaces on logout events.
    pub const NETWORK_UNREACHABLE: i32 = 10006;
    pub const NAME_RESOLUTION_FAILED: i32 = 10007;
    pub const CONNECTION_TIMED_OUT: i32 = 10008;

    pub fn is_network_class(code: i32) -> bool {
        matches!(
            code,
            NETWORK_UNREACHABLE | NAME_RESOLUTION_FAILED | CONNECTION_TIMED_OUT
        )
    }
}
