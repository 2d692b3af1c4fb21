use std::fmt;

/// Wire error codes carried in `error` reply bodies
pub mod codes {
    pub const TEMPORARILY_UNAVAILABLE: u32 = 11;
    pub const NOT_SUPPORTED: u32 = 10;
    pub const MALFORMED_REQUEST: u32 = 12;
    pub const CRASH: u32 = 13;
}

/// Main error type for a floodcast node
#[derive(Debug)]
pub enum FloodcastError {
    /// Configuration or CLI argument errors
    Config(String),

    /// Envelope or body violates the message protocol
    Protocol(String),

    /// Request kind this node does not handle
    NotSupported(String),

    /// Node has not been assigned an identity yet
    Uninitialized,

    /// System I/O errors
    Io(std::io::Error),

    /// Transport layer errors (closed channels, unknown peers)
    Transport(String),

    /// JSON serialization/deserialization errors
    Serialization(serde_json::Error),

    /// Internal lock poisoning or concurrency errors
    Concurrency(String),
}

impl fmt::Display for FloodcastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FloodcastError::Config(msg) => write!(f, "Configuration error: {}", msg),
            FloodcastError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            FloodcastError::NotSupported(kind) => write!(f, "Unsupported message type: {}", kind),
            FloodcastError::Uninitialized => write!(f, "Node not initialized"),
            FloodcastError::Io(err) => write!(f, "I/O error: {}", err),
            FloodcastError::Transport(msg) => write!(f, "Transport error: {}", msg),
            FloodcastError::Serialization(err) => write!(f, "Serialization error: {}", err),
            FloodcastError::Concurrency(msg) => write!(f, "Concurrency error: {}", msg),
        }
    }
}

impl std::error::Error for FloodcastError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FloodcastError::Io(err) => Some(err),
            FloodcastError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, FloodcastError>;

impl FloodcastError {
    /// Error code reported to the requester in an `error` reply
    pub fn error_code(&self) -> u32 {
        match self {
            FloodcastError::Protocol(_) => codes::MALFORMED_REQUEST,
            FloodcastError::Serialization(_) => codes::MALFORMED_REQUEST,
            FloodcastError::NotSupported(_) => codes::NOT_SUPPORTED,
            FloodcastError::Uninitialized => codes::TEMPORARILY_UNAVAILABLE,
            FloodcastError::Config(_)
            | FloodcastError::Io(_)
            | FloodcastError::Transport(_)
            | FloodcastError::Concurrency(_) => codes::CRASH,
        }
    }

    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            FloodcastError::Config(_) => "configuration_error",
            FloodcastError::Protocol(_) => "protocol_error",
            FloodcastError::NotSupported(_) => "not_supported",
            FloodcastError::Uninitialized => "uninitialized",
            FloodcastError::Io(_) => "io_error",
            FloodcastError::Transport(_) => "transport_error",
            FloodcastError::Serialization(_) => "serialization_error",
            FloodcastError::Concurrency(_) => "concurrency_error",
        }
    }
}

// Conversions from common error types
impl From<std::io::Error> for FloodcastError {
    fn from(err: std::io::Error) -> Self {
        FloodcastError::Io(err)
    }
}

impl From<serde_json::Error> for FloodcastError {
    fn from(err: serde_json::Error) -> Self {
        FloodcastError::Serialization(err)
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::FloodcastError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::FloodcastError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! protocol_error {
    ($msg:expr) => {
        $crate::error::FloodcastError::Protocol($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::FloodcastError::Protocol(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! concurrency_error {
    ($msg:expr) => {
        $crate::error::FloodcastError::Concurrency($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::FloodcastError::Concurrency(format!($fmt, $($arg)*))
    };
}
