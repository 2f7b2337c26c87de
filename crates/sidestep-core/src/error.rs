//! Error types for sidestep-core
//!
//! Centralized error handling using `thiserror`. The per-packet hot
//! path never surfaces these upward: a packet that fails to parse is
//! accepted unchanged so the local client is not harmed.

use thiserror::Error;

/// Main error type for sidestep-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Packet is too small to process
    #[error("packet too small: expected at least {expected} bytes, got {actual}")]
    PacketTooSmall {
        /// Minimum expected size
        expected: usize,
        /// Actual packet size
        actual: usize,
    },

    /// Packet parsing failed
    #[error("packet parse error: {0}")]
    PacketParse(String),

    /// Strategy execution failed
    #[error("strategy '{strategy}' failed: {message}")]
    Strategy {
        /// Name of the strategy that failed
        strategy: &'static str,
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file not found
    #[error("configuration file not found: {path}")]
    ConfigNotFound {
        /// Path to the missing config file
        path: String,
    },

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {message}")]
    ConfigValue {
        /// Configuration key
        key: String,
        /// Error message
        message: String,
    },

    /// No migration path between config versions
    #[error("no migration path from config version {from} to {to}")]
    ConfigMigration {
        /// Version the document carries
        from: u32,
        /// Version the migration chain stopped at
        to: u32,
    },

    /// Kernel queue binding failed (fatal at startup)
    #[error("queue {queue_num} bind failed: {message}")]
    QueueBind {
        /// Queue number that failed to bind
        queue_num: u16,
        /// Error message
        message: String,
    },

    /// Raw socket error
    #[error("raw socket error: {0}")]
    RawSocket(String),

    /// Packet injection failed
    #[error("send failed: {0}")]
    Send(String),

    /// Discovery probe failed
    #[error("probe '{probe}' failed: {message}")]
    Probe {
        /// Probe name
        probe: &'static str,
        /// Error message
        message: String,
    },

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Hex decoding error
    #[error("hex decoding error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a packet parse error
    pub fn packet_parse(message: impl Into<String>) -> Self {
        Self::PacketParse(message.into())
    }

    /// Create a strategy error
    pub fn strategy(strategy: &'static str, message: impl Into<String>) -> Self {
        Self::Strategy {
            strategy,
            message: message.into(),
        }
    }

    /// Create a config value error
    pub fn config_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValue {
            key: key.into(),
            message: message.into(),
        }
    }
}
