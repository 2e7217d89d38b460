//! Error types for the SD card bridge.

use thiserror::Error;

/// Errors from bridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// FTP server answered with an unexpected reply.
    #[error("FTP error {code}: {message}")]
    Ftp {
        /// Three digit reply code.
        code: u16,
        /// Reply text.
        message: String,
    },

    /// TLS setup or handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// MQTT error.
    #[error("MQTT error: {0}")]
    MqttError(String),

    /// Short name space for a file is exhausted.
    #[error("no collision free short name for {0}")]
    ShortNameExhausted(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Timeout error.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid response.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Config file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
