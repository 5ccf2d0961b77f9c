//! Error types for the relay's inbound side and process lifetime.
//!
//! Outbound failures live in [`crate::relay::error`] and [`crate::client::error`].

use std::io;

use thiserror::Error;

/// Errors raised while assembling the immutable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting is missing.
    #[error("Missing required setting: {0}")]
    MissingField(&'static str),

    /// A setting is present but cannot be used.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// The configuration file could not be read.
    #[error("Unable to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid TOML for this schema.
    #[error("Unable to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors that can occur during connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),
}

/// Errors that can occur while preparing or performing TLS on the listening side.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to load the certificate chain.
    #[error("Failed to load TLS certificate from {source_name}: {reason}")]
    CertificateLoad { source_name: String, reason: String },

    /// Failed to load the private key.
    #[error("Failed to load TLS private key from {source_name}: {reason}")]
    KeyLoad { source_name: String, reason: String },

    /// The handshake with the peer failed.
    #[error("TLS upgrade failed: {0}")]
    UpgradeFailed(String),

    /// STARTTLS was requested on a session without TLS material.
    #[error("TLS is not configured")]
    NotConfigured,

    #[error("TLS error: {0}")]
    Rustls(String),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

/// Errors that end an inbound session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Shutdown requested")]
    Shutdown,

    /// The peer was idle for longer than the socket timeout.
    #[error("Session timed out after {0} ms")]
    Timeout(u64),
}

impl SessionError {
    /// Returns `true` if the error indicates a graceful shutdown.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Returns `true` if the error is a client-side issue.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_))
    }
}

/// Fatal errors raised before the gateway starts accepting connections.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    /// Failed to bind the listening socket.
    #[error("Failed to bind listener to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },
}

/// Specialized `Result` type for connection operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Specialized `Result` type for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        assert_eq!(
            ConfigError::MissingField("SEND_HOST").to_string(),
            "Missing required setting: SEND_HOST"
        );

        let err = ConfigError::InvalidValue {
            field: "LISTEN_PORT",
            reason: "not a number".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid value for LISTEN_PORT: not a number"
        );
    }

    #[test]
    fn session_error_classification() {
        let err = SessionError::Shutdown;
        assert!(err.is_shutdown());
        assert!(!err.is_client_error());

        let err = SessionError::Timeout(60_000);
        assert!(!err.is_shutdown());
        assert!(err.is_client_error());
        assert_eq!(err.to_string(), "Session timed out after 60000 ms");

        let err = SessionError::Connection(ConnectionError::Closed);
        assert!(!err.is_client_error());
    }

    #[test]
    fn tls_error_display() {
        let err = TlsError::KeyLoad {
            source_name: "/path/to/key.pem".to_string(),
            reason: "invalid format".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to load TLS private key from /path/to/key.pem: invalid format"
        );
    }

    #[test]
    fn io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        let conn_err: ConnectionError = io_err.into();
        assert!(matches!(conn_err, ConnectionError::Io(_)));
    }
}
