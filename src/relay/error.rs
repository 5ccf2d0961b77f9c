//! Typed error handling for relay deliveries.
//!
//! - Permanent failures (5xx replies, policy) are reported to the submitter as 554
//! - Temporary failures (4xx replies, network, waits) are reported as 451
//! - System errors are internal faults, also reported as 451

use thiserror::Error;

use crate::client::ClientError;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    #[error("System error: {0}")]
    System(#[from] SystemError),
}

#[derive(Debug, Error)]
pub enum PermanentError {
    /// Every recipient was refused by the upstream.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// The upstream refused the message with a 5xx reply.
    #[error("Message rejected: {0}")]
    MessageRejected(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("TLS required: {0}")]
    TlsRequired(String),

    /// The normalized message names nobody to deliver to.
    #[error("No recipients defined")]
    NoRecipients,
}

#[derive(Debug, Error)]
pub enum TemporaryError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Server busy: {0}")]
    ServerBusy(String),

    /// No rate window slot became free before the deadline.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// No pool slot became free before the deadline.
    #[error("Relay queue full: {0}")]
    QueueTimeout(String),

    #[error("Connection timed out: {0}")]
    Timeout(String),

    #[error("Temporary SMTP error: {0}")]
    SmtpTemporary(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),
}

#[derive(Debug, Error)]
pub enum SystemError {
    /// The upstream sent something that is not SMTP.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// Whether the connection that produced this error must be discarded
    /// rather than reset and reused.
    #[must_use]
    pub const fn retires_connection(&self) -> bool {
        matches!(
            self,
            Self::System(_)
                | Self::Temporary(
                    TemporaryError::ConnectionFailed(_)
                        | TemporaryError::ServerBusy(_)
                        | TemporaryError::Timeout(_)
                        | TemporaryError::TlsHandshakeFailed(_)
                )
                | Self::Permanent(
                    PermanentError::AuthenticationFailed(_) | PermanentError::TlsRequired(_)
                )
        )
    }
}

impl From<ClientError> for DeliveryError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Io(e) => TemporaryError::ConnectionFailed(e.to_string()).into(),
            ClientError::ConnectionClosed => {
                TemporaryError::ConnectionFailed(err.to_string()).into()
            }
            ClientError::TlsError(e) => TemporaryError::TlsHandshakeFailed(e).into(),
            ClientError::SmtpError { code, message }
            | ClientError::UnexpectedResponse { code, message } => match code {
                400..=499 => TemporaryError::SmtpTemporary(format!("{code} {message}")).into(),
                500..=599 => PermanentError::MessageRejected(format!("{code} {message}")).into(),
                _ => SystemError::Protocol(format!("Unexpected reply {code} {message}")).into(),
            },
            ClientError::ParseError(e) => SystemError::Protocol(e).into(),
            ClientError::Utf8Error(e) => SystemError::Protocol(e.to_string()).into(),
        }
    }
}
