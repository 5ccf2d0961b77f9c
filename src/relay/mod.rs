//! Outbound relay engine.
//!
//! A bounded pool of upstream connections behind a semaphore, a sliding
//! rate window, and per-connection retirement after a fixed number of
//! messages. [`RelayEngine::deliver`] is safe to call from any number of
//! sessions at once; only the calling task waits when the pool or the rate
//! window is saturated, and never past the configured queue timeout.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::{
    sync::Semaphore,
    time::{Duration, Instant},
};

use crate::{config::SendConfig, internal, message::Message};

pub mod error;
pub mod rate;
pub mod transport;

pub use error::{DeliveryError, PermanentError, SystemError, TemporaryError};
pub use rate::RateWindow;
pub use transport::{Connector, Delivered, Envelope, SmtpConnector, SmtpTransport, Transport};

pub type DeliveryOutcome = Result<Delivered, DeliveryError>;

/// Pool and pacing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    pub max_connections: usize,
    pub max_messages_per_connection: usize,
    pub pooling: bool,
    pub rate_limit: usize,
    pub rate_delta: Duration,
    pub queue_timeout: Duration,
}

impl From<&SendConfig> for RelaySettings {
    fn from(send: &SendConfig) -> Self {
        Self {
            max_connections: send.max_connections.max(1),
            max_messages_per_connection: send.max_messages_per_connection.max(1),
            pooling: send.pooling,
            rate_limit: send.rate_limit,
            rate_delta: send.rate_delta(),
            queue_timeout: send.queue_timeout(),
        }
    }
}

struct PooledConnection {
    id: u64,
    transport: Box<dyn Transport>,
    delivered: usize,
}

/// Bare address for `MAIL FROM`, taken from a header-style sender such as
/// `"Relay" <relay@example.com>`.
#[must_use]
pub fn envelope_sender(from: &str) -> String {
    mailparse::addrparse(from)
        .ok()
        .and_then(|list| {
            list.iter().find_map(|addr| match addr {
                mailparse::MailAddr::Single(info) => Some(info.addr.clone()),
                mailparse::MailAddr::Group(_) => None,
            })
        })
        .unwrap_or_else(|| from.trim().to_string())
}

pub struct RelayEngine {
    connector: Arc<dyn Connector>,
    settings: RelaySettings,
    sender: String,
    permits: Semaphore,
    idle: parking_lot::Mutex<Vec<PooledConnection>>,
    rate: RateWindow,
    next_id: AtomicU64,
}

impl RelayEngine {
    #[must_use]
    pub fn new(settings: RelaySettings, sender: &str, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            settings,
            sender: envelope_sender(sender),
            permits: Semaphore::new(settings.max_connections),
            idle: parking_lot::Mutex::new(Vec::with_capacity(settings.max_connections)),
            rate: RateWindow::new(settings.rate_limit, settings.rate_delta),
            next_id: AtomicU64::new(1),
        }
    }

    /// Engine talking SMTP to the configured upstream.
    #[must_use]
    pub fn from_config(send: &SendConfig, helo_name: String) -> Self {
        tracing::warn!(
            upstream = %send.address(),
            "SECURITY WARNING: upstream TLS certificates are not validated"
        );

        Self::new(
            RelaySettings::from(send),
            &send.from,
            Arc::new(SmtpConnector::new(send.clone(), helo_name)),
        )
    }

    #[must_use]
    pub const fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Number of pooled connections currently waiting for work.
    #[must_use]
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    /// Relay one normalized message to the upstream.
    ///
    /// # Errors
    /// A classified [`DeliveryError`]; nothing is retried
    pub async fn deliver(&self, message: &Message) -> DeliveryOutcome {
        let recipients = message.recipients();
        if recipients.is_empty() {
            return Err(PermanentError::NoRecipients.into());
        }

        let envelope = Envelope {
            sender: self.sender.clone(),
            recipients,
        };
        let data = message.to_bytes();

        let deadline = Instant::now() + self.settings.queue_timeout;

        let _permit = tokio::time::timeout_at(deadline, self.permits.acquire())
            .await
            .map_err(|_| {
                TemporaryError::QueueTimeout(format!(
                    "no relay connection available within {:?}",
                    self.settings.queue_timeout
                ))
            })?
            .map_err(|err| SystemError::Internal(err.to_string()))?;

        self.rate.acquire(deadline).await?;

        let mut connection = self.checkout().await?;

        internal!(
            level = DEBUG,
            "Relaying to {} recipient(s) over connection #{}",
            envelope.recipients.len(),
            connection.id
        );

        let result = connection.transport.send(&envelope, &data).await;
        connection.delivered += 1;

        match &result {
            Ok(delivered) => {
                internal!(
                    level = INFO,
                    "Relayed message to {} recipient(s): {}",
                    delivered.accepted.len(),
                    delivered.response
                );
                self.release(connection).await;
            }
            Err(err) if err.retires_connection() => {
                internal!(level = WARN, "Relay failed on connection #{}: {err}", connection.id);
                self.retire(connection).await;
            }
            Err(err) => {
                internal!(level = WARN, "Relay rejected on connection #{}: {err}", connection.id);
                match connection.transport.reset().await {
                    Ok(()) => self.release(connection).await,
                    Err(_) => self.retire(connection).await,
                }
            }
        }

        result
    }

    /// Close every idle connection.
    pub async fn shutdown(&self) {
        let idle = std::mem::take(&mut *self.idle.lock());
        for connection in idle {
            self.retire(connection).await;
        }
    }

    /// An idle connection that still answers, or a fresh one.
    async fn checkout(&self) -> Result<PooledConnection, DeliveryError> {
        while let Some(mut connection) = self.take_idle() {
            if connection.transport.is_alive().await {
                return Ok(connection);
            }

            internal!(
                level = DEBUG,
                "Relay connection #{} closed while idle, replacing it",
                connection.id
            );
            self.retire(connection).await;
        }

        self.open().await
    }

    fn take_idle(&self) -> Option<PooledConnection> {
        if self.settings.pooling {
            self.idle.lock().pop()
        } else {
            None
        }
    }

    async fn open(&self) -> Result<PooledConnection, DeliveryError> {
        let transport = self.connector.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        internal!(level = DEBUG, "Opened relay connection #{id}");

        Ok(PooledConnection {
            id,
            transport,
            delivered: 0,
        })
    }

    /// Return a healthy connection to the pool, or close it when pooling is
    /// off or it has reached its message allowance.
    async fn release(&self, connection: PooledConnection) {
        if self.settings.pooling
            && connection.delivered < self.settings.max_messages_per_connection
        {
            self.idle.lock().push(connection);
        } else {
            self.retire(connection).await;
        }
    }

    async fn retire(&self, mut connection: PooledConnection) {
        internal!(
            level = DEBUG,
            "Retiring relay connection #{} after {} message(s)",
            connection.id,
            connection.delivered
        );
        connection.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::envelope_sender;

    #[test]
    fn sender_address_extraction() {
        assert_eq!(envelope_sender("relay@example.com"), "relay@example.com");
        assert_eq!(
            envelope_sender("\"Relay\" <relay@example.com>"),
            "relay@example.com"
        );
        assert_eq!(envelope_sender(" not an address "), "not an address");
    }
}
