//! The seam between the relay engine and the wire.
//!
//! The engine only sees [`Connector`] and [`Transport`]; the production
//! implementations drive [`SmtpClient`] against the configured upstream.

use std::{future::Future, time::Duration};

use async_trait::async_trait;

use super::error::{DeliveryError, PermanentError, TemporaryError};
use crate::{
    client::{self, Response, SmtpClient},
    config::{ClientTimeouts, SendAuthType, SendConfig},
    internal,
};

/// Upstream envelope for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub recipients: Vec<String>,
}

/// A successful upstream transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// Final reply text from the upstream.
    pub response: String,
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
}

/// One open upstream connection.
#[async_trait]
pub trait Transport: Send {
    /// Run MAIL / RCPT / DATA for one message.
    async fn send(&mut self, envelope: &Envelope, data: &[u8]) -> Result<Delivered, DeliveryError>;

    /// Abandon a failed transaction so the connection can be reused.
    async fn reset(&mut self) -> Result<(), DeliveryError>;

    /// Whether an idle connection can still carry a message.
    async fn is_alive(&mut self) -> bool;

    /// Say goodbye. Errors are ignored.
    async fn close(&mut self);
}

/// Opens ready-to-use transports (greeted, secured, authenticated).
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, DeliveryError>;
}

/// Upper bound on the NOOP sent before an idle connection is reused.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

async fn timed<T, F>(limit: Duration, step: &str, fut: F) -> Result<T, DeliveryError>
where
    F: Future<Output = client::Result<T>> + Send,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TemporaryError::Timeout(format!("{step} timed out after {limit:?}")))?
        .map_err(DeliveryError::from)
}

/// Connects to the configured upstream host.
#[derive(Debug, Clone)]
pub struct SmtpConnector {
    send: SendConfig,
    /// Name announced in EHLO.
    helo_name: String,
}

impl SmtpConnector {
    #[must_use]
    pub const fn new(send: SendConfig, helo_name: String) -> Self {
        Self { send, helo_name }
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.send.timeouts.command_secs)
    }

    async fn ehlo(&self, client: &mut SmtpClient) -> Result<Response, DeliveryError> {
        let response = timed(self.command_timeout(), "EHLO", client.ehlo(&self.helo_name)).await?;
        if response.is_permanent_error() {
            return timed(self.command_timeout(), "HELO", client.helo(&self.helo_name))
                .await?
                .into_result()
                .map_err(DeliveryError::from);
        }

        response.into_result().map_err(DeliveryError::from)
    }

    async fn secure(
        &self,
        client: &mut SmtpClient,
        ehlo: Response,
    ) -> Result<Response, DeliveryError> {
        if client.is_tls() {
            return Ok(ehlo);
        }

        if !ehlo.has_capability("STARTTLS") {
            if self.send.use_tls {
                return Err(PermanentError::TlsRequired(format!(
                    "{} does not offer STARTTLS",
                    self.send.host
                ))
                .into());
            }
            return Ok(ehlo);
        }

        let response = timed(self.command_timeout(), "STARTTLS", client.starttls()).await;
        match response {
            Ok(response) if response.is_success() => self.ehlo(client).await,
            Ok(response) if !self.send.use_tls => {
                internal!(
                    level = DEBUG,
                    "STARTTLS refused by {} ({}), continuing without TLS",
                    self.send.host,
                    response.code
                );
                Ok(ehlo)
            }
            Ok(response) => Err(PermanentError::TlsRequired(format!(
                "STARTTLS refused: {} {}",
                response.code,
                response.message()
            ))
            .into()),
            Err(err) if self.send.use_tls => {
                Err(PermanentError::TlsRequired(err.to_string()).into())
            }
            Err(err) => Err(err),
        }
    }

    async fn authenticate(&self, client: &mut SmtpClient) -> Result<(), DeliveryError> {
        let Some(user) = self.send.user.as_deref() else {
            return Ok(());
        };
        let pass = self.send.pass.as_deref().unwrap_or_default();
        let limit = self.command_timeout();

        let response = match self.send.auth_type {
            SendAuthType::Login => timed(limit, "AUTH LOGIN", client.auth_login(user, pass)).await?,
            SendAuthType::Plain => timed(limit, "AUTH PLAIN", client.auth_plain(user, pass)).await?,
            SendAuthType::OAuth2 => {
                let token = self.send.oauth2.access_token.as_deref().unwrap_or_default();
                timed(limit, "AUTH XOAUTH2", client.auth_xoauth2(user, token)).await?
            }
        };

        if response.is_success() {
            Ok(())
        } else if response.is_temporary_error() {
            Err(TemporaryError::SmtpTemporary(format!(
                "{} {}",
                response.code,
                response.message()
            ))
            .into())
        } else {
            Err(PermanentError::AuthenticationFailed(format!(
                "{} {}",
                response.code,
                response.message()
            ))
            .into())
        }
    }
}

#[async_trait]
impl Connector for SmtpConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, DeliveryError> {
        let address = self.send.address();
        let connect_timeout = Duration::from_secs(self.send.timeouts.connect_secs);

        let connecting = async {
            if self.send.use_ssl {
                SmtpClient::connect_tls(&address, self.send.host.clone()).await
            } else {
                SmtpClient::connect(&address, self.send.host.clone()).await
            }
        };

        let mut client = timed(connect_timeout, "Connect", connecting)
            .await
            .map_err(|err| match err {
                DeliveryError::Temporary(TemporaryError::ConnectionFailed(reason)) => {
                    TemporaryError::ConnectionFailed(format!(
                        "Failed to connect to {address}: {reason}"
                    ))
                    .into()
                }
                other => other,
            })?
            .debug(self.send.debug);

        let greeting = timed(self.command_timeout(), "Greeting", client.read_greeting()).await?;
        if !greeting.is_success() {
            return Err(TemporaryError::ServerBusy(format!(
                "Server rejected connection: {} {}",
                greeting.code,
                greeting.message()
            ))
            .into());
        }

        let ehlo = self.ehlo(&mut client).await?;
        self.secure(&mut client, ehlo).await?;
        self.authenticate(&mut client).await?;

        internal!(level = DEBUG, "Connected to upstream {address}");

        Ok(Box::new(SmtpTransport {
            client,
            timeouts: self.send.timeouts.clone(),
        }))
    }
}

pub struct SmtpTransport {
    client: SmtpClient,
    timeouts: ClientTimeouts,
}

impl SmtpTransport {
    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.command_secs)
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&mut self, envelope: &Envelope, data: &[u8]) -> Result<Delivered, DeliveryError> {
        let limit = self.command_timeout();

        timed(limit, "MAIL FROM", self.client.mail_from(&envelope.sender))
            .await?
            .into_result()?;

        let mut accepted = Vec::with_capacity(envelope.recipients.len());
        let mut rejected = Vec::new();
        let mut last_rejection = None;
        for recipient in &envelope.recipients {
            let response = timed(limit, "RCPT TO", self.client.rcpt_to(recipient)).await?;
            if response.is_success() {
                accepted.push(recipient.clone());
            } else {
                rejected.push(recipient.clone());
                last_rejection = Some(response);
            }
        }

        if accepted.is_empty() {
            return Err(match last_rejection {
                Some(response) if response.is_temporary_error() => TemporaryError::SmtpTemporary(
                    format!("{} {}", response.code, response.message()),
                )
                .into(),
                Some(response) => PermanentError::InvalidRecipient(format!(
                    "{} {}",
                    response.code,
                    response.message()
                ))
                .into(),
                None => PermanentError::NoRecipients.into(),
            });
        }

        let response = timed(limit, "DATA", self.client.data()).await?;
        if response.code != 354 {
            return Err(client::ClientError::UnexpectedResponse {
                code: response.code,
                message: response.message(),
            }
            .into());
        }

        let data_timeout = Duration::from_secs(self.timeouts.data_secs);
        let response = timed(data_timeout, "Message data", self.client.send_data(data))
            .await?
            .into_result()?;

        Ok(Delivered {
            response: response.message(),
            accepted,
            rejected,
        })
    }

    async fn reset(&mut self) -> Result<(), DeliveryError> {
        timed(self.command_timeout(), "RSET", self.client.rset())
            .await?
            .into_result()?;
        Ok(())
    }

    async fn is_alive(&mut self) -> bool {
        let limit = self.command_timeout().min(LIVENESS_TIMEOUT);
        match timed(limit, "NOOP", self.client.noop()).await {
            Ok(response) => response.is_success(),
            Err(err) => {
                internal!(level = DEBUG, "Idle upstream connection is gone: {err}");
                false
            }
        }
    }

    async fn close(&mut self) {
        let limit = Duration::from_secs(self.timeouts.quit_secs);
        if let Err(err) = timed(limit, "QUIT", self.client.quit()).await {
            internal!(level = DEBUG, "QUIT failed: {err}");
        }
    }
}
