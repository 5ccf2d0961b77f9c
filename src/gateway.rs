//! Ties the inbound side to the relay: parse, normalize, deliver, reply.

use std::borrow::Cow;

use crate::{
    auth::Authenticator,
    config::Config,
    internal,
    message::Message,
    normalize::normalize,
    relay::{DeliveryError, RelayEngine},
    status::Status,
};

/// A reply line for the end of DATA.
pub type Reply = (Status, Cow<'static, str>);

/// Built once from the configuration and shared by every session.
pub struct Gateway {
    sender: String,
    authenticator: Authenticator,
    relay: RelayEngine,
}

impl Gateway {
    #[must_use]
    pub fn new(config: &Config, relay: RelayEngine) -> Self {
        Self {
            sender: config.send.from.clone(),
            authenticator: Authenticator::from_config(&config.listen),
            relay,
        }
    }

    /// Gateway relaying through the configured upstream.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let relay = RelayEngine::from_config(&config.send, config.listen.server_name());
        Self::new(config, relay)
    }

    #[must_use]
    pub const fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    #[must_use]
    pub const fn relay(&self) -> &RelayEngine {
        &self.relay
    }

    /// Relay one received message and produce the reply for the client.
    pub async fn handle_message(&self, raw: &[u8]) -> Reply {
        let message = match Message::parse(raw) {
            Ok(message) => message,
            Err(err) => {
                internal!(level = WARN, "Unable to parse message: {err}");
                return (
                    Status::TransactionFailed,
                    Cow::Owned(format!("5.6.0 Error: {err}")),
                );
            }
        };

        let message = normalize(message, &self.sender);

        match self.relay.deliver(&message).await {
            Ok(_) => (Status::Ok, Cow::Borrowed("2.0.0 Ok: relayed")),
            Err(err) => {
                internal!(level = ERROR, "Error on relay: {err}");
                reply_for(&err)
            }
        }
    }

    /// Close pooled upstream connections.
    pub async fn shutdown(&self) {
        self.relay.shutdown().await;
    }
}

fn reply_for(err: &DeliveryError) -> Reply {
    match err {
        DeliveryError::Permanent(reason) => (
            Status::TransactionFailed,
            Cow::Owned(format!("5.0.0 {reason}")),
        ),
        DeliveryError::Temporary(reason) => (
            Status::ActionUnavailable,
            Cow::Owned(format!("4.3.0 {reason}")),
        ),
        DeliveryError::System(reason) => (
            Status::ActionUnavailable,
            Cow::Owned(format!("4.3.0 {reason}")),
        ),
    }
}
