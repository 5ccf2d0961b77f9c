use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast,
};
use tokio_rustls::TlsAcceptor;

use crate::{
    config::ListenConfig,
    error::{ConnectionError, SessionError},
    gateway::Gateway,
    internal, outgoing,
    smtp::{command::HeloVariant, connection::Connection, state::State},
    status::Status,
    Signal,
};

mod auth;
mod io;
mod response;

pub use response::reply;

/// Longest command or SASL line accepted before it is answered with 500.
pub const COMMAND_LINE_LIMIT: usize = 4096;

/// Message content is read in pieces of at most this size.
pub const DATA_LINE_LIMIT: usize = 65536;

/// Unrecognised commands tolerated before the session is closed.
pub const MAX_UNRECOGNISED: usize = 10;

#[derive(PartialEq, Eq, Debug)]
pub enum Event {
    ConnectionClose,
    ConnectionKeepAlive,
}

pub type Response = (Option<Vec<String>>, Event);

/// The envelope of the transaction in progress.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub declared_size: Option<usize>,
}

#[derive(Debug, Default)]
pub struct Context {
    pub state: State,
    pub helo: Option<HeloVariant>,
    /// Bound by a successful AUTH.
    pub identity: Option<String>,
    pub transaction: Transaction,
    pub message: Vec<u8>,
    /// The message went over the size limit; the rest of DATA is discarded.
    pub oversized: bool,
    /// The previous DATA piece ended a line.
    pub line_start: bool,
    /// An overlong command line is being skipped.
    pub discarding: bool,
    pub unrecognised: usize,
}

pub struct SessionConfig {
    pub server_name: String,
    pub banner: Option<String>,
    /// `None` is unlimited.
    pub max_size: Option<usize>,
    pub size_hidden: bool,
    pub allow_insecure_auth: bool,
    /// Used for STARTTLS on plain sessions.
    pub tls: Option<TlsAcceptor>,
    pub socket_timeout: Duration,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("server_name", &self.server_name)
            .field("banner", &self.banner)
            .field("max_size", &self.max_size)
            .field("size_hidden", &self.size_hidden)
            .field("allow_insecure_auth", &self.allow_insecure_auth)
            .field("tls", &self.tls.is_some())
            .field("socket_timeout", &self.socket_timeout)
            .finish()
    }
}

impl SessionConfig {
    /// Create a new `SessionConfig` builder
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    #[must_use]
    pub fn from_listen(listen: &ListenConfig, tls: Option<TlsAcceptor>) -> Self {
        Self::builder()
            .with_server_name(listen.server_name())
            .with_banner(listen.banner.clone())
            .with_max_size(listen.max_size)
            .with_size_hidden(listen.size_hidden)
            .with_insecure_auth(listen.allows_insecure_auth())
            .with_tls(tls)
            .with_socket_timeout(listen.socket_timeout())
            .build()
    }
}

/// Builder for `SessionConfig`
#[derive(Default)]
pub struct SessionConfigBuilder {
    server_name: Option<String>,
    banner: Option<String>,
    max_size: Option<usize>,
    size_hidden: bool,
    allow_insecure_auth: bool,
    tls: Option<TlsAcceptor>,
    socket_timeout: Option<Duration>,
}

impl SessionConfigBuilder {
    #[must_use]
    pub fn with_server_name(mut self, server_name: String) -> Self {
        self.server_name = Some(server_name);
        self
    }

    #[must_use]
    pub fn with_banner(mut self, banner: Option<String>) -> Self {
        self.banner = banner;
        self
    }

    #[must_use]
    pub const fn with_max_size(mut self, max_size: Option<usize>) -> Self {
        self.max_size = max_size;
        self
    }

    #[must_use]
    pub const fn with_size_hidden(mut self, size_hidden: bool) -> Self {
        self.size_hidden = size_hidden;
        self
    }

    /// Allow AUTH before the session is secured
    #[must_use]
    pub const fn with_insecure_auth(mut self, allow: bool) -> Self {
        self.allow_insecure_auth = allow;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: Option<TlsAcceptor>) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub const fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn build(self) -> SessionConfig {
        SessionConfig {
            server_name: self
                .server_name
                .unwrap_or_else(|| String::from("localhost")),
            banner: self.banner,
            max_size: self.max_size,
            size_hidden: self.size_hidden,
            allow_insecure_auth: self.allow_insecure_auth,
            tls: self.tls,
            socket_timeout: self.socket_timeout.unwrap_or(Duration::from_secs(60)),
        }
    }
}

fn millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    peer: SocketAddr,
    pub(super) context: Context,
    pub(super) config: Arc<SessionConfig>,
    pub(super) gateway: Arc<Gateway>,
    pub(super) connection: Connection<Stream>,
    /// TLS was negotiated before the session started.
    secured: bool,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub fn create(
        stream: Stream,
        peer: SocketAddr,
        config: Arc<SessionConfig>,
        gateway: Arc<Gateway>,
        secured: bool,
    ) -> Self {
        Self {
            peer,
            context: Context::default(),
            config,
            gateway,
            connection: Connection::new(stream),
            secured,
        }
    }

    pub(super) fn tls_active(&self) -> bool {
        self.secured || self.connection.is_tls()
    }

    pub(super) fn auth_allowed(&self) -> bool {
        self.tls_active() || self.config.allow_insecure_auth
    }

    fn line_limit(&self) -> usize {
        if matches!(self.context.state, State::Reading) {
            DATA_LINE_LIMIT
        } else {
            COMMAND_LINE_LIMIT
        }
    }

    async fn send(&mut self, response: &str) -> Result<(), SessionError> {
        outgoing!("{response}");

        self.connection.send(&response).await.map_err(|err| {
            internal!(level = ERROR, "{err}");
            SessionError::from(err)
        })?;

        Ok(())
    }

    /// Drive the dialogue until the client leaves, the session fails, or
    /// the server shuts down.
    ///
    /// # Errors
    /// If the connection fails, the peer idles out, or STARTTLS fails
    pub async fn run(self, signal: broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        let peer = self.peer;
        internal!("Connected to {peer}");

        let result = self.serve(signal).await;

        match &result {
            Ok(()) => internal!("Connection to {peer} closed"),
            Err(err) => internal!(level = DEBUG, "Connection to {peer} closed: {err}"),
        }

        result
    }

    async fn serve(mut self, mut signal: broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        let greeting = self.greeting();
        self.send(&greeting).await?;

        loop {
            let limit = self.line_limit();
            let timeout = self.config.socket_timeout;

            let line = tokio::select! {
                Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed) = signal.recv() => {
                    self.context.state = State::Close;
                    self.send(&format!("{} Server shutting down", Status::Unavailable)).await?;
                    self.close().await;
                    return Err(SessionError::Shutdown);
                }
                line = tokio::time::timeout(timeout, self.connection.read_line(limit)) => line,
            };

            let line = match line {
                Err(_) => {
                    tracing::warn!(
                        peer = ?self.peer,
                        state = %self.context.state,
                        "Client connection timed out"
                    );
                    self.context.state = State::Close;
                    self.send(&format!("{} Timeout - closing connection", Status::Unavailable))
                        .await?;
                    self.close().await;
                    return Err(SessionError::Timeout(millis(timeout)));
                }
                Ok(Err(err)) => return Err(err.into()),
                Ok(Ok(None)) => return Ok(()),
                Ok(Ok(Some(line))) => line,
            };

            let (responses, event) = self.receive(line).await;

            for response in responses.unwrap_or_default() {
                self.send(&response).await?;
            }

            if event == Event::ConnectionClose {
                self.close().await;
                return Ok(());
            }

            if matches!(self.context.state, State::StartTls) {
                let Some(acceptor) = self.config.tls.clone() else {
                    return Err(crate::error::TlsError::NotConfigured.into());
                };

                // The handshake owns the connection until it completes
                let handshake = tokio::time::timeout(timeout, self.connection.upgrade(&acceptor));
                let (connection, info) = tokio::select! {
                    Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed) = signal.recv() => {
                        internal!(level = DEBUG, "Shutdown during TLS negotiation with {}", self.peer);
                        return Err(SessionError::Shutdown);
                    }
                    upgraded = handshake => match upgraded {
                        Ok(upgraded) => upgraded?,
                        Err(_) => {
                            internal!(level = WARN, "TLS negotiation with {} timed out", self.peer);
                            return Err(SessionError::Timeout(millis(timeout)));
                        }
                    },
                };

                self.connection = connection;
                self.context = Context::default();

                internal!(
                    level = DEBUG,
                    "Connection from {} upgraded to {} using {}",
                    self.peer,
                    info.proto(),
                    info.cipher()
                );
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.connection.shutdown().await {
            let not_connected = matches!(
                err,
                ConnectionError::Io(ref io) if io.kind() == std::io::ErrorKind::NotConnected
            );
            if !not_connected {
                internal!(level = DEBUG, "Error closing connection: {err}");
            }
        }
    }
}
