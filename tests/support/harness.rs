//! End-to-end harness
//!
//! Starts a [`MockSmtpServer`] as the upstream and the relay's listener in
//! front of it, both on random loopback ports.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use smtp_relay::{
    config::{Config, ListenConfig, PemSource, SendConfig, TlsMaterial},
    gateway::Gateway,
    listener::Listener,
    Signal,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::broadcast,
    task::JoinHandle,
    time::timeout,
};

use super::mock_server::MockSmtpServer;

pub const SERVER_NAME: &str = "relay.test";
pub const SEND_FROM: &str = "relay@example.com";

pub struct RelayHarness {
    addr: SocketAddr,
    mock_server: MockSmtpServer,
    gateway: Arc<Gateway>,
    listener_handle: JoinHandle<anyhow::Result<()>>,
    shutdown_tx: broadcast::Sender<Signal>,
}

impl RelayHarness {
    #[must_use]
    pub fn builder() -> RelayHarnessBuilder {
        RelayHarnessBuilder {
            credentials: None,
            max_size: None,
            max_clients: 10,
            close_timeout_ms: 1_000,
            socket_timeout_ms: 60_000,
            rcpt_to_code: 250,
            implicit_tls: false,
            upstream_hangs_up: false,
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub const fn mock(&self) -> &MockSmtpServer {
        &self.mock_server
    }

    #[must_use]
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Open a client connection and read the greeting
    pub async fn connect(&self) -> anyhow::Result<(Client, String)> {
        let mut client = Client::connect(self.addr).await?;
        let greeting = client.reply().await?;
        Ok((client, greeting))
    }

    /// Wait for the upstream to receive `count` messages
    pub async fn wait_for_messages(
        &self,
        count: usize,
        limit: Duration,
    ) -> anyhow::Result<Vec<Vec<u8>>> {
        let start = tokio::time::Instant::now();

        loop {
            let messages = self.mock_server.messages().await;
            if messages.len() >= count {
                return Ok(messages);
            }

            if start.elapsed() > limit {
                anyhow::bail!(
                    "Timeout waiting for delivery. Mock server received {} messages",
                    messages.len()
                );
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Signal shutdown and wait for the listener to finish draining
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(Signal::Shutdown);

        let result = timeout(Duration::from_secs(5), self.listener_handle).await??;

        self.gateway.shutdown().await;
        self.mock_server.shutdown();

        result
    }
}

pub struct RelayHarnessBuilder {
    credentials: Option<(String, String)>,
    max_size: Option<usize>,
    max_clients: usize,
    close_timeout_ms: u64,
    socket_timeout_ms: u64,
    rcpt_to_code: u16,
    implicit_tls: bool,
    upstream_hangs_up: bool,
}

/// The self-signed `localhost` certificate and key under `tests/fixtures`.
#[must_use]
pub fn fixture_tls() -> TlsMaterial {
    let path = |name: &str| {
        PemSource::Path(format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR")).into())
    };

    TlsMaterial {
        cert: Some(path("localhost.crt")),
        key: Some(path("localhost.key")),
    }
}

impl RelayHarnessBuilder {
    /// Require AUTH with these credentials
    #[must_use]
    pub fn with_credentials(mut self, user: &str, pass: &str) -> Self {
        self.credentials = Some((user.to_string(), pass.to_string()));
        self
    }

    #[must_use]
    pub const fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    #[must_use]
    pub const fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    #[must_use]
    pub const fn with_close_timeout_ms(mut self, close_timeout_ms: u64) -> Self {
        self.close_timeout_ms = close_timeout_ms;
        self
    }

    #[must_use]
    pub const fn with_socket_timeout_ms(mut self, socket_timeout_ms: u64) -> Self {
        self.socket_timeout_ms = socket_timeout_ms;
        self
    }

    /// Every connection starts with a TLS handshake
    #[must_use]
    pub const fn with_implicit_tls(mut self) -> Self {
        self.implicit_tls = true;
        self
    }

    /// The upstream closes each connection after accepting one message
    #[must_use]
    pub const fn with_upstream_hang_up(mut self) -> Self {
        self.upstream_hangs_up = true;
        self
    }

    /// Configure the upstream to refuse every recipient
    #[must_use]
    pub const fn with_upstream_rcpt_rejection(mut self) -> Self {
        self.rcpt_to_code = 550;
        self
    }

    pub async fn build(self) -> anyhow::Result<RelayHarness> {
        let mut mock_server =
            MockSmtpServer::builder().with_rcpt_to_response(self.rcpt_to_code, "No such user");
        if self.upstream_hangs_up {
            mock_server = mock_server.with_hang_up_after_message();
        }
        let mock_server = mock_server.build().await?;

        let listen = ListenConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            auth_required: self.credentials.is_some(),
            user: self.credentials.as_ref().map(|(user, _)| user.clone()),
            pass: self.credentials.as_ref().map(|(_, pass)| pass.clone()),
            server_name: Some(SERVER_NAME.to_string()),
            banner: Some("test relay".to_string()),
            max_size: self.max_size,
            max_clients: self.max_clients,
            close_timeout_ms: self.close_timeout_ms,
            socket_timeout_ms: self.socket_timeout_ms,
            secured: self.implicit_tls,
            tls: if self.implicit_tls {
                fixture_tls()
            } else {
                TlsMaterial::default()
            },
            ..ListenConfig::default()
        };

        let send = SendConfig {
            from: SEND_FROM.to_string(),
            host: "127.0.0.1".to_string(),
            port: mock_server.addr().port(),
            pooling: true,
            ..SendConfig::default()
        };

        let config = Config { listen, send };
        config.validate()?;

        let gateway = Arc::new(Gateway::from_config(&config));
        let tls = if config.listen.tls.is_configured() {
            Some(smtp_relay::tls::acceptor(&config.listen.tls)?)
        } else {
            None
        };
        let listener = Listener::bind(&config.listen, Arc::clone(&gateway), tls).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);
        let listener_handle = tokio::spawn(listener.serve(shutdown_rx));

        Ok(RelayHarness {
            addr,
            mock_server,
            gateway,
            listener_handle,
            shutdown_tx,
        })
    }
}

/// A line-oriented SMTP client for driving the relay
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let (reader, writer) = TcpStream::connect(addr).await?.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub async fn send(&mut self, line: &str) -> anyhow::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read a complete reply; multi-line replies are joined with `\n`
    pub async fn reply(&mut self) -> anyhow::Result<String> {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();
            let read = timeout(Duration::from_secs(5), self.reader.read_line(&mut line)).await??;
            if read == 0 {
                anyhow::bail!("Connection closed after {lines:?}");
            }

            let line = line.trim_end().to_string();
            let last = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line);

            if last {
                return Ok(lines.join("\n"));
            }
        }
    }

    pub async fn command(&mut self, line: &str) -> anyhow::Result<String> {
        self.send(line).await?;
        self.reply().await
    }

    /// Whether the server has closed the connection
    pub async fn closed(&mut self) -> bool {
        let mut line = String::new();
        matches!(
            timeout(Duration::from_secs(5), self.reader.read_line(&mut line)).await,
            Ok(Ok(0) | Err(_))
        )
    }
}
