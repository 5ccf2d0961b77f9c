use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{broadcast, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;

use crate::{
    config::ListenConfig,
    error::{SessionError, StartupError},
    gateway::Gateway,
    internal,
    smtp::session::{Session, SessionConfig},
    status::Status,
    Signal,
};

/// Accepts inbound connections and runs one session task per client.
pub struct Listener {
    listener: TcpListener,
    session: Arc<SessionConfig>,
    gateway: Arc<Gateway>,
    /// Present when every connection starts with a TLS handshake.
    implicit_tls: Option<TlsAcceptor>,
    clients: Arc<Semaphore>,
    max_clients: usize,
    close_timeout: Duration,
}

impl Listener {
    /// Bind the listening socket described by `listen`.
    ///
    /// `tls` serves STARTTLS on plain listeners and the handshake on
    /// secured ones.
    ///
    /// # Errors
    /// If the address cannot be bound, or the listener is secured without
    /// TLS material
    pub async fn bind(
        listen: &ListenConfig,
        gateway: Arc<Gateway>,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self, StartupError> {
        let address = listen.address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| StartupError::BindFailed { address, source })?;

        let implicit_tls = if listen.secured {
            Some(tls.clone().ok_or(crate::error::TlsError::NotConfigured)?)
        } else {
            None
        };

        Ok(Self {
            listener,
            session: Arc::new(SessionConfig::from_listen(listen, tls)),
            gateway,
            implicit_tls,
            clients: Arc::new(Semaphore::new(listen.max_clients)),
            max_clients: listen.max_clients,
            close_timeout: listen.close_timeout(),
        })
    }

    /// The bound address; useful when binding port 0.
    ///
    /// # Errors
    /// If the socket has no local address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown is signalled, then give the open
    /// sessions up to the close timeout before aborting them.
    ///
    /// # Errors
    /// Currently infallible once bound; accept failures are logged and skipped
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) -> anyhow::Result<()> {
        let address = self.local_addr()?;
        internal!(level = INFO, "SMTP Listener serving on {address}");

        let mut sessions: Vec<JoinHandle<()>> = Vec::default();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        internal!(
                            level = INFO,
                            "SMTP Listener {address} Received Shutdown signal, finishing sessions ..."
                        );
                        self.drain(sessions).await;
                        break;
                    }
                }

                connection = self.listener.accept() => {
                    match connection {
                        Ok((stream, peer)) => {
                            internal!(
                                level = DEBUG,
                                "Connection received on {address} from {peer}"
                            );
                            sessions.retain(|session| !session.is_finished());
                            if let Some(session) = self.accept(stream, peer, &shutdown) {
                                sessions.push(session);
                            }
                        }
                        Err(err) => internal!(level = ERROR, "Failed to accept connection: {err}"),
                    }
                }
            }
        }

        Ok(())
    }

    fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: &broadcast::Receiver<Signal>,
    ) -> Option<JoinHandle<()>> {
        let Ok(permit) = Arc::clone(&self.clients).try_acquire_owned() else {
            internal!(
                level = WARN,
                "Rejecting {peer}: {} clients already connected",
                self.max_clients
            );
            let reply = format!(
                "{} {} Too many connected clients, try again in a moment\r\n",
                Status::Unavailable,
                self.session.server_name
            );
            tokio::spawn(reject(stream, reply));
            return None;
        };

        let config = Arc::clone(&self.session);
        let gateway = Arc::clone(&self.gateway);
        let signal = shutdown.resubscribe();

        let handle = match self.implicit_tls.clone() {
            Some(acceptor) => tokio::spawn(async move {
                let mut signal = signal;
                let handshake =
                    tokio::time::timeout(config.socket_timeout, acceptor.accept(stream));

                let stream = tokio::select! {
                    Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed) = signal.recv() => {
                        internal!(level = DEBUG, "Shutdown during TLS handshake with {peer}");
                        return;
                    }
                    handshake = handshake => match handshake {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(err)) => {
                            internal!(level = WARN, "TLS handshake with {peer} failed: {err}");
                            return;
                        }
                        Err(_) => {
                            internal!(
                                level = WARN,
                                "TLS handshake with {peer} timed out after {:?}",
                                config.socket_timeout
                            );
                            return;
                        }
                    },
                };

                let session = Session::create(stream, peer, config, gateway, true);
                run_session(session, signal, permit).await;
            }),
            None => tokio::spawn(async move {
                let session = Session::create(stream, peer, config, gateway, false);
                run_session(session, signal, permit).await;
            }),
        };

        Some(handle)
    }

    async fn drain(&self, mut sessions: Vec<JoinHandle<()>>) {
        sessions.retain(|session| !session.is_finished());
        if sessions.is_empty() {
            return;
        }

        let waiting = sessions.len();
        if tokio::time::timeout(self.close_timeout, join_all(sessions.iter_mut()))
            .await
            .is_err()
        {
            let remaining = sessions.iter().filter(|s| !s.is_finished()).count();
            internal!(
                level = WARN,
                "{remaining} of {waiting} sessions still open after {:?}, aborting",
                self.close_timeout
            );
            for session in &sessions {
                session.abort();
            }
        }
    }
}

async fn run_session<Stream>(
    session: Session<Stream>,
    signal: broadcast::Receiver<Signal>,
    _permit: OwnedSemaphorePermit,
) where
    Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    match session.run(signal).await {
        Ok(()) => {}
        Err(SessionError::Shutdown) => {}
        Err(err) if err.is_client_error() => internal!(level = DEBUG, "{err}"),
        Err(err) => internal!(level = ERROR, "Error: {err}"),
    }
}

async fn reject(mut stream: TcpStream, reply: String) {
    if let Err(err) = stream.write_all(reply.as_bytes()).await {
        internal!(level = DEBUG, "Unable to send rejection: {err}");
    }
    let _ = stream.shutdown().await;
}
