use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    rustls::{ProtocolVersion, ServerConnection, SupportedCipherSuite},
    server::TlsStream,
    TlsAcceptor,
};

use crate::{
    error::{ConnectionResult, TlsError, TlsResult},
    internal,
};

const READ_CHUNK: usize = 8192;

#[derive(Debug)]
pub struct TlsInfo {
    version: Option<ProtocolVersion>,
    cipher: Option<SupportedCipherSuite>,
}

impl TlsInfo {
    pub(crate) fn of(conn: &ServerConnection) -> Self {
        Self {
            version: conn.protocol_version(),
            cipher: conn.negotiated_cipher_suite(),
        }
    }

    #[must_use]
    pub fn proto(&self) -> String {
        self.version
            .and_then(|version| version.as_str())
            .map(str::to_string)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn cipher(&self) -> String {
        self.cipher
            .and_then(|cipher| cipher.suite().as_str())
            .map(str::to_string)
            .unwrap_or_default()
    }
}

/// The client side of an inbound session, with its own line buffer.
pub enum Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain {
        stream: Stream,
        read_buf: Vec<u8>,
    },
    Tls {
        stream: Box<TlsStream<Stream>>,
        read_buf: Vec<u8>,
    },
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub(crate) fn new(stream: Stream) -> Self {
        Self::Plain {
            stream,
            read_buf: Vec::new(),
        }
    }

    pub(crate) fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }

    pub(crate) async fn send<S: core::fmt::Display + Send + Sync>(
        &mut self,
        response: &S,
    ) -> ConnectionResult<usize> {
        let line = format!("{response}\r\n");

        match self {
            Self::Plain { stream, .. } => {
                stream.write_all(line.as_bytes()).await?;
                stream.flush().await?;
            }
            Self::Tls { stream, .. } => {
                stream.write_all(line.as_bytes()).await?;
                stream.flush().await?;
            }
        }

        Ok(line.len())
    }

    async fn fill(&mut self) -> ConnectionResult<usize> {
        let mut chunk = [0; READ_CHUNK];

        let (read, read_buf) = match self {
            Self::Plain { stream, read_buf } => (stream.read(&mut chunk).await?, read_buf),
            Self::Tls { stream, read_buf } => (stream.read(&mut chunk).await?, read_buf),
        };

        read_buf.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    fn buffer(&mut self) -> &mut Vec<u8> {
        match self {
            Self::Plain { read_buf, .. } | Self::Tls { read_buf, .. } => read_buf,
        }
    }

    /// Next line including its terminator.
    ///
    /// Lines longer than `max` come back in pieces of `max` bytes, none of
    /// which ends with `\n` except the last. At end of stream any unterminated
    /// remainder is returned before `None`.
    ///
    /// Cancel safe: bytes read before cancellation stay buffered.
    pub(crate) async fn read_line(&mut self, max: usize) -> ConnectionResult<Option<Vec<u8>>> {
        loop {
            let buffer = self.buffer();

            if let Some(end) = buffer.iter().take(max).position(|b| *b == b'\n') {
                return Ok(Some(buffer.drain(..=end).collect()));
            }

            if buffer.len() >= max {
                return Ok(Some(buffer.drain(..max).collect()));
            }

            if self.fill().await? == 0 {
                let buffer = self.buffer();
                return Ok((!buffer.is_empty()).then(|| std::mem::take(buffer)));
            }
        }
    }

    /// Negotiate TLS over a plain connection. Anything the client pipelined
    /// before the handshake is discarded.
    pub(crate) async fn upgrade(self, acceptor: &TlsAcceptor) -> TlsResult<(Self, TlsInfo)> {
        internal!(level = DEBUG, "Upgrading connection ...");

        match self {
            Self::Plain { stream, .. } => {
                let stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|err| TlsError::UpgradeFailed(err.to_string()))?;
                let info = TlsInfo::of(stream.get_ref().1);

                Ok((
                    Self::Tls {
                        stream: Box::new(stream),
                        read_buf: Vec::new(),
                    },
                    info,
                ))
            }
            Self::Tls { .. } => Err(TlsError::UpgradeFailed(
                "Connection is already secured".to_string(),
            )),
        }
    }

    pub(crate) async fn shutdown(&mut self) -> ConnectionResult<()> {
        match self {
            Self::Plain { stream, .. } => stream.shutdown().await?,
            Self::Tls { stream, .. } => stream.shutdown().await?,
        }
        Ok(())
    }
}
