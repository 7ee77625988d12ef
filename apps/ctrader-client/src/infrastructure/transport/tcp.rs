//! Raw socket transport with optional TLS.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use super::frame::FrameReader;
use crate::application::ports::{FrameStream, Transport};
use crate::error::{Error, Result};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stream socket transport.
pub struct TcpTransport {
    max_message_size: usize,
    reader: Mutex<Option<BoxedReader>>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    connected: Arc<AtomicBool>,
    close_token: Mutex<CancellationToken>,
}

impl TcpTransport {
    /// Create a disconnected transport.
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            reader: Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            close_token: Mutex::new(CancellationToken::new()),
        }
    }

    async fn install(&self, reader: BoxedReader, writer: BoxedWriter) {
        *self.writer.lock().await = Some(writer);
        *self.reader.lock() = Some(reader);
        *self.close_token.lock() = CancellationToken::new();
        self.connected.store(true, Ordering::Release);
    }
}

fn tls_connector() -> Result<TlsConnector> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let client_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::connection(format!("TLS configuration failed: {e}")))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(client_config)))
}

async fn open_stream(host: &str, port: u16, use_tls: bool) -> Result<(BoxedReader, BoxedWriter)> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;

    if !use_tls {
        let (read_half, write_half) = stream.into_split();
        return Ok((Box::new(read_half), Box::new(write_half)));
    }

    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| Error::connection(format!("invalid TLS server name {host}: {e}")))?;
    let tls_stream = tls_connector()?.connect(server_name, stream).await?;
    let (read_half, write_half) = tokio::io::split(tls_stream);
    Ok((Box::new(read_half), Box::new(write_half)))
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
        use_tls: bool,
    ) -> Result<()> {
        if self.is_connected() {
            self.close().await?;
        }

        tracing::debug!(host, port, use_tls, "Opening socket");

        let (reader, writer) = tokio::time::timeout(timeout, open_stream(host, port, use_tls))
            .await
            .map_err(|_| {
                Error::connection(format!("connect to {host}:{port} timed out after {timeout:?}"))
            })?
            .map_err(|e| match e {
                Error::Io(io) => Error::connection(format!("connect to {host}:{port} failed: {io}")),
                other => other,
            })?;

        self.install(reader, writer).await;
        tracing::info!(host, port, use_tls, "Socket connected");
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::connection("send on a closed transport"));
        }
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::connection("send on a closed transport"))?;

        let written: std::io::Result<()> = async {
            writer.write_all(data).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            self.connected.store(false, Ordering::Release);
            return Err(Error::connection(format!("write failed: {e}")));
        }
        Ok(())
    }

    fn receive(&self) -> Result<FrameStream> {
        let reader = self
            .reader
            .lock()
            .take()
            .ok_or_else(|| Error::connection("no connection to receive from"))?;
        let closed = self.close_token.lock().clone();
        let connected = Arc::clone(&self.connected);
        let frames = FrameReader::new(reader, self.max_message_size);

        let stream = futures::stream::unfold(Some(frames), move |state| {
            let closed = closed.clone();
            let connected = Arc::clone(&connected);
            async move {
                let mut frames = state?;
                let next = tokio::select! {
                    () = closed.cancelled() => return None,
                    next = frames.next_frame() => next,
                };
                match next {
                    Ok(Some(frame)) => Some((Ok(frame), Some(frames))),
                    Ok(None) => {
                        connected.store(false, Ordering::Release);
                        tracing::info!("Connection closed by peer");
                        None
                    }
                    Err(e) => {
                        connected.store(false, Ordering::Release);
                        Some((Err(e), None))
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        self.close_token.lock().cancel();
        self.reader.lock().take();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer
            && let Err(e) = writer.shutdown().await
        {
            tracing::debug!(error = %e, "Socket shutdown failed");
        }

        if was_connected {
            tracing::info!("Socket closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn kind(&self) -> &'static str {
        "tcp"
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("connected", &self.is_connected())
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}
