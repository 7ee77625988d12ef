//! WebSocket tunnel transport.
//!
//! Each outbound frame travels as one binary message. Inbound binary
//! messages feed the same frame buffer as the socket transport, so a frame
//! may span several messages and one message may carry several frames.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::frame::FrameBuffer;
use crate::application::ports::{FrameStream, Transport};
use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Build the tunnel URL for `host`, honoring an explicit scheme.
#[must_use]
pub fn tunnel_url(host: &str, port: u16, use_tls: bool) -> String {
    if host.starts_with("ws://") || host.starts_with("wss://") {
        return format!("{}:{port}", host.trim_end_matches('/'));
    }
    let scheme = if use_tls { "wss" } else { "ws" };
    format!("{scheme}://{host}:{port}")
}

/// Binary WebSocket transport.
pub struct WebSocketTransport {
    max_message_size: usize,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    source: Mutex<Option<WsSource>>,
    connected: Arc<AtomicBool>,
    close_token: Mutex<CancellationToken>,
}

impl WebSocketTransport {
    /// Create a disconnected transport.
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            sink: tokio::sync::Mutex::new(None),
            source: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            close_token: Mutex::new(CancellationToken::new()),
        }
    }
}

struct Inbound {
    source: WsSource,
    buffer: FrameBuffer,
}

#[async_trait]
impl Transport for WebSocketTransport {
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

        let url = tunnel_url(host, port, use_tls);
        tracing::debug!(url = %url, "Opening tunnel");

        let (ws_stream, _response) =
            tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| {
                    Error::connection(format!("connect to {url} timed out after {timeout:?}"))
                })?
                .map_err(|e| Error::connection(format!("connect to {url} failed: {e}")))?;

        let (sink, source) = ws_stream.split();
        *self.sink.lock().await = Some(sink);
        *self.source.lock() = Some(source);
        *self.close_token.lock() = CancellationToken::new();
        self.connected.store(true, Ordering::Release);

        tracing::info!(url = %url, "Tunnel connected");
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::connection("send on a closed transport"));
        }
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| Error::connection("send on a closed transport"))?;

        if let Err(e) = sink.send(Message::binary(data.to_vec())).await {
            self.connected.store(false, Ordering::Release);
            return Err(Error::connection(format!("tunnel write failed: {e}")));
        }
        Ok(())
    }

    fn receive(&self) -> Result<FrameStream> {
        let source = self
            .source
            .lock()
            .take()
            .ok_or_else(|| Error::connection("no connection to receive from"))?;
        let closed = self.close_token.lock().clone();
        let connected = Arc::clone(&self.connected);
        let inbound = Inbound {
            source,
            buffer: FrameBuffer::new(self.max_message_size),
        };

        let stream = futures::stream::unfold(Some(inbound), move |state| {
            let closed = closed.clone();
            let connected = Arc::clone(&connected);
            async move {
                let mut inbound = state?;
                loop {
                    match inbound.buffer.next_frame() {
                        Ok(Some(frame)) => return Some((Ok(frame), Some(inbound))),
                        Ok(None) => {}
                        Err(e) => {
                            connected.store(false, Ordering::Release);
                            return Some((Err(e), None));
                        }
                    }

                    let message = tokio::select! {
                        () = closed.cancelled() => return None,
                        message = inbound.source.next() => message,
                    };

                    match message {
                        Some(Ok(Message::Binary(data))) => inbound.buffer.extend(&data),
                        Some(Ok(Message::Text(text))) => {
                            tracing::warn!(len = text.len(), "Ignoring text message on tunnel");
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            connected.store(false, Ordering::Release);
                            if inbound.buffer.is_empty() {
                                tracing::info!("Tunnel closed by peer");
                                return None;
                            }
                            let err = Error::connection(format!(
                                "tunnel closed mid-frame with {} bytes buffered",
                                inbound.buffer.len()
                            ));
                            return Some((Err(err), None));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            connected.store(false, Ordering::Release);
                            let err = Error::connection(format!("tunnel read failed: {e}"));
                            return Some((Err(err), None));
                        }
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        self.close_token.lock().cancel();
        self.source.lock().take();

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink
            && let Err(e) = sink.close().await
        {
            tracing::debug!(error = %e, "Tunnel close handshake failed");
        }

        if was_connected {
            tracing::info!("Tunnel closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn kind(&self) -> &'static str {
        "websocket"
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("connected", &self.is_connected())
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}
