//! In-memory transport and scripted peer for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use prost::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{Frame, FrameStream, Transport};
use crate::error::{Error, Result};
use crate::infrastructure::schema::messages::HEARTBEAT_EVENT;
use crate::infrastructure::schema::{Envelope, MessageRegistry, WireMessage};
use crate::infrastructure::transport::frame::HEADER_LEN;
use crate::protocol::Framing;

/// Transport backed by unbounded channels; starts connected.
pub struct ChannelTransport {
    connected: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Result<Frame>>>>,
    closed: CancellationToken,
}

/// The server side of a [`ChannelTransport`].
pub struct Peer {
    sent: mpsc::UnboundedReceiver<Vec<u8>>,
    inbound: Option<mpsc::UnboundedSender<Result<Frame>>>,
    framing: Framing,
}

/// Connected in-memory transport and its peer.
pub fn channel_transport() -> (Arc<ChannelTransport>, Peer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(ChannelTransport {
        connected: Arc::new(AtomicBool::new(true)),
        outbound: out_tx,
        inbound: Mutex::new(Some(in_rx)),
        closed: CancellationToken::new(),
    });
    let peer = Peer {
        sent: out_rx,
        inbound: Some(in_tx),
        framing: Framing::new(Arc::new(MessageRegistry::standard())),
    };
    (transport, peer)
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self, _host: &str, _port: u16, _timeout: Duration, _tls: bool) -> Result<()> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::connection("send on a closed transport"));
        }
        self.outbound
            .send(data.to_vec())
            .map_err(|_| Error::connection("peer gone"))
    }

    fn receive(&self) -> Result<FrameStream> {
        let rx = self
            .inbound
            .lock()
            .take()
            .ok_or_else(|| Error::connection("no connection to receive from"))?;
        let closed = self.closed.clone();
        let connected = Arc::clone(&self.connected);
        let stream = futures::stream::unfold(rx, move |mut rx| {
            let closed = closed.clone();
            let connected = Arc::clone(&connected);
            async move {
                let next = tokio::select! {
                    () = closed.cancelled() => None,
                    next = rx.recv() => next,
                };
                if next.is_none() {
                    connected.store(false, Ordering::Release);
                }
                next.map(|item| (item, rx))
            }
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        self.closed.cancel();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn kind(&self) -> &'static str {
        "channel"
    }
}

impl Peer {
    /// Next envelope written by the client, heartbeats included.
    pub async fn next_envelope(&mut self) -> Option<Envelope> {
        let frame = self.sent.recv().await?;
        Some(self.framing.decode(&frame[HEADER_LEN..]).unwrap())
    }

    /// Next non-heartbeat envelope and its typed payload.
    pub async fn next_request<T: WireMessage>(&mut self) -> (Envelope, T) {
        loop {
            let envelope = self.next_envelope().await.expect("client went away");
            if envelope.payload_type == HEARTBEAT_EVENT {
                continue;
            }
            assert_eq!(envelope.payload_type, T::PAYLOAD_TYPE, "unexpected request");
            let request = T::decode(envelope.payload_bytes()).unwrap();
            return (envelope, request);
        }
    }

    fn frame<M: WireMessage + Send + Sync>(&self, message: &M, id: Option<&str>) -> Frame {
        Bytes::from(self.framing.envelope(message, id).unwrap().encode_to_vec())
    }

    /// Answer `request` with `message`.
    pub fn reply<M: WireMessage + Send + Sync>(&self, request: &Envelope, message: &M) {
        let frame = self.frame(message, request.correlation_id());
        self.push_raw(frame);
    }

    /// Send an unsolicited message.
    pub fn push<M: WireMessage + Send + Sync>(&self, message: &M) {
        let frame = self.frame(message, None);
        self.push_raw(frame);
    }

    /// Send a message carrying an arbitrary correlation id.
    pub fn push_correlated<M: WireMessage + Send + Sync>(&self, message: &M, id: &str) {
        let frame = self.frame(message, Some(id));
        self.push_raw(frame);
    }

    /// Send raw frame bytes.
    pub fn push_raw(&self, frame: Frame) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(Ok(frame));
        }
    }

    /// Fail the client's read side.
    pub fn fail(&self, error: Error) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(Err(error));
        }
    }

    /// End the client's read side cleanly.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }
}
