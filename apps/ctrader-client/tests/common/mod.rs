//! Loopback broker used by the integration tests.
//!
//! Speaks the same length-prefixed envelope framing as the real server over
//! a plaintext local socket and lets each test script the conversation.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ctrader_client::infrastructure::schema::messages::{
    AccountAuthReq, AccountAuthRes, ApplicationAuthReq, ApplicationAuthRes, HEARTBEAT_EVENT,
};
use ctrader_client::infrastructure::schema::{Envelope, MessageRegistry, WireMessage};
use ctrader_client::infrastructure::transport::FrameReader;
use ctrader_client::protocol::Framing;
use ctrader_client::{ClientConfig, Credentials, TransportKind};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

/// Account id used by every scripted session.
pub const ACCOUNT_ID: i64 = 42;

/// Listening side of the loopback broker.
pub struct MockBroker {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockBroker {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Client configuration pointing at this broker.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig {
            credentials: Credentials::new(
                "app-id".to_string(),
                "app-secret".to_string(),
                "access-token".to_string(),
                ACCOUNT_ID,
            ),
            host: Some(self.addr.ip().to_string()),
            port: self.addr.port(),
            use_tls: false,
            transport: TransportKind::Tcp,
            connection_timeout: Duration::from_secs(2),
            auth_timeout: Duration::from_secs(2),
            auth_max_attempts: 1,
            ..ClientConfig::default()
        };
        config.reconnect.base_delay = Duration::from_millis(20);
        config.reconnect.max_delay = Duration::from_millis(100);
        config.reconnect.jitter_factor = 0.0;
        config.reconnect.max_attempts = 5;
        config
    }

    /// Accept the next client connection.
    pub async fn accept(&self) -> BrokerConn {
        let (socket, _) = tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .expect("no client connected")
            .unwrap();
        BrokerConn::new(socket)
    }
}

/// One accepted client connection.
pub struct BrokerConn {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    framing: Framing,
}

impl BrokerConn {
    fn new(socket: TcpStream) -> Self {
        let (read, write) = socket.into_split();
        Self {
            reader: FrameReader::new(read, 1024 * 1024),
            writer: write,
            framing: Framing::new(Arc::new(MessageRegistry::standard())),
        }
    }

    /// Next envelope from the client, heartbeats included. `None` on EOF.
    pub async fn next_envelope(&mut self) -> Option<Envelope> {
        let frame = tokio::time::timeout(WAIT, self.reader.next_frame())
            .await
            .expect("client sent nothing")
            .ok()??;
        Some(self.framing.decode(&frame).unwrap())
    }

    /// Next non-heartbeat request, decoded as `T`.
    pub async fn next_request<T: WireMessage>(&mut self) -> (Envelope, T) {
        loop {
            let envelope = self.next_envelope().await.expect("client hung up");
            if envelope.payload_type == HEARTBEAT_EVENT {
                continue;
            }
            assert_eq!(envelope.payload_type, T::PAYLOAD_TYPE, "unexpected request");
            let request = T::decode(envelope.payload_bytes()).unwrap();
            return (envelope, request);
        }
    }

    /// Answer `request` with `message`.
    pub async fn reply<M: WireMessage + Send + Sync>(&mut self, request: &Envelope, message: &M) {
        self.write(message, request.correlation_id()).await;
    }

    /// Send an unsolicited message.
    pub async fn push<M: WireMessage + Send + Sync>(&mut self, message: &M) {
        self.write(message, None).await;
    }

    async fn write<M: WireMessage + Send + Sync>(&mut self, message: &M, id: Option<&str>) {
        let frame = self.framing.encode(message, id).unwrap();
        self.writer.write_all(&frame).await.unwrap();
    }

    /// Accept both handshake phases.
    pub async fn authenticate(&mut self) {
        let (envelope, app) = self.next_request::<ApplicationAuthReq>().await;
        assert_eq!(app.client_id, "app-id");
        self.reply(&envelope, &ApplicationAuthRes::default()).await;

        let (envelope, account) = self.next_request::<AccountAuthReq>().await;
        assert_eq!(account.ctid_trader_account_id, ACCOUNT_ID);
        assert_eq!(account.access_token, "access-token");
        self.reply(
            &envelope,
            &AccountAuthRes {
                ctid_trader_account_id: ACCOUNT_ID,
            },
        )
        .await;
    }

    /// Close the socket from the broker side.
    pub async fn hang_up(mut self) {
        let _ = self.writer.shutdown().await;
    }
}
