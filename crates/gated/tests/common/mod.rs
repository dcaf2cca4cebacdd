//! Shared harness for the session integration tests.
//!
//! Drives a full in-process stack: the bus actor, the event sink, and one
//! `ClientSession` per connected test client, wired over duplex pipes so no
//! real sockets are involved.

// Not every test binary touches every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use gate_core::{
    AgentConfig, Channel, ChannelAllocator, ClassRegistry, UberdogRegistry,
};
use gate_wire::messages::internal;
use gate_wire::{Datagram, DatagramIter, FrameCodec};
use gated::bus::{spawn_bus, BusHandle, ParticipantId};
use gated::events::spawn_event_sink;
use gated::session::{ClientSession, SessionShared};

/// Time limit for any single expected frame or bus message.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Version string the test config expects in CLIENT_HELLO.
pub const TEST_VERSION: &str = "v1";

/// Message type used for sync markers pushed through SEND_DATAGRAM.
pub const MARKER_MSGTYPE: u16 = 0xbeef;

/// Test configuration: one anonymous uberdog (100), one non-anonymous
/// uberdog (101), and an Avatar class for owned-object scenarios.
///
/// LoginManager is padded so that field index 7 is the clsend "login"
/// field; its low fields carry no send keywords.
pub fn test_config(min_channel: Channel, max_channel: Channel) -> AgentConfig {
    serde_json::from_value(serde_json::json!({
        "bind": "127.0.0.1:0",
        "version": TEST_VERSION,
        "channels": {"min": min_channel, "max": max_channel},
        "classes": [
            {"name": "LoginManager", "fields": [
                {"name": "f0", "type": "uint8"},
                {"name": "f1", "type": "uint8"},
                {"name": "f2", "type": "uint8"},
                {"name": "f3", "type": "uint8"},
                {"name": "f4", "type": "uint8"},
                {"name": "f5", "type": "uint8"},
                {"name": "f6", "type": "uint8"},
                {"name": "login", "type": "string", "keywords": ["clsend"]}
            ]},
            {"name": "Avatar", "fields": [
                {"name": "setName", "type": "string", "keywords": ["ownsend"]},
                {"name": "setXYZ", "type": "uint32[3]", "keywords": ["clsend", "broadcast"]}
            ]},
            {"name": "Thing", "fields": []}
        ],
        "uberdogs": [
            {"id": 100, "class": "LoginManager", "anonymous": true},
            {"id": 101, "class": "LoginManager", "anonymous": false}
        ]
    }))
    .expect("test config parses")
}

/// Class id of Avatar in the test config.
pub const AVATAR_DC: u16 = 1;
/// Class id of Thing in the test config.
pub const THING_DC: u16 = 2;

pub struct Harness {
    pub bus: BusHandle,
    pub shared: Arc<SessionShared>,
    pub dc_hash: u32,
    pub cancel: CancellationToken,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_channels(1000, 1999).await
    }

    pub async fn with_channels(min: Channel, max: Channel) -> Self {
        let config = test_config(min, max);
        let cancel = CancellationToken::new();
        let bus = spawn_bus();
        let events = spawn_event_sink(None, cancel.clone());

        let classes = Arc::new(ClassRegistry::from_config(&config.classes).expect("classes"));
        let uberdogs =
            Arc::new(UberdogRegistry::from_config(&classes, &config.uberdogs).expect("uberdogs"));
        let dc_hash = classes.hash();

        let shared = Arc::new(SessionShared {
            version: config.version.clone(),
            dc_hash,
            classes,
            uberdogs,
            allocator: std::sync::Mutex::new(ChannelAllocator::new(
                config.channels.min,
                config.channels.max,
            )),
            bus: bus.clone(),
            events,
        });

        Self {
            bus,
            shared,
            dc_hash,
            cancel,
        }
    }

    /// Spawns a session over a duplex pipe. `channel` is the identity the
    /// allocator is expected to hand this connection.
    pub async fn connect(&self, channel: Channel) -> TestClient {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            ClientSession::run(
                server_end,
                shared,
                "127.0.0.1:40000".to_string(),
                "127.0.0.1:7198".to_string(),
                cancel,
            )
            .await;
        });

        TestClient {
            framed: Framed::new(client_end, FrameCodec),
            channel,
        }
    }

    /// Attaches a bus observer subscribed to the given channels, standing in
    /// for the state server or other internal roles.
    pub async fn observer(&self, channels: &[Channel]) -> Observer {
        let (id, inbox) = self.bus.attach().await.expect("bus attach");
        for ch in channels {
            self.bus.subscribe(id, *ch).await;
        }
        Observer {
            id,
            inbox,
            bus: self.bus.clone(),
        }
    }

    /// Publishes an internal message to a single recipient channel.
    pub async fn publish_to(
        &self,
        recipient: Channel,
        sender: Channel,
        msgtype: u16,
        body: impl FnOnce(&mut Datagram),
    ) {
        let mut dg = Datagram::with_server_header(recipient, sender, msgtype);
        body(&mut dg);
        self.bus.publish(dg.freeze()).await;
    }
}

pub struct TestClient {
    pub framed: Framed<DuplexStream, FrameCodec>,
    pub channel: Channel,
}

impl TestClient {
    pub async fn send(&mut self, dg: Datagram) {
        self.framed.send(dg).await.expect("client send");
    }

    /// Receives one frame, failing the test on timeout or close.
    pub async fn recv(&mut self) -> (u16, DatagramIter) {
        let frame = timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("frame decode");
        let mut iter = DatagramIter::new(frame);
        let msgtype = iter.read_u16().expect("frame msgtype");
        (msgtype, iter)
    }

    /// Expects a CLIENT_EJECT frame and returns its reason code.
    pub async fn expect_eject(&mut self) -> u16 {
        let (msgtype, mut iter) = self.recv().await;
        assert_eq!(msgtype, gate_wire::messages::client::EJECT, "expected eject");
        iter.read_u16().expect("eject code")
    }

    /// Asserts the connection closes without another frame.
    pub async fn expect_close(&mut self) {
        let next = timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for close");
        assert!(next.is_none(), "expected close, got {next:?}");
    }

    /// Performs a successful handshake.
    pub async fn hello(&mut self, harness: &Harness) {
        let mut dg = Datagram::with_msgtype(gate_wire::messages::client::HELLO);
        dg.add_u32(harness.dc_hash);
        dg.add_string(TEST_VERSION).unwrap();
        self.send(dg).await;

        let (msgtype, _) = self.recv().await;
        assert_eq!(msgtype, gate_wire::messages::client::HELLO_RESP);
    }

    /// Handshake plus server-side promotion to ESTABLISHED.
    pub async fn establish(&mut self, harness: &Harness) {
        self.hello(harness).await;
        harness
            .publish_to(self.channel, 0, internal::CLIENTAGENT_SET_STATE, |dg| {
                dg.add_u16(2);
            })
            .await;
        self.sync(harness).await;
    }

    /// Round-trips a marker datagram through the session's bus inbox,
    /// guaranteeing everything published before it has been processed.
    pub async fn sync(&mut self, harness: &Harness) {
        let marker = Datagram::with_msgtype(MARKER_MSGTYPE);
        let marker_bytes = marker.freeze();
        harness
            .publish_to(
                self.channel,
                0,
                internal::CLIENTAGENT_SEND_DATAGRAM,
                |dg| {
                    dg.add_blob(&marker_bytes).unwrap();
                },
            )
            .await;

        let (msgtype, _) = self.recv().await;
        assert_eq!(msgtype, MARKER_MSGTYPE, "expected sync marker");
    }
}

pub struct Observer {
    pub id: ParticipantId,
    pub inbox: mpsc::UnboundedReceiver<Bytes>,
    bus: BusHandle,
}

impl Observer {
    /// Receives one routed datagram: (sender, msgtype, body cursor).
    pub async fn recv(&mut self) -> (Channel, u16, DatagramIter) {
        let payload = timeout(RECV_TIMEOUT, self.inbox.recv())
            .await
            .expect("timed out waiting for bus datagram")
            .expect("bus closed");
        let mut iter = DatagramIter::new(payload);
        let sender = iter.read_u64().expect("sender");
        let msgtype = iter.read_u16().expect("msgtype");
        (sender, msgtype, iter)
    }

    pub async fn subscribe(&self, channel: Channel) {
        self.bus.subscribe(self.id, channel).await;
    }
}

/// Builds an enveloped datagram without publishing it (for post-removes).
pub fn enveloped(recipient: Channel, sender: Channel, msgtype: u16) -> Bytes {
    Datagram::with_server_header(recipient, sender, msgtype).freeze()
}
