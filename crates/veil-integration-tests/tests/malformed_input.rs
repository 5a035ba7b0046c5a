//! Integration test: hostile and malformed input at a relay.
//!
//! Exercises stream-level rejection:
//! 1. Garbage on a stream resets that stream and leaves the tables alone
//! 2. Cells a relay never accepts are rejected the same way, including an
//!    extend sent in the clear instead of inside a relay cell
//! 3. Relay cells for unknown circuits are dropped without an answer
//! 4. The same connection still carries a valid handshake afterwards

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use veil_circuit::handshake::{self, RelayIdentity};
use veil_circuit::OnionNode;
use veil_integration_tests::{fast_config, loopback};
use veil_transport::{cbor, quic};
use veil_transport::{ControlCell, DirectoryMessage, Packet, QuicNode, StopFlag};
use veil_types::{CircuitId, Direction};

const LIMIT: Duration = Duration::from_secs(2);

/// An extend cell in the clear, as a relay must never accept it.
#[derive(Serialize)]
struct CleartextExtend {
    #[serde(rename = "type")]
    kind: &'static str,
    command: &'static str,
    circuit_id: u64,
    address: String,
    port: u16,
}

async fn running_relay(stop: &StopFlag) -> Arc<OnionNode> {
    let node = Arc::new(
        OnionNode::bind(loopback(), RelayIdentity::generate(), fast_config()).expect("relay"),
    );
    let running = node.clone();
    let stop = stop.clone();
    tokio::spawn(async move { running.run(stop).await });
    node
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_requests_do_not_touch_state() {
    let stop = StopFlag::new();
    let relay = running_relay(&stop).await;
    let client = QuicNode::client(loopback()).expect("client endpoint");
    let conn = client.connect(relay.local_addr()).await.expect("connect");

    // =========================================================
    // Step 1: Undecodable envelope
    // =========================================================
    let (mut send, mut recv) = QuicNode::open_bi(&conn).await.expect("open stream");
    QuicNode::send_message(&mut send, b"\xff\x00 definitely not cbor")
        .await
        .expect("send garbage");
    send.finish().expect("finish");
    let read = tokio::time::timeout(LIMIT, recv.read_to_end(1024))
        .await
        .expect("relay answers promptly");
    assert!(read.is_err(), "stream should be reset");
    assert!(relay.tables().circuits.is_empty());
    assert!(relay.tables().keys.is_empty());

    // =========================================================
    // Step 2: Envelopes a relay never accepts
    // =========================================================
    let query = Packet::Directory(DirectoryMessage::Query {
        context: String::new(),
    });
    assert!(quic::request(&conn, &query, LIMIT).await.is_err());

    let unsolicited = Packet::Control(ControlCell::Created {
        circuit_id: CircuitId(5),
        public_value: [9u8; 32],
        confirmation: [9u8; 32],
    });
    assert!(quic::request(&conn, &unsolicited, LIMIT).await.is_err());

    let extend = CleartextExtend {
        kind: "control",
        command: "extend",
        circuit_id: 6,
        address: "127.0.0.1".into(),
        port: 9,
    };
    let (mut send, mut recv) = QuicNode::open_bi(&conn).await.expect("open stream");
    QuicNode::send_message(&mut send, &cbor::to_vec(&extend).expect("encode"))
        .await
        .expect("send extend");
    send.finish().expect("finish");
    let read = tokio::time::timeout(LIMIT, recv.read_to_end(1024))
        .await
        .expect("relay answers promptly");
    assert!(read.is_err(), "cleartext extend should reset the stream");
    assert!(relay.tables().circuits.is_empty());

    // =========================================================
    // Step 3: Relay cell for an unknown circuit
    // =========================================================
    let stray = Packet::Control(ControlCell::Relay {
        circuit_id: CircuitId(7),
        direction: Direction::Outbound,
        payload: vec![0u8; 64],
    });
    let answer = quic::exchange(&conn, &stray, LIMIT).await.expect("exchange");
    assert!(answer.is_none());
    assert!(relay.tables().circuits.is_empty());

    // =========================================================
    // Step 4: A valid handshake on the same connection
    // =========================================================
    let circuit_id = CircuitId(42);
    let (pending, public) = handshake::initiate(circuit_id, relay.identity().public_key());
    let create = Packet::Control(ControlCell::Create {
        circuit_id,
        public_value: public.to_bytes(),
        relayed: false,
    });
    let reply = quic::request(&conn, &create, LIMIT).await.expect("create");
    let Packet::Control(ControlCell::Created {
        circuit_id: id,
        public_value,
        confirmation,
    }) = reply
    else {
        unreachable!("expected created, got {reply:?}");
    };
    assert_eq!(id, circuit_id);
    let secret = pending
        .complete(
            &veil_crypto::x25519::X25519PublicKey::from_bytes(public_value),
            &confirmation,
        )
        .expect("handshake verifies");
    let relay_secret = relay.tables().keys.get(circuit_id).expect("relay secret");
    assert_eq!(secret.fingerprint(), relay_secret.fingerprint());
    assert_eq!(relay.tables().circuits.len(), 1);

    stop.stop();
}
