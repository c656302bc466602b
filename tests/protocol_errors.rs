//! Wire-level boundary behavior, driven over a raw duplex stream.

#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::{node_id, wait_until, TestNode};
use tokio::io::{split, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use chunknet::framing::{read_frame, write_frame};
use chunknet::protocol::{
    Message, Metadata, PeerAddr, RetrieveRequestData, StatusData, StoreRequestData, NETWORK_ID,
    PEERS_MSG, PROTOCOL_VERSION, STATUS_MSG, STORE_REQUEST_MSG,
};
use chunknet::{run_session, Address, Config, ProtocolError};

type Raw = (
    ReadHalf<DuplexStream>,
    WriteHalf<DuplexStream>,
    JoinHandle<Result<(), ProtocolError>>,
);

fn raw_status(seed: u64, version: u64, network_id: u64) -> StatusData {
    let id = node_id(seed);
    StatusData {
        version,
        id: "rawpeer/0".to_string(),
        node_id: id.clone(),
        addr: PeerAddr {
            ip: vec![127, 0, 0, 1],
            port: 41_000 + seed as u16,
            id,
        },
        network_id,
        caps: Vec::new(),
    }
}

/// Open a duplex pair, run the node's session on one side, hand back the
/// raw other side plus the session's join handle.
fn start_session(node: &TestNode) -> Raw {
    let (ours, theirs) = tokio::io::duplex(1 << 20);
    let (rt, wt) = split(theirs);
    let handle = tokio::spawn(run_session(node.ctx.clone(), rt, wt));
    let (r, w) = split(ours);
    (r, w, handle)
}

async fn send(w: &mut WriteHalf<DuplexStream>, msg: &Message) {
    let (code, payload) = msg.encode().expect("encode");
    write_frame(w, code, &payload).await.expect("write frame");
}

async fn recv(r: &mut ReadHalf<DuplexStream>) -> Option<(u8, Vec<u8>)> {
    tokio::time::timeout(Duration::from_secs(2), read_frame(r))
        .await
        .expect("frame within deadline")
        .expect("readable stream")
}

/// Complete the status exchange as a raw peer with the given seed.
async fn handshake(r: &mut ReadHalf<DuplexStream>, w: &mut WriteHalf<DuplexStream>, seed: u64) {
    let (code, _) = recv(r).await.expect("node status");
    assert_eq!(code, STATUS_MSG);
    send(
        w,
        &Message::Status(raw_status(seed, PROTOCOL_VERSION, NETWORK_ID)),
    )
    .await;
}

#[tokio::test]
async fn hash_mismatch_is_logged_not_fatal() {
    let node = TestNode::new(100, Config::default()).await;
    let good = vec![3u8; 128];
    let good_key = Address::hash(&good);
    node.netstore
        .local()
        .insert(good_key, good.clone())
        .await
        .expect("seed chunk");

    let (mut r, mut w, _handle) = start_session(&node);
    handshake(&mut r, &mut w, 1).await;

    // a chunk that does not hash to its key must be dropped silently
    let bogus_key = Address::hash(b"claimed key");
    send(
        &mut w,
        &Message::Store(StoreRequestData {
            key: bogus_key,
            data: vec![0xAA; 64],
            id: 7,
            metadata: Metadata::default(),
        }),
    )
    .await;

    // the session stays up: a retrieve for the seeded chunk is answered
    send(
        &mut w,
        &Message::Retrieve(RetrieveRequestData {
            key: good_key,
            id: 5,
            max_size: 0,
            max_peers: 4,
            timeout: 0,
        }),
    )
    .await;
    let (code, payload) = recv(&mut r).await.expect("store response");
    assert_eq!(code, STORE_REQUEST_MSG);
    match Message::decode(code, &payload).expect("decode") {
        Message::Store(res) => {
            assert_eq!(res.id, 5);
            assert_eq!(res.key, good_key);
            assert_eq!(res.data, good);
        }
        other => panic!("unexpected response {other:?}"),
    }

    assert!(!node
        .netstore
        .local()
        .contains(&bogus_key)
        .await
        .expect("check"));
}

#[tokio::test]
async fn network_id_mismatch_disconnects() {
    let node = TestNode::new(101, Config::default()).await;
    let (mut r, mut w, handle) = start_session(&node);
    let (code, _) = recv(&mut r).await.expect("node status");
    assert_eq!(code, STATUS_MSG);
    send(&mut w, &Message::Status(raw_status(2, PROTOCOL_VERSION, 99))).await;

    let result = handle.await.expect("session task");
    assert!(matches!(
        result,
        Err(ProtocolError::NetworkIdMismatch(99, NETWORK_ID))
    ));
    assert_eq!(node.hive.peer_count().await, 0);
}

#[tokio::test]
async fn version_mismatch_disconnects() {
    let node = TestNode::new(102, Config::default()).await;
    let (mut r, mut w, handle) = start_session(&node);
    let (code, _) = recv(&mut r).await.expect("node status");
    assert_eq!(code, STATUS_MSG);
    send(&mut w, &Message::Status(raw_status(3, 9, NETWORK_ID))).await;

    let result = handle.await.expect("session task");
    assert!(matches!(
        result,
        Err(ProtocolError::VersionMismatch(9, PROTOCOL_VERSION))
    ));
}

#[tokio::test]
async fn second_status_message_disconnects() {
    let node = TestNode::new(103, Config::default()).await;
    let (mut r, mut w, handle) = start_session(&node);
    handshake(&mut r, &mut w, 4).await;
    wait_until("peer registered", || async {
        node.hive.peer_count().await > 0
    })
    .await;

    send(
        &mut w,
        &Message::Status(raw_status(4, PROTOCOL_VERSION, NETWORK_ID)),
    )
    .await;
    let result = handle.await.expect("session task");
    assert!(matches!(result, Err(ProtocolError::ExtraStatusMsg)));
    wait_until("peer dropped", || async {
        node.hive.peer_count().await == 0
    })
    .await;
}

#[tokio::test]
async fn lookup_request_returns_peers_only() {
    let node = TestNode::new(104, Config::default()).await;
    let chunk = vec![6u8; 32];
    let key = Address::hash(&chunk);
    node.netstore
        .local()
        .insert(key, chunk)
        .await
        .expect("seed chunk");

    let (mut r, mut w, _handle) = start_session(&node);
    handshake(&mut r, &mut w, 5).await;

    // id zero prompts for peers even for a key the node holds
    send(
        &mut w,
        &Message::Retrieve(RetrieveRequestData {
            key,
            id: 0,
            max_size: 0,
            max_peers: 8,
            timeout: 0,
        }),
    )
    .await;
    let (code, payload) = recv(&mut r).await.expect("peers response");
    assert_eq!(code, PEERS_MSG);
    match Message::decode(code, &payload).expect("decode") {
        Message::Peers(peers) => {
            assert_eq!(peers.id, 0);
            assert_eq!(peers.key, key);
        }
        other => panic!("unexpected response {other:?}"),
    }
}

#[tokio::test]
async fn zero_key_retrieve_is_a_decode_error() {
    let node = TestNode::new(105, Config::default()).await;
    let (mut r, mut w, handle) = start_session(&node);
    handshake(&mut r, &mut w, 6).await;

    send(
        &mut w,
        &Message::Retrieve(RetrieveRequestData {
            key: Address::default(),
            id: 12,
            max_size: 0,
            max_peers: 4,
            timeout: 0,
        }),
    )
    .await;
    let result = handle.await.expect("session task");
    assert!(matches!(result, Err(ProtocolError::Decode(_))));
}
