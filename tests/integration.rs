//! End-to-end store and retrieve scenarios over in-memory sessions.

#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::{connect, node_id_at_bin, wait_until, TestNode};

use chunknet::{Address, ChunkStore, Config, RetrieveError};

fn quick_cfg() -> Config {
    Config {
        retrieve_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

#[tokio::test]
async fn single_chunk_roundtrip() {
    let node = TestNode::new(1, quick_cfg()).await;
    let data = vec![0x42u8; 100];
    let key = Address::hash(&data);

    node.netstore.put(key, data.clone()).await.expect("store");
    let got = node.netstore.get(key).await.expect("retrieve");
    assert_eq!(got, data);

    let local = node.netstore.local().status().await;
    assert_eq!(local.mem_entries, 1);
    let status = node.netstore.status().await;
    assert_eq!(status.pending, 0, "no outstanding request may remain");
}

#[tokio::test]
async fn two_node_fetch() {
    let cfg = quick_cfg();
    let a = TestNode::new(10, cfg.clone()).await;
    // place b four bits deep into a's address space
    let b = TestNode::with_id(11, cfg, node_id_at_bin(&a.addr, 4)).await;

    let data = vec![7u8; 500];
    let key = Address::hash(&data);
    b.netstore
        .local()
        .insert(key, data.clone())
        .await
        .expect("seed chunk on b");

    connect(&a, &b).await;

    let got = a.netstore.get(key).await.expect("remote fetch");
    assert_eq!(got, data);
    assert!(a
        .netstore
        .local()
        .contains(&key)
        .await
        .expect("local check"));
    let status = a.netstore.status().await;
    assert_eq!(status.pending, 0, "pending entry must be removed");
    assert_eq!(status.forwarded_retrieves, 1);
}

#[tokio::test]
async fn concurrent_retrievals_share_one_request() {
    let cfg = quick_cfg();
    let a = TestNode::new(20, cfg.clone()).await;
    let b = TestNode::new(21, cfg).await;

    let data = vec![9u8; 2048];
    let key = Address::hash(&data);
    b.netstore
        .local()
        .insert(key, data.clone())
        .await
        .expect("seed chunk on b");

    connect(&a, &b).await;

    let (one, two) = tokio::join!(a.netstore.get(key), a.netstore.get(key));
    assert_eq!(one.expect("first caller"), data);
    assert_eq!(two.expect("second caller"), data);

    let status = a.netstore.status().await;
    assert_eq!(
        status.forwarded_retrieves, 1,
        "coalesced retrievals must produce a single outbound request"
    );
    assert_eq!(status.pending, 0);
}

#[tokio::test]
async fn missing_chunk_times_out_unavailable() {
    let cfg = Config {
        retrieve_timeout: Duration::from_millis(600),
        ..Config::default()
    };
    let node = TestNode::new(30, cfg).await;
    let key = Address::hash(b"nobody has this");
    let err = node.netstore.get(key).await.expect_err("must expire");
    assert!(matches!(err, RetrieveError::ChunkUnavailable(k) if k == key));
    assert_eq!(node.netstore.status().await.pending, 0);
}

#[tokio::test]
async fn stored_chunks_propagate_to_near_peers() {
    let cfg = quick_cfg();
    let a = TestNode::new(40, cfg.clone()).await;
    // keep b out of bin 0 so it stays within a's near zone
    let b = TestNode::with_id(41, cfg, node_id_at_bin(&a.addr, 3)).await;
    connect(&a, &b).await;

    let data = vec![5u8; 300];
    let key = Address::hash(&data);
    a.netstore.put(key, data.clone()).await.expect("store on a");

    wait_until("chunk push to b", || async {
        b.netstore.local().contains(&key).await.unwrap_or(false)
    })
    .await;
    assert_eq!(b.netstore.get(key).await.expect("b serves chunk"), data);
}

#[tokio::test]
async fn duplicate_stores_are_idempotent() {
    let node = TestNode::new(50, quick_cfg()).await;
    let data = vec![1u8; 64];
    let key = Address::hash(&data);
    for _ in 0..3 {
        node.netstore.put(key, data.clone()).await.expect("store");
    }
    assert_eq!(node.netstore.get(key).await.expect("get"), data);
    assert_eq!(node.netstore.local().status().await.mem_entries, 1);
}
