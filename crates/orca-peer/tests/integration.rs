//! Integration tests for the Orca peer
//!
//! Each test starts a real transfer server on 127.0.0.1:0 and talks to it
//! with the transfer client or raw HTTP.

use orca_core::{sha256, ContentKey, Error, PeerAddress};
use orca_peer::{
    network, server, ConfirmationGate, ContentStore, Ledger, NameIndex, Outcome, ServerState,
    SignedSubmission, StoreLimits, TransferClient, Transaction, Wallet,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct TestPeer {
    _dir: TempDir,
    state: Arc<ServerState>,
    addr: String,
}

async fn start_peer(accept: bool, price_per_byte: f64) -> TestPeer {
    start_peer_with_limits(accept, price_per_byte, StoreLimits::default()).await
}

async fn start_peer_with_limits(accept: bool, price_per_byte: f64, limits: StoreLimits) -> TestPeer {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ContentStore::open(&dir.path().join("store"), limits).unwrap());
    let ledger = Arc::new(Ledger::open(&dir.path().join("transactions")).unwrap());

    let (gate, requests) = ConfirmationGate::new(Duration::from_secs(5));
    let gate = Arc::new(gate);
    gate.auto_answer(requests, accept);

    let mut state = ServerState::new(
        store,
        NameIndex::in_memory().unwrap(),
        gate,
        ledger,
        Wallet::generate().unwrap(),
    );
    state.price_per_byte = price_per_byte;
    let state = Arc::new(state);

    let (addr, _task) = server::spawn("127.0.0.1:0", state.clone()).await.unwrap();
    TestPeer {
        _dir: dir,
        state,
        addr: addr.to_string(),
    }
}

impl TestPeer {
    /// Put `content` in the store under `filename`
    fn share(&self, filename: &str, content: &[u8]) -> ContentKey {
        let key = self.state.store.put(content).unwrap();
        self.state
            .names()
            .put(filename, &key, content.len() as u64)
            .unwrap();
        key
    }
}

fn client(dir: &TempDir) -> TransferClient {
    TransferClient::new(
        &dir.path().join("requested"),
        NameIndex::in_memory().unwrap(),
        Duration::from_secs(10),
    )
    .unwrap()
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn test_declined_transfer_is_401_with_filename() {
    let peer = start_peer(false, 0.0).await;
    peer.share("secret.txt", b"not for you");
    let dir = TempDir::new().unwrap();

    let err = client(&dir)
        .request_file(&peer.addr, "secret.txt", None)
        .await
        .unwrap_err();
    match err {
        Error::Remote { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "Client declined to send file 'secret.txt'.");
        }
        other => panic!("Expected Remote error, got {:?}", other),
    }
    assert!(!dir.path().join("requested/secret.txt").exists());
}

#[tokio::test]
async fn test_accepted_transfer_hash_matches() {
    let peer = start_peer(true, 0.0).await;
    let content = b"Hello, Orca! Integration test content.";
    peer.share("hello.txt", content);
    let dir = TempDir::new().unwrap();

    let path = client(&dir)
        .request_file(&peer.addr, "hello.txt", None)
        .await
        .unwrap();

    assert_eq!(path, dir.path().join("requested/hello.txt"));
    let received = std::fs::read(&path).unwrap();
    assert_eq!(sha256(&received), sha256(content));
    assert!(!dir.path().join("requested/hello.txt.part").exists());
}

#[tokio::test]
async fn test_request_by_content_key() {
    let peer = start_peer(true, 0.0).await;
    let content = sample(200);
    let key = peer.share("by-key.bin", &content);
    let dir = TempDir::new().unwrap();

    let path = client(&dir)
        .request_file(&peer.addr, &key.to_hex(), None)
        .await
        .unwrap();
    assert_eq!(std::fs::read(path).unwrap(), content);
}

#[tokio::test]
async fn test_chunked_transfers_are_exact() {
    let peer = start_peer(true, 0.0).await;
    let content = sample(3000);
    peer.share("big.bin", &content);

    for chunk_size in [None, Some(1), Some(7), Some(1000), Some(3000), Some(5000)] {
        let dir = TempDir::new().unwrap();
        let path = client(&dir)
            .request_file(&peer.addr, "big.bin", chunk_size)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(path).unwrap(),
            content,
            "chunk size {:?}",
            chunk_size
        );
    }
}

#[tokio::test]
async fn test_missing_file_is_404() {
    let peer = start_peer(true, 0.0).await;
    let dir = TempDir::new().unwrap();

    let err = client(&dir)
        .request_file(&peer.addr, "nothing-here.txt", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote { status: 404, .. }), "{:?}", err);
}

#[tokio::test]
async fn test_vanished_blob_is_404() {
    let peer = start_peer(true, 0.0).await;
    // Drive only, so no cached copy survives the deletion
    let key = peer.state.store.drive_put(b"short lived").unwrap();
    peer.state.names().put("gone.txt", &key, 11).unwrap();
    std::fs::remove_file(peer._dir.path().join("store").join(key.to_hex())).unwrap();

    let dir = TempDir::new().unwrap();
    let err = client(&dir)
        .request_file(&peer.addr, &key.to_hex(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote { status: 404, .. }), "{:?}", err);
    assert!(!peer.state.store.contains(&key));
}

#[tokio::test]
async fn test_zero_chunksize_is_400() {
    let peer = start_peer(true, 0.0).await;
    peer.share("a.txt", b"abc");

    let url = format!("http://{}/requestFile/a.txt?chunksize=0", peer.addr);
    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}

#[tokio::test]
async fn test_signature_headers_present() {
    let peer = start_peer(true, 0.0).await;
    peer.share("signed.txt", b"signed content");

    let url = format!("http://{}/requestFile/signed.txt", peer.addr);
    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let headers = resp.headers();
    assert_eq!(
        headers["x-message"].to_str().unwrap(),
        hex::encode(sha256(b"signed content"))
    );
    assert_eq!(
        headers["x-publickey"].to_str().unwrap(),
        peer.state.wallet.keypair().public_key_hex()
    );
    assert!(headers.contains_key("x-signature"));
    assert_eq!(headers["content-type"].to_str().unwrap(), "text/plain");
    assert_eq!(
        headers["content-disposition"].to_str().unwrap(),
        "attachment; filename=\"signed.txt\""
    );
}

#[tokio::test]
async fn test_store_file_then_request_it() {
    let peer = start_peer(true, 0.0).await;
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("upload.txt");
    std::fs::write(&source, b"stored remotely").unwrap();

    let uploader = client(&dir);
    let key = uploader.store_file(&peer.addr, &source).await.unwrap();

    assert_eq!(key, ContentKey::of(b"stored remotely"));
    assert!(peer.state.store.contains(&key));
    assert_eq!(
        peer.state.names().get("upload.txt").unwrap().unwrap().content_key,
        key
    );
    // The uploader remembers the name too
    assert_eq!(
        uploader.names().get("upload.txt").unwrap().unwrap().content_key,
        key
    );

    // A fresh client gets it back by name
    let other = TempDir::new().unwrap();
    let path = client(&other)
        .request_file(&peer.addr, "upload.txt", None)
        .await
        .unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"stored remotely");
}

#[tokio::test]
async fn test_store_large_file_within_drive_cap() {
    let peer = start_peer_with_limits(
        true,
        0.0,
        StoreLimits {
            memory_cap: 4_000,
            drive_cap: 16_000_000,
        },
    )
    .await;
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("large.bin");
    let content = sample(3_000_000);
    std::fs::write(&source, &content).unwrap();

    let key = client(&dir).store_file(&peer.addr, &source).await.unwrap();
    assert_eq!(key, ContentKey::of(&content));
    assert_eq!(peer.state.store.size_of(&key), Some(3_000_000));
}

#[tokio::test]
async fn test_store_over_drive_cap_is_413() {
    let peer = start_peer_with_limits(
        true,
        0.0,
        StoreLimits {
            memory_cap: 100,
            drive_cap: 1_000,
        },
    )
    .await;
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("too-big.bin");
    std::fs::write(&source, sample(1_001)).unwrap();

    let err = client(&dir).store_file(&peer.addr, &source).await.unwrap_err();
    assert!(matches!(err, Error::Remote { status: 413, .. }), "{:?}", err);
    assert!(peer.state.store.list().is_empty());
}

#[tokio::test]
async fn test_declined_store_is_401() {
    let peer = start_peer(false, 0.0).await;
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("unwanted.txt");
    std::fs::write(&source, b"no thanks").unwrap();

    let err = client(&dir).store_file(&peer.addr, &source).await.unwrap_err();
    match err {
        Error::Remote { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "Client declined to store file 'unwanted.txt'.");
        }
        other => panic!("Expected Remote error, got {:?}", other),
    }
    assert!(!peer.state.store.contains(&ContentKey::of(b"no thanks")));
}

#[tokio::test]
async fn test_store_bad_json_is_400() {
    let peer = start_peer(true, 0.0).await;
    let resp = reqwest::Client::new()
        .post(format!("http://{}/storeFile/", peer.addr))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    assert_eq!(resp.text().await.unwrap(), "Failed to parse JSON data");
}

#[tokio::test]
async fn test_send_transaction_accepted() {
    let peer = start_peer(true, 0.0).await;
    let dir = TempDir::new().unwrap();
    let payer = Wallet::generate().unwrap();

    let status = client(&dir)
        .send_transaction(&peer.addr, &payer, 4.5, &peer.state.wallet.id())
        .await
        .unwrap();
    assert_eq!(status.status, "accepted");

    let records = peer.state.ledger.records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Outcome::Accepted);
    let transaction = records[0].transaction.as_ref().unwrap();
    assert_eq!(transaction.price, 4.5);
    assert_eq!(transaction.sender_id, payer.id());
}

#[tokio::test]
async fn test_send_transaction_invalid_signature() {
    let peer = start_peer(true, 0.0).await;
    let payer = Wallet::generate().unwrap();
    let (_, mut submission) = payer.pay(1.0, "receiver").unwrap();
    submission.transaction = Transaction::new(99.0, payer.id(), "receiver")
        .to_bytes()
        .unwrap();

    let resp = reqwest::Client::new()
        .post(format!("http://{}/sendTransaction", peer.addr))
        .json(&submission)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "invalid_signature");

    let records = peer.state.ledger.records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Outcome::InvalidSignature);
}

#[tokio::test]
async fn test_send_transaction_malformed() {
    let peer = start_peer(true, 0.0).await;
    let http = reqwest::Client::new();
    let url = format!("http://{}/sendTransaction", peer.addr);

    let resp = http.post(&url).body("garbage").send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "malformed");

    let bad_key = SignedSubmission {
        bytes: vec![1; 64],
        transaction: b"{}".to_vec(),
        public_key: "not a key".to_string(),
    };
    let resp = http.post(&url).json(&bad_key).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    // Both attempts are audited
    assert_eq!(peer.state.ledger.records().unwrap().len(), 2);
}

#[tokio::test]
async fn test_quote() {
    let peer = start_peer(true, 0.5).await;
    let key = peer.share("priced.bin", &sample(100));
    let dir = TempDir::new().unwrap();
    let client = client(&dir);

    let quote = client.fetch_quote(&peer.addr, &key).await.unwrap();
    assert_eq!(quote.address, peer.addr);
    assert_eq!(quote.size, 100);
    assert_eq!(quote.price, 50.0);
    assert!(!quote.is_last_candidate);

    let missing = client
        .fetch_quote(&peer.addr, &ContentKey::of(b"absent"))
        .await
        .unwrap_err();
    assert!(matches!(missing, Error::Remote { status: 404, .. }));
}

#[tokio::test]
async fn test_cheapest_quote_selected() {
    let content = sample(64);
    let expensive = start_peer(true, 2.0).await;
    let cheap = start_peer(true, 1.0).await;
    let key = expensive.share("x.bin", &content);
    cheap.share("x.bin", &content);

    let dir = TempDir::new().unwrap();
    let client = Arc::new(client(&dir));
    let holders: Vec<PeerAddress> = vec![
        expensive.addr.parse().unwrap(),
        // Nobody listens here; it is skipped
        "127.0.0.1:1".parse().unwrap(),
        cheap.addr.parse().unwrap(),
    ];

    let quotes = network::collect_quotes(client.clone(), key, holders);
    let best = network::select_quote(quotes).await.unwrap();
    assert_eq!(best.address, cheap.addr);
    assert_eq!(best.price, 64.0);

    let path = client
        .request_file(&best.address, &key.to_hex(), Some(16))
        .await
        .unwrap();
    assert_eq!(std::fs::read(path).unwrap(), content);
}

#[tokio::test]
async fn test_last_quote_is_flagged() {
    let first = start_peer(true, 1.0).await;
    let second = start_peer(true, 1.0).await;
    let key = first.share("y.bin", b"same bytes");
    second.share("y.bin", b"same bytes");

    let dir = TempDir::new().unwrap();
    let mut quotes = network::collect_quotes(
        Arc::new(client(&dir)),
        key,
        vec![first.addr.parse().unwrap(), second.addr.parse().unwrap()],
    );

    let mut received = Vec::new();
    while let Some(quote) = quotes.recv().await {
        received.push(quote);
    }
    assert_eq!(received.len(), 2);
    assert!(!received[0].is_last_candidate);
    assert!(received[1].is_last_candidate);
}
