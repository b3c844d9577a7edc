
use std::time::Duration;

use authgate::proxy::{AUTH_FAILED_MESSAGE, BACKEND_UNREACHABLE_MESSAGE, STORE_UNAVAILABLE_MESSAGE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use harness::{
    preamble, read_exact_len, read_to_eof, EchoBackend, MemoryStore, ProxyHandle, StalledBackend,
};

async fn connect(proxy: &ProxyHandle) -> TcpStream {
    TcpStream::connect(proxy.listen_addr).await.unwrap()
}

#[tokio::test]
async fn relays_first_chunk_and_later_traffic() {
    let backend = EchoBackend::spawn().await.unwrap();
    let store = MemoryStore::new();
    store.insert("alice", "s3cret", backend.addr);
    let proxy = ProxyHandle::spawn(store.clone(), 1).unwrap();

    let mut client = connect(&proxy).await;
    let hello = preamble("alice", "s3cret");
    client.write_all(&hello).await.unwrap();

    // The credential-bearing chunk reaches the backend verbatim.
    let echoed = read_exact_len(&mut client, hello.len()).await;
    assert_eq!(echoed, hello);

    client.write_all(b"ping").await.unwrap();
    assert_eq!(read_exact_len(&mut client, 4).await, b"ping");

    assert_eq!(store.lookup_count(), 1);
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn cached_credentials_skip_the_store() {
    let backend = EchoBackend::spawn().await.unwrap();
    let store = MemoryStore::new();
    store.insert("alice", "s3cret", backend.addr);
    let proxy = ProxyHandle::spawn(store.clone(), 1).unwrap();
    let hello = preamble("alice", "s3cret");

    for _ in 0..2 {
        let mut client = connect(&proxy).await;
        client.write_all(&hello).await.unwrap();
        assert_eq!(read_exact_len(&mut client, hello.len()).await, hello);
    }

    assert_eq!(store.lookup_count(), 1);
    assert_eq!(backend.connection_count(), 2);
}

#[tokio::test]
async fn missing_credentials_get_a_challenge() {
    let backend = EchoBackend::spawn().await.unwrap();
    let store = MemoryStore::new();
    store.insert("alice", "s3cret", backend.addr);
    let proxy = ProxyHandle::spawn(store.clone(), 1).unwrap();

    let mut client = connect(&proxy).await;
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: backend.test\r\n\r\n")
        .await
        .unwrap();

    let reply = String::from_utf8(read_to_eof(&mut client).await).unwrap();
    assert!(reply.starts_with("HTTP/1.1 407"));
    assert!(reply.contains("Proxy-Authenticate: Basic realm=\"Test Realm\""));
    assert!(reply.ends_with("\r\n\r\n"));

    assert_eq!(store.lookup_count(), 0);
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn unknown_account_is_refused() {
    let store = MemoryStore::new();
    let proxy = ProxyHandle::spawn(store.clone(), 1).unwrap();

    let mut client = connect(&proxy).await;
    client.write_all(&preamble("mallory", "guess")).await.unwrap();

    assert_eq!(read_to_eof(&mut client).await, AUTH_FAILED_MESSAGE);
    assert_eq!(store.lookup_count(), 1);
}

#[tokio::test]
async fn wrong_password_is_refused() {
    let backend = EchoBackend::spawn().await.unwrap();
    let store = MemoryStore::new();
    store.insert("alice", "s3cret", backend.addr);
    let proxy = ProxyHandle::spawn(store.clone(), 1).unwrap();

    let mut client = connect(&proxy).await;
    client.write_all(&preamble("alice", "S3cret")).await.unwrap();

    assert_eq!(read_to_eof(&mut client).await, AUTH_FAILED_MESSAGE);
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn unreachable_backend_is_reported() {
    let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let store = MemoryStore::new();
    store.insert("alice", "s3cret", dead_addr);
    let proxy = ProxyHandle::spawn(store.clone(), 1).unwrap();

    let mut client = connect(&proxy).await;
    client.write_all(&preamble("alice", "s3cret")).await.unwrap();

    assert_eq!(read_to_eof(&mut client).await, BACKEND_UNREACHABLE_MESSAGE);
}

#[tokio::test]
async fn slow_backend_dial_times_out_without_retry() {
    let backend = StalledBackend::spawn().await.unwrap();
    let store = MemoryStore::new();
    store.insert("alice", "s3cret", backend.addr);
    let dial_timeout = Duration::from_millis(150);
    let proxy = ProxyHandle::spawn_with_dial_timeout(store.clone(), 1, dial_timeout).unwrap();

    let mut client = connect(&proxy).await;
    let started = Instant::now();
    client.write_all(&preamble("alice", "s3cret")).await.unwrap();

    assert_eq!(read_to_eof(&mut client).await, BACKEND_UNREACHABLE_MESSAGE);
    assert!(started.elapsed() >= dial_timeout);

    let snapshot = proxy.stats.snapshot();
    assert_eq!(snapshot.backend_failed, 1);
    assert_eq!(snapshot.backend_connected, 0);
    assert_eq!(store.lookup_count(), 1);
}

#[tokio::test]
async fn store_outage_is_retried_once_then_reported() {
    let store = MemoryStore::new();
    store.set_unavailable(true);
    let proxy = ProxyHandle::spawn(store.clone(), 1).unwrap();

    let mut client = connect(&proxy).await;
    client.write_all(&preamble("alice", "s3cret")).await.unwrap();

    assert_eq!(read_to_eof(&mut client).await, STORE_UNAVAILABLE_MESSAGE);
    assert_eq!(store.lookup_count(), 2);
}

#[tokio::test]
async fn backend_close_reaches_the_client() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = listener.local_addr().unwrap();
    let hello = preamble("alice", "s3cret");
    let expected = hello.len();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut first = vec![0u8; expected];
        stream.read_exact(&mut first).await.unwrap();
        stream.write_all(b"bye").await.unwrap();
        stream.shutdown().await.unwrap();
    });

    let store = MemoryStore::new();
    store.insert("alice", "s3cret", backend_addr);
    let proxy = ProxyHandle::spawn(store.clone(), 1).unwrap();

    let mut client = connect(&proxy).await;
    client.write_all(&hello).await.unwrap();

    assert_eq!(read_to_eof(&mut client).await, b"bye");
}

#[tokio::test]
async fn client_close_releases_the_connection() {
    let backend = EchoBackend::spawn().await.unwrap();
    let store = MemoryStore::new();
    store.insert("alice", "s3cret", backend.addr);
    let proxy = ProxyHandle::spawn(store.clone(), 2).unwrap();

    let mut client = connect(&proxy).await;
    let hello = preamble("alice", "s3cret");
    client.write_all(&hello).await.unwrap();
    read_exact_len(&mut client, hello.len()).await;
    drop(client);

    let deadline = Instant::now() + harness::TEST_TIMEOUT;
    while proxy.stats.snapshot().connections_active != 0 {
        assert!(Instant::now() < deadline, "connection never released");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let snapshot = proxy.stats.snapshot();
    assert_eq!(snapshot.connections_accepted, 1);
    assert_eq!(snapshot.backend_connected, 1);
}
