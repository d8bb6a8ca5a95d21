use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chat_relay::{RelayConfig, Registry, SERVER_FULL_NOTICE, Server, ShutdownSummary};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    addr: SocketAddr,
    registry: Arc<Registry<OwnedWriteHalf>>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<ShutdownSummary>,
}

async fn start(max_clients: usize) -> Harness {
    let config = RelayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        max_clients,
        ..Default::default()
    };
    let server = Server::bind(config).await.expect("bind");
    let addr = server.local_addr();
    let registry = server.registry();
    let (shutdown, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run(async move {
        let _ = rx.await;
    }));
    Harness {
        addr,
        registry,
        shutdown,
        task,
    }
}

/// Poll until the registry holds exactly `n` connections.
async fn wait_for_clients(registry: &Registry<OwnedWriteHalf>, n: usize) {
    timeout(WAIT, async {
        while registry.len().await != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("registry never reached {n} clients"));
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for data")
        .expect("read failed");
    buf
}

/// True if nothing arrives within a short window.
async fn stays_quiet(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    timeout(Duration::from_millis(200), stream.read(&mut buf))
        .await
        .is_err()
}

/// Read until EOF (or a reset, which also means the server closed us).
async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = timeout(WAIT, stream.read_to_end(&mut out))
        .await
        .expect("connection was never closed");
    out
}

#[tokio::test]
async fn capacity_scenario() {
    let relay = start(2).await;

    let mut c1 = TcpStream::connect(relay.addr).await.unwrap();
    let mut c2 = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 2).await;

    // third client is told off and closed, never registered
    let mut c3 = TcpStream::connect(relay.addr).await.unwrap();
    assert_eq!(read_until_closed(&mut c3).await, SERVER_FULL_NOTICE);
    assert_eq!(relay.registry.len().await, 2);

    // the first two are unaffected
    c1.write_all(b"hi").await.unwrap();
    assert_eq!(read_exactly(&mut c2, 3).await, b"hi\n");

    // c2 leaves, its slot frees up, c4 gets in
    drop(c2);
    wait_for_clients(&relay.registry, 1).await;
    let mut c4 = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 2).await;

    c4.write_all(b"welcome back\n").await.unwrap();
    assert_eq!(read_exactly(&mut c1, 13).await, b"welcome back\n");

    relay.shutdown.send(()).unwrap();
    let summary = relay.task.await.unwrap();
    assert_eq!(summary.stats.rejected, 1);
    assert_eq!(summary.stats.accepted, 3);
}

#[tokio::test]
async fn sender_never_gets_its_own_message() {
    let relay = start(3).await;

    let mut alice = TcpStream::connect(relay.addr).await.unwrap();
    let mut bob = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 2).await;

    alice.write_all(b"only for bob\n").await.unwrap();
    assert_eq!(read_exactly(&mut bob, 13).await, b"only for bob\n");
    assert!(stays_quiet(&mut alice).await);

    relay.shutdown.send(()).unwrap();
    relay.task.await.unwrap();
}

#[tokio::test]
async fn every_receiver_gets_one_copy_in_order() {
    let relay = start(4).await;

    let mut sender = TcpStream::connect(relay.addr).await.unwrap();
    let mut receivers = Vec::new();
    for _ in 0..3 {
        receivers.push(TcpStream::connect(relay.addr).await.unwrap());
    }
    wait_for_clients(&relay.registry, 4).await;

    // wait for each message to land before sending the next, so the server
    // reads them as separate chunks
    sender.write_all(b"first\n").await.unwrap();
    for r in &mut receivers {
        assert_eq!(read_exactly(r, 6).await, b"first\n");
    }
    sender.write_all(b"second").await.unwrap();
    for r in &mut receivers {
        assert_eq!(read_exactly(r, 7).await, b"second\n");
    }
    for r in &mut receivers {
        assert!(stays_quiet(r).await);
    }

    relay.shutdown.send(()).unwrap();
    let summary = relay.task.await.unwrap();
    assert_eq!(summary.stats.messages_received, 2);
    assert_eq!(summary.stats.messages_relayed, 6);
}

#[tokio::test]
async fn shutdown_closes_every_connection_and_the_listener() {
    let relay = start(5).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(relay.addr).await.unwrap());
    }
    wait_for_clients(&relay.registry, 3).await;

    relay.shutdown.send(()).unwrap();
    let summary = timeout(WAIT, relay.task).await.unwrap().unwrap();

    assert_eq!(summary.closed_connections, 3);
    assert!(relay.registry.is_empty().await);
    for client in &mut clients {
        assert!(read_until_closed(client).await.is_empty());
    }
    assert!(TcpStream::connect(relay.addr).await.is_err());
}

#[tokio::test]
async fn disconnect_of_one_client_does_not_disturb_others() {
    let relay = start(3).await;

    let mut a = TcpStream::connect(relay.addr).await.unwrap();
    let b = TcpStream::connect(relay.addr).await.unwrap();
    let mut c = TcpStream::connect(relay.addr).await.unwrap();
    wait_for_clients(&relay.registry, 3).await;

    drop(b);
    wait_for_clients(&relay.registry, 2).await;

    a.write_all(b"still here").await.unwrap();
    assert_eq!(read_exactly(&mut c, 11).await, b"still here\n");

    relay.shutdown.send(()).unwrap();
    let summary = relay.task.await.unwrap();
    assert_eq!(summary.closed_connections, 2);
}
