//! Integration tests for connection teardown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use rudp::{
    socket::DatagramSink, ConnError, Connection, ConnectionState, Listener, TimerConfig,
};

fn any_local() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn connected_pair(config: TimerConfig) -> (Listener, Connection, Connection) {
    let listener = Listener::bind(any_local(), config.clone()).await.unwrap();
    let client = Connection::dial(any_local(), listener.local_addr(), config)
        .await
        .unwrap();
    let server = listener.accept().await.unwrap();
    (listener, client, server)
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn client_close_tears_down_both_sides() {
    let (listener, client, server) = connected_pair(TimerConfig::fast()).await;

    let server_closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&server_closed);
    server.on_closed(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    client.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);

    assert!(matches!(server.recv().await, Err(ConnError::Closed)));
    assert_eq!(server.state(), ConnectionState::Closed);
    assert_eq!(server_closed.load(Ordering::SeqCst), 1);

    // The listener's own close hook still ran.
    wait_for(|| listener.peer_count() == 0).await;
}

#[tokio::test]
async fn close_delivers_outstanding_data_first() {
    let (_listener, client, server) = connected_pair(TimerConfig::fast()).await;

    let message = vec![0x5a; 2_000];
    client.write(&message).unwrap();
    client.close().await.unwrap();

    let mut received = Vec::new();
    loop {
        match server.recv().await {
            Ok(chunk) => received.extend(chunk),
            Err(ConnError::Closed) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(received, message);
}

#[tokio::test]
async fn operations_after_close_are_rejected() {
    let (_listener, client, _server) = connected_pair(TimerConfig::fast()).await;
    client.close().await.unwrap();

    assert!(matches!(client.write(b"late"), Err(ConnError::Closed)));
    assert!(matches!(
        client.close().await,
        Err(ConnError::NotOpen(ConnectionState::Closed))
    ));
    let mut buf = [0u8; 4];
    assert!(matches!(client.read(&mut buf).await, Err(ConnError::Closed)));
}

#[tokio::test]
async fn server_close_reaches_client() {
    let (_listener, client, server) = connected_pair(TimerConfig::fast()).await;
    server.write(b"bye").unwrap();
    server.close().await.unwrap();

    assert_eq!(client.recv().await.unwrap(), b"bye");
    assert!(matches!(client.recv().await, Err(ConnError::Closed)));
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[derive(Debug)]
struct NullSink;

#[async_trait]
impl DatagramSink for NullSink {
    async fn send_datagram(&self, datagram: &[u8]) -> std::io::Result<usize> {
        Ok(datagram.len())
    }
}

#[tokio::test]
async fn close_before_handshake_is_not_open() {
    let conn = Connection::passive(
        Arc::new(NullSink),
        any_local(),
        "127.0.0.1:9".parse().unwrap(),
        TimerConfig::fast(),
    );
    assert!(matches!(
        conn.close().await,
        Err(ConnError::NotOpen(ConnectionState::Connecting))
    ));
    assert!(matches!(
        conn.write(b"x"),
        Err(ConnError::NotOpen(ConnectionState::Connecting))
    ));
}

/// A peer that never answers the `Fin` still ends in `Closed`, after the
/// bounded wait.
#[tokio::test]
async fn close_without_peer_reply_times_out() {
    let config = TimerConfig::fast().with_fin_ack_timeout(Duration::from_millis(100));
    let conn = Connection::passive(
        Arc::new(NullSink),
        any_local(),
        "127.0.0.1:9".parse().unwrap(),
        config,
    );
    conn.accept_handshake(&rudp::packet::Segment::conn(1))
        .await
        .unwrap();

    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);
    conn.on_closed(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let started = tokio::time::Instant::now();
    conn.close().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

/// Closing the listener stops new connections but leaves accepted ones
/// working until their owners close them.
#[tokio::test]
async fn accepted_connection_outlives_listener_close() {
    let (listener, client, server) = connected_pair(TimerConfig::fast()).await;
    listener.close();
    assert!(matches!(listener.accept().await, Err(ConnError::ListenerClosed)));

    client.write(b"ping").unwrap();
    assert_eq!(server.recv().await.unwrap(), b"ping");
    server.write(b"pong").unwrap();
    assert_eq!(client.recv().await.unwrap(), b"pong");

    let late = Connection::dial(
        any_local(),
        listener.local_addr(),
        TimerConfig::fast().with_handshake(2, Duration::from_millis(100)),
    )
    .await;
    assert!(matches!(late, Err(ConnError::HandshakeTimeout(2))), "got {late:?}");

    client.close().await.unwrap();
    assert!(matches!(server.recv().await, Err(ConnError::Closed)));
    wait_for(|| listener.peer_count() == 0).await;
}

/// Dropping the listener behaves like closing it.
#[tokio::test]
async fn dropped_listener_keeps_routing_for_accepted_peer() {
    let (listener, client, server) = connected_pair(TimerConfig::fast()).await;
    drop(listener);

    client.write(b"still here").unwrap();
    assert_eq!(server.recv().await.unwrap(), b"still here");
    server.close().await.unwrap();
    assert!(matches!(client.recv().await, Err(ConnError::Closed)));
}
