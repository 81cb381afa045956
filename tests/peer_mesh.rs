//! Relays talking to each other over the peer listener and connection pool.

mod common;

use std::time::Duration;

use common::{recv_within, test_config, TestPki};
use exec_relay::net::{tls, PoolError};
use exec_relay::protocol::Message;
use exec_relay::{Relay, Shutdown};

async fn start_peer(pki: Option<&TestPki>) -> (Relay, Shutdown, exec_relay::relay::RelayHandle) {
    let mut config = test_config(None);
    config.http.enabled = false;
    config.listener.tls = pki.map(|p| p.listener_tls());

    let relay = Relay::new(config).unwrap();
    let shutdown = Shutdown::new();
    let handle = relay.start(&shutdown).await.unwrap();
    (relay, shutdown, handle)
}

fn dialer(ca: Option<String>) -> Relay {
    let mut config = test_config(None);
    config.http.enabled = false;
    config.peers.ca_path = ca;
    Relay::new(config).unwrap()
}

#[tokio::test]
async fn tls_peer_accepts_certificate_for_another_name() {
    tls::install_crypto_provider();
    let pki = TestPki::generate("relay-b.internal");
    let (b, shutdown, handle) = start_peer(Some(&pki)).await;
    let mut inbox = b.dispatcher().subscribe();

    let a = dialer(Some(pki.ca()));
    let port = handle.peer_addr.port();
    let message = Message::execute_code(11, "print('hi')");
    a.pool().send("127.0.0.1", port, &message).await.unwrap();

    assert_eq!(recv_within(&mut inbox).await, message);
    assert_eq!(b.dispatcher().received(), 1);

    // Second send reuses the pooled connection.
    a.pool().send("127.0.0.1", port, &Message::output(12, "x", "", true)).await.unwrap();
    assert_eq!(recv_within(&mut inbox).await.id, 12);
    assert_eq!(a.pool().len().await, 1);

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), handle.join()).await.unwrap();
}

#[tokio::test]
async fn tls_peer_signed_by_unknown_ca_is_rejected() {
    tls::install_crypto_provider();
    let pki = TestPki::generate("relay-b.internal");
    let stranger = TestPki::generate("relay-b.internal");
    let (_b, shutdown, handle) = start_peer(Some(&pki)).await;

    let a = dialer(Some(stranger.ca()));
    let result = a
        .pool()
        .send("127.0.0.1", handle.peer_addr.port(), &Message::execute_code(1, "x"))
        .await;

    assert!(matches!(result, Err(PoolError::Handshake { .. })));
    assert!(a.pool().is_empty().await);
    shutdown.trigger();
}

#[tokio::test]
async fn shutdown_closes_inbound_peer_connections() {
    let (b, shutdown, handle) = start_peer(None).await;
    let mut inbox = b.dispatcher().subscribe();

    let a = dialer(None);
    let port = handle.peer_addr.port();
    a.pool().send("127.0.0.1", port, &Message::execute_code(1, "x")).await.unwrap();
    recv_within(&mut inbox).await;
    assert_eq!(handle.peer_connections(), 1);

    shutdown.trigger();
    b.teardown().await;

    tokio::time::timeout(Duration::from_secs(2), async {
        while !a.pool().is_empty().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pooled connection was not closed by the peer");
    tokio::time::timeout(Duration::from_secs(5), handle.join()).await.unwrap();
}
