//! Plain HTTP routes of the browser-facing server.

mod common;

use common::{recv_within, test_config};
use exec_relay::protocol::Message;
use exec_relay::{Relay, Shutdown};

#[tokio::test]
async fn alive_and_message_types() {
    let relay = Relay::new(test_config(None)).unwrap();
    let shutdown = Shutdown::new();
    let handle = relay.start(&shutdown).await.unwrap();
    let base = format!("http://{}", handle.http_addr.unwrap());
    let client = reqwest::Client::new();

    let alive = client.get(format!("{base}/alive")).send().await.unwrap();
    assert_eq!(alive.status(), 200);
    assert_eq!(alive.text().await.unwrap(), "ok");

    let preflight = client
        .request(reqwest::Method::OPTIONS, format!("{base}/alive"))
        .send()
        .await
        .unwrap();
    assert_eq!(preflight.status(), 200);

    let types: serde_json::Value = client
        .get(format!("{base}/message/types"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(types, serde_json::json!({"EXECUTE_CODE": 1, "OUTPUT": 2}));

    shutdown.trigger();
}

#[tokio::test]
async fn debug_route_sends_through_the_pool() {
    let relay = Relay::new(test_config(None)).unwrap();
    let shutdown = Shutdown::new();
    let handle = relay.start(&shutdown).await.unwrap();
    let mut inbox = relay.dispatcher().subscribe();
    let base = format!("http://{}", handle.http_addr.unwrap());

    let response = reqwest::get(format!(
        "{base}/test/peer-message?hostname=127.0.0.1&port={}",
        handle.peer_addr.port()
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.text().await.unwrap().starts_with("sent message successfully in "));

    assert_eq!(recv_within(&mut inbox).await, Message::output(7, "some output", "", true));
    assert_eq!(relay.pool().len().await, 1);

    shutdown.trigger();
    relay.teardown().await;
}

#[tokio::test]
async fn debug_route_reports_unreachable_peer() {
    let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);

    let relay = Relay::new(test_config(None)).unwrap();
    let shutdown = Shutdown::new();
    let handle = relay.start(&shutdown).await.unwrap();

    let response = reqwest::get(format!(
        "http://{}/test/peer-message?hostname=127.0.0.1&port={port}",
        handle.http_addr.unwrap()
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 502);

    shutdown.trigger();
}

#[tokio::test]
async fn debug_route_hidden_unless_enabled() {
    let mut config = test_config(None);
    config.http.debug_routes = false;
    let relay = Relay::new(config).unwrap();
    let shutdown = Shutdown::new();
    let handle = relay.start(&shutdown).await.unwrap();

    let response = reqwest::get(format!("http://{}/test/peer-message?port=1", handle.http_addr.unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    shutdown.trigger();
}
