//! Send one message to a relay's peer listener through a connection pool.
//!
//! cargo run --example peer_client -- 127.0.0.1 9000

use std::time::{Duration, Instant};

use exec_relay::net::{ConnectionPool, PeerConnector};
use exec_relay::protocol::Message;

#[tokio::main]
async fn main() {
    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args.next().map(|p| p.parse().unwrap()).unwrap_or(9000);

    let pool = ConnectionPool::new(PeerConnector::plain(Duration::from_secs(5)));

    let start = Instant::now();
    pool.send(&host, port, &Message::execute_code(1, "print('hello from a peer')"))
        .await
        .unwrap();
    println!("sent to {}:{} in {:.1} ms", host, port, start.elapsed().as_secs_f64() * 1000.0);

    // Reuses the pooled connection.
    let start = Instant::now();
    pool.send(&host, port, &Message::execute_code(2, "1 + 1")).await.unwrap();
    println!("sent again in {:.1} ms", start.elapsed().as_secs_f64() * 1000.0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.close_all().await;
}
