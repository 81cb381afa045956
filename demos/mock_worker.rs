//! A stand-in compute worker. Echoes each EXECUTE_CODE request back as
//! two OUTPUT fragments, the second one final.
//!
//! cargo run --example mock_worker -- 127.0.0.1:9100

use std::net::SocketAddr;
use std::sync::Arc;

use exec_relay::net::{FrameOptions, FramedConnection, MessageHandler};
use exec_relay::protocol::{Message, MessageType};

struct Echo;

impl MessageHandler for Echo {
    fn on_message(&self, conn: &FramedConnection, message: Message) {
        if message.message_type() != Some(MessageType::ExecuteCode) {
            return;
        }
        let code = message.code().unwrap_or_default();
        println!("executing #{}: {}", message.id, code);
        let _ = conn.send(&Message::output(message.id, format!("ran: {code}\n"), "", false));
        let _ = conn.send(&Message::output(message.id, "", "", true));
    }
}

#[tokio::main]
async fn main() {
    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9100".to_string())
        .parse()
        .unwrap();

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    println!("Mock worker listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await.unwrap();
        println!("Relay connected from {}", peer);
        FramedConnection::spawn(stream, Some(peer), Arc::new(Echo), FrameOptions::default());
    }
}
