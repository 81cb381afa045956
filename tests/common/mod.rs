//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use exec_relay::config::{RelayConfig, TlsConfig, WorkerConfig};
use exec_relay::net::{FrameOptions, FramedConnection, MessageHandler};
use exec_relay::protocol::{Message, MessageType};

/// A compute worker that answers every execute request with
/// `{code} => ok` and then a final empty fragment.
pub struct TestWorker {
    pub addr: SocketAddr,
    pub requests: Arc<AtomicUsize>,
}

impl TestWorker {
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

struct Echo {
    requests: Arc<AtomicUsize>,
}

impl MessageHandler for Echo {
    fn on_message(&self, conn: &FramedConnection, message: Message) {
        if message.message_type() != Some(MessageType::ExecuteCode) {
            return;
        }
        self.requests.fetch_add(1, Ordering::SeqCst);
        let code = message.code().unwrap_or_default().to_string();
        let _ = conn.send(&Message::output(message.id, format!("{code} => ok"), "", false));
        let _ = conn.send(&Message::output(message.id, "", "", true));
    }
}

pub async fn start_worker() -> TestWorker {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));
    let handler: Arc<dyn MessageHandler> = Arc::new(Echo {
        requests: requests.clone(),
    });

    tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            FramedConnection::spawn(stream, Some(peer), handler.clone(), FrameOptions::default());
        }
    });

    TestWorker { addr, requests }
}

/// A relay config bound to ephemeral loopback ports. Without a worker the
/// relay falls back to its default worker address.
pub fn test_config(worker: Option<SocketAddr>) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.http.bind_address = "127.0.0.1:0".to_string();
    config.http.debug_routes = true;
    config.workers = worker
        .map(|addr| vec![WorkerConfig { address: addr.to_string() }])
        .unwrap_or_default();
    config
}

/// CA plus one leaf certificate, written as PEM files.
pub struct TestPki {
    pub dir: tempfile::TempDir,
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TestPki {
    /// A CA and a leaf for `name`, all under a fresh temp directory.
    pub fn generate(name: &str) -> Self {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf = rcgen::CertificateParams::new(vec![name.to_string()])
            .unwrap()
            .signed_by(&leaf_key, &ca, &ca_key)
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let ca_path = dir.path().join("ca.pem");
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&ca_path, ca.pem()).unwrap();
        std::fs::write(&cert_path, leaf.pem()).unwrap();
        std::fs::write(&key_path, leaf_key.serialize_pem()).unwrap();

        Self {
            dir,
            ca_path,
            cert_path,
            key_path,
        }
    }

    pub fn listener_tls(&self) -> TlsConfig {
        TlsConfig {
            cert_path: self.cert_path.display().to_string(),
            key_path: self.key_path.display().to_string(),
        }
    }

    pub fn ca(&self) -> String {
        self.ca_path.display().to_string()
    }
}

/// Receive the next broadcast message or fail after two seconds.
pub async fn recv_within(rx: &mut broadcast::Receiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}
