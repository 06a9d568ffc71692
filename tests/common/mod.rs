//! Shared helpers for integration tests: temp recordings on disk and an
//! in-process mock MongoDB target.

#![allow(dead_code)]

use bson::{Document, doc};
use bytes::Bytes;
use oxidereplay::protocol::{MessageHeader, OP_MSG, decode_op_msg_section0, encode_op_msg};
use oxidereplay::recording::{Packet, write_packet};
use rand::{Rng, distributions::Alphanumeric};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub fn rand_suffix(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

/// Temp directory for one test's recording files; removed on drop.
pub struct TempRecordingDir {
    pub path: PathBuf,
}

impl TempRecordingDir {
    pub fn new(label: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "oxidereplay_{}_{}",
            label,
            rand_suffix(8)
        ));
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn write_file(&self, name: &str, packets: &[Packet]) -> PathBuf {
        let mut buf = Vec::new();
        for p in packets {
            write_packet(&mut buf, p).unwrap();
        }
        self.write_raw(name, &buf)
    }

    pub fn write_raw(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.path.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }
}

impl Drop for TempRecordingDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

pub fn packet(session_id: u64, offset_us: u64, order: u64, message: Vec<u8>) -> Packet {
    Packet {
        session_id,
        session_metadata: Bytes::from_static(b"127.0.0.1:50000 -> 127.0.0.1:27017"),
        offset_us,
        order,
        message: Bytes::from(message),
    }
}

pub fn request(doc: Document) -> Vec<u8> {
    encode_op_msg(&doc, 0, 1).unwrap()
}

pub fn response(doc: Document, response_to: i32) -> Vec<u8> {
    encode_op_msg(&doc, response_to, 2).unwrap()
}

/// Minimal in-process stand-in for a MongoDB server: answers `hello` as a
/// writable primary, fails commands named `failme`, acknowledges everything
/// else with `ok: 1`.
pub struct MockTarget {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Document>>>,
    connections: Arc<AtomicUsize>,
}

impl MockTarget {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let received_accept = received.clone();
        let connections_accept = connections.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                connections_accept.fetch_add(1, Ordering::SeqCst);
                let received = received_accept.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, received).await;
                });
            }
        });

        Self {
            addr,
            received,
            connections,
        }
    }

    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Decoded request documents, excluding the handshake hellos.
    pub fn commands(&self) -> Vec<Document> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|doc| !matches!(doc.keys().next().map(String::as_str), Some("hello")))
            .cloned()
            .collect()
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    received: Arc<Mutex<Vec<Document>>>,
) -> std::io::Result<()> {
    loop {
        let mut header_buf = [0u8; 16];
        if stream.read_exact(&mut header_buf).await.is_err() {
            return Ok(());
        }
        let Some((header, _)) = MessageHeader::parse(&header_buf) else {
            return Ok(());
        };
        let body_len = (header.message_length as usize).saturating_sub(16);
        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body).await?;

        if header.op_code != OP_MSG {
            continue; // raw traffic we cannot decode; swallow without reply
        }
        let Some((_flags, doc)) = decode_op_msg_section0(&body) else {
            continue;
        };
        let first = doc.keys().next().cloned().unwrap_or_default();
        received.lock().unwrap().push(doc);

        let reply = match first.as_str() {
            "hello" | "isMaster" => doc! {
                "isWritablePrimary": true,
                "maxWireVersion": 21i32,
                "ok": 1.0,
            },
            "failme" => doc! {"ok": 0.0, "errmsg": "failing on request"},
            "slowpoke" => {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                doc! {"ok": 1.0}
            }
            _ => doc! {"ok": 1.0},
        };
        let out = encode_op_msg(&reply, header.request_id, 1).unwrap();
        stream.write_all(&out).await?;
        stream.flush().await?;
    }
}
