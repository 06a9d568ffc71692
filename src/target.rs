//! Connection to the replay target server.
//!
//! The replay engine writes pre-framed wire bytes, which is not a stable
//! public contract of driver crates, so the connection layer lives here:
//! plain TCP or rustls TLS, a `hello` handshake with a writable check, and
//! SCRAM-SHA-256 authentication driven over `run_command`.

use crate::config::TargetConfig;
use crate::protocol::{MessageHeader, OP_MSG, decode_op_msg_section0, encode_op_msg};
use crate::scram::{SCRAM_MECHANISM, ScramConversation};
use crate::tls;
use anyhow::{Context, Result, anyhow};
use bson::{Bson, Document, doc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};

/// Responses larger than this indicate a framing bug, not a real reply.
const MAX_RESPONSE_LEN: i32 = 48 * 1024 * 1024;

pub enum TargetStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl TargetStream {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(s) => s.write_all(buf).await,
            Self::Tls(s) => s.write_all(buf).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(s) => s.flush().await,
            Self::Tls(s) => s.flush().await,
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(s) => s.read_exact(buf).await.map(|_| ()),
            Self::Tls(s) => s.read_exact(buf).await.map(|_| ()),
        }
    }
}

/// One authenticated connection to the target. The replay engine opens one
/// per recorded session.
pub struct TargetConnection {
    stream: TargetStream,
    timeout: Duration,
    next_request_id: i32,
}

impl TargetConnection {
    /// Connect, exchange `hello`, verify the target accepts writes
    /// (standalone, primary, or mongos), and authenticate when credentials
    /// are configured.
    pub async fn connect(cfg: &TargetConfig) -> Result<Self> {
        let (host, port) = split_addr(&cfg.addr)?;
        let dur = Duration::from_millis(cfg.timeout_ms);

        let stream = if cfg.tls_enabled {
            let tls_stream = timeout(dur, tls::connect(cfg, host, port))
                .await
                .context("target connect timeout")??;
            TargetStream::Tls(Box::new(tls_stream))
        } else {
            let tcp = timeout(dur, TcpStream::connect((host, port)))
                .await
                .context("target connect timeout")??;
            TargetStream::Plain(tcp)
        };

        let mut conn = Self {
            stream,
            timeout: dur,
            next_request_id: 1,
        };

        let hello = conn.run_command("admin", doc! {"hello": 1i32}).await?;
        if !is_writable(&hello) {
            return Err(anyhow!(
                "target {} is not writable (not a standalone, primary, or mongos)",
                cfg.addr
            ));
        }
        tracing::debug!(
            addr = %cfg.addr,
            max_wire_version = hello.get_i32("maxWireVersion").unwrap_or(0),
            "target handshake complete"
        );

        if let (Some(username), Some(password)) = (&cfg.username, &cfg.password) {
            conn.authenticate(username, password, &cfg.auth_db).await?;
        }
        Ok(conn)
    }

    fn request_id(&mut self) -> i32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    /// Write pre-framed wire bytes exactly as given.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        timeout(self.timeout, self.stream.write_all(bytes))
            .await
            .context("target send timeout")??;
        timeout(self.timeout, self.stream.flush())
            .await
            .context("target flush timeout")??;
        Ok(())
    }

    /// Read one complete wire message (header + body).
    pub async fn read_message(&mut self) -> Result<Vec<u8>> {
        let mut header_buf = [0u8; 16];
        timeout(self.timeout, self.stream.read_exact(&mut header_buf))
            .await
            .context("target recv header timeout")??;
        let (header, _) =
            MessageHeader::parse(&header_buf).ok_or_else(|| anyhow!("invalid reply header"))?;
        if header.message_length < 16 || header.message_length > MAX_RESPONSE_LEN {
            return Err(anyhow!("invalid reply length {}", header.message_length));
        }
        let mut msg = header_buf.to_vec();
        msg.resize(header.message_length as usize, 0);
        if header.message_length > 16 {
            timeout(self.timeout, self.stream.read_exact(&mut msg[16..]))
                .await
                .context("target recv body timeout")??;
        }
        Ok(msg)
    }

    /// Issue one command against `db` and decode the reply document.
    pub async fn run_command(&mut self, db: &str, mut command: Document) -> Result<Document> {
        command.insert("$db", db);
        let request_id = self.request_id();
        let msg = encode_op_msg(&command, 0, request_id)
            .map_err(|e| anyhow!("encode command: {e}"))?;
        self.send_raw(&msg).await?;

        let reply = self.read_message().await?;
        let (header, _) =
            MessageHeader::parse(&reply).ok_or_else(|| anyhow!("invalid reply header"))?;
        if header.op_code != OP_MSG {
            return Err(anyhow!("expected OP_MSG reply, got {}", header.op_code));
        }
        let (_flags, document) =
            decode_op_msg_section0(&reply[16..]).ok_or_else(|| anyhow!("malformed OP_MSG reply"))?;
        Ok(document)
    }

    /// SCRAM-SHA-256 over saslStart/saslContinue.
    async fn authenticate(&mut self, username: &str, password: &str, auth_db: &str) -> Result<()> {
        let mut conversation =
            ScramConversation::new(username.to_string(), password.to_string());

        let start = self
            .run_command(
                auth_db,
                doc! {
                    "saslStart": 1i32,
                    "mechanism": SCRAM_MECHANISM,
                    "payload": binary(conversation.client_first().into_bytes()),
                    "options": {"skipEmptyExchange": true},
                },
            )
            .await?;
        let start = check_ok(start, "saslStart")?;
        let conversation_id = start.get_i32("conversationId").unwrap_or(1);
        let server_first = payload_str(&start)?;

        let client_final = conversation.handle_server_first(&server_first)?;
        let cont = self
            .run_command(
                auth_db,
                doc! {
                    "saslContinue": 1i32,
                    "conversationId": conversation_id,
                    "payload": binary(client_final.into_bytes()),
                },
            )
            .await?;
        let cont = check_ok(cont, "saslContinue")?;
        conversation.handle_server_final(&payload_str(&cont)?)?;

        if !cont.get_bool("done").unwrap_or(false) {
            // final empty exchange for servers that do not skip it
            let finish = self
                .run_command(
                    auth_db,
                    doc! {
                        "saslContinue": 1i32,
                        "conversationId": conversation_id,
                        "payload": binary(Vec::new()),
                    },
                )
                .await?;
            check_ok(finish, "saslContinue")?;
        }

        tracing::info!("SCRAM-SHA-256 authentication successful");
        Ok(())
    }
}

fn binary(bytes: Vec<u8>) -> Bson {
    Bson::Binary(bson::Binary {
        subtype: bson::spec::BinarySubtype::Generic,
        bytes,
    })
}

fn payload_str(doc: &Document) -> Result<String> {
    let payload = doc
        .get_binary_generic("payload")
        .context("missing payload in sasl response")?;
    Ok(String::from_utf8_lossy(payload).into_owned())
}

fn check_ok(doc: Document, what: &str) -> Result<Document> {
    if document_ok(&doc) {
        Ok(doc)
    } else {
        let errmsg = doc.get_str("errmsg").unwrap_or("no errmsg").to_string();
        Err(anyhow!("{what} failed: {errmsg}"))
    }
}

/// MongoDB encodes `ok` as a double, an int32 or an int64 depending on path.
pub fn document_ok(doc: &Document) -> bool {
    match doc.get("ok") {
        Some(Bson::Double(v)) => *v == 1.0,
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        _ => false,
    }
}

fn is_writable(hello: &Document) -> bool {
    hello.get_bool("isWritablePrimary").unwrap_or(false)
        || hello.get_bool("ismaster").unwrap_or(false)
        || hello.get_str("msg").map(|m| m == "isdbgrid").unwrap_or(false)
}

fn split_addr(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("target addr '{addr}' must be host:port"))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| anyhow!("invalid port in target addr '{addr}'"))?;
    Ok((host, port))
}
