//! Replay engine: drive recorded packets against a live target.
//!
//! One cooperative loop consumes the packet stream, sleeps until each
//! packet's scheduled send time, and dispatches it in raw or command mode.
//! Connections are keyed by the recorded `session_id` so packets of one
//! recorded connection land on one target connection, in order.

use crate::classify;
use crate::command::Command;
use crate::config::TargetConfig;
use crate::error::{Error, Result};
use crate::inspect;
use crate::protocol::{self, MessageHeader, OP_COMPRESSED, OP_MSG};
use crate::recording::Packet;
use crate::target::{self, TargetConnection};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Write the captured wire bytes verbatim.
    Raw,
    /// Re-parse the embedded command and issue it through the connection's
    /// command path.
    Command,
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub mode: ReplayMode,
    /// Divisor for inter-packet gaps; `0.0` replays as fast as possible.
    pub speed: f64,
    pub requests_only: bool,
    pub user_ops_only: bool,
    pub user_ops_smart: bool,
    pub dry_run: bool,
    pub limit: Option<u64>,
    /// Raw mode: read one response per request and judge it.
    pub validate_responses: bool,
    /// Command mode: per-operation deadline.
    pub op_timeout_ms: Option<u64>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            mode: ReplayMode::Raw,
            speed: 1.0,
            requests_only: true,
            user_ops_only: false,
            user_ops_smart: false,
            dry_run: false,
            limit: None,
            validate_responses: false,
            op_timeout_ms: None,
        }
    }
}

/// Result of one send attempt.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub order: u64,
    pub session_id: u64,
    pub success: bool,
    pub opcode: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub command: Option<String>,
    pub database: Option<String>,
    pub duration: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct ReplayReport {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cancelled: bool,
    pub elapsed: Duration,
    /// Failed outcomes, retained for the final report.
    pub failures: Vec<Outcome>,
}

impl ReplayReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

/// Target connections keyed by recorded session. A session's connection is
/// opened on its first sent packet and lives until the stream drains.
struct SessionPool {
    cfg: TargetConfig,
    conns: HashMap<u64, TargetConnection>,
}

impl SessionPool {
    fn new(cfg: TargetConfig) -> Self {
        Self {
            cfg,
            conns: HashMap::new(),
        }
    }

    async fn get(&mut self, session_id: u64) -> anyhow::Result<&mut TargetConnection> {
        match self.conns.entry(session_id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let conn = TargetConnection::connect(&self.cfg).await?;
                tracing::debug!(session_id, "opened target connection for session");
                Ok(entry.insert(conn))
            }
        }
    }

    /// Drop a session's connection after a transport fault; the next packet
    /// of that session reconnects.
    fn evict(&mut self, session_id: u64) {
        if self.conns.remove(&session_id).is_some() {
            tracing::debug!(session_id, "evicted target connection");
        }
    }

    fn drain(self) {
        let open = self.conns.len();
        drop(self.conns);
        tracing::debug!(open, "drained target connections");
    }
}

enum Dispatch {
    Sent(Outcome),
    Skipped(&'static str),
}

/// Replay `packets` against the configured target.
///
/// Decoder errors abort the run; per-packet send errors are recorded and the
/// loop continues. Flipping `shutdown` to `true` cancels: the current sleep
/// wakes, the in-flight send completes, and connections drain.
pub async fn run<I>(
    packets: I,
    opts: &ReplayOptions,
    target_cfg: &TargetConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ReplayReport>
where
    I: Iterator<Item = Result<Packet>>,
{
    let started = Instant::now();
    let mut report = ReplayReport::default();
    let mut pool = SessionPool::new(target_cfg.clone());
    let mut first_offset: Option<u64> = None;

    for item in packets {
        if *shutdown.borrow() {
            report.cancelled = true;
            break;
        }
        let packet = item?;

        if opts.limit.is_some_and(|limit| report.attempted >= limit) {
            tracing::info!(limit = opts.limit, "operation limit reached");
            break;
        }
        if !should_send(&packet, opts) {
            report.skipped += 1;
            continue;
        }

        // Absolute-baseline pacing: schedule against the first sent packet
        // so latency never accumulates as drift. A deadline already in the
        // past fires immediately; the schedule never rewinds.
        let base = *first_offset.get_or_insert(packet.offset_us);
        if opts.speed > 0.0 {
            let delta_us = packet.offset_us.saturating_sub(base) as f64 / opts.speed;
            let deadline = started + Duration::from_micros(delta_us as u64);
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        report.cancelled = true;
                        break;
                    }
                    tokio::time::sleep_until(deadline).await;
                }
            }
        }

        report.attempted += 1;
        let dispatch = if opts.dry_run {
            dry_run_packet(&packet, opts)
        } else {
            match opts.mode {
                ReplayMode::Raw => raw_send(&mut pool, &packet, opts).await,
                ReplayMode::Command => command_send(&mut pool, &packet, opts).await,
            }
        };
        match dispatch {
            Dispatch::Sent(outcome) => {
                tracing::debug!(
                    order = outcome.order,
                    session_id = outcome.session_id,
                    success = outcome.success,
                    command = outcome.command.as_deref().unwrap_or(""),
                    error = outcome.error.as_deref().unwrap_or(""),
                    "replayed packet"
                );
                if outcome.success {
                    report.succeeded += 1;
                } else {
                    report.failed += 1;
                    report.failures.push(outcome);
                }
            }
            Dispatch::Skipped(reason) => {
                report.attempted -= 1;
                report.skipped += 1;
                tracing::debug!(order = packet.order, reason, "skipped packet");
            }
        }
    }

    pool.drain();
    report.elapsed = started.elapsed();
    tracing::info!(
        attempted = report.attempted,
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        cancelled = report.cancelled,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "replay complete"
    );
    Ok(report)
}

fn should_send(packet: &Packet, opts: &ReplayOptions) -> bool {
    if packet.message.is_empty() {
        return false;
    }
    if opts.requests_only && !inspect::is_request(&packet.message) {
        return false;
    }
    if opts.user_ops_only {
        let name = inspect::command_name(&packet.message).unwrap_or_default();
        if !inspect::is_user_command(name) {
            return false;
        }
    }
    if opts.user_ops_smart && !classify::is_likely_user_operation(packet) {
        return false;
    }
    true
}

fn outcome_shell(packet: &Packet) -> Outcome {
    let header = MessageHeader::parse(&packet.message).map(|(h, _)| h);
    Outcome {
        order: packet.order,
        session_id: packet.session_id,
        success: false,
        opcode: header.map(|h| h.op_code).unwrap_or(0),
        request_id: header.map(|h| h.request_id).unwrap_or(0),
        response_to: header.map(|h| h.response_to).unwrap_or(0),
        command: inspect::command_name(&packet.message).map(str::to_string),
        database: inspect::database(&packet.message).map(str::to_string),
        duration: Duration::ZERO,
        error: None,
    }
}

/// Sanity checks shared by raw send and dry-run.
fn check_raw_packet(packet: &Packet) -> std::result::Result<MessageHeader, Error> {
    let Some((header, _)) = MessageHeader::parse(&packet.message) else {
        return Err(Error::MalformedWireMessage("short wire header".into()));
    };
    if protocol::is_legacy_opcode(header.op_code) {
        return Err(Error::UnsupportedOpcode(header.op_code));
    }
    if header.op_code != OP_MSG && header.op_code != OP_COMPRESSED {
        return Err(Error::UnsupportedOpcode(header.op_code));
    }
    if header.message_length as usize != packet.message.len() {
        return Err(Error::MalformedWireMessage(format!(
            "declared length {} but packet carries {} bytes",
            header.message_length,
            packet.message.len()
        )));
    }
    Ok(header)
}

fn dry_run_packet(packet: &Packet, opts: &ReplayOptions) -> Dispatch {
    let mut outcome = outcome_shell(packet);
    match opts.mode {
        ReplayMode::Raw => match check_raw_packet(packet) {
            Ok(_) => outcome.success = true,
            Err(e) => outcome.error = Some(e.to_string()),
        },
        ReplayMode::Command => match Command::parse(&packet.message) {
            Ok(cmd) => {
                outcome.command = Some(cmd.name);
                outcome.database = Some(cmd.database);
                outcome.success = true;
            }
            Err(e) => return Dispatch::Skipped(skip_reason(&e)),
        },
    }
    Dispatch::Sent(outcome)
}

fn skip_reason(e: &Error) -> &'static str {
    match e {
        Error::UnsupportedOpcode(_) => "unsupported-opcode",
        Error::MissingCommandName => "missing-command-name",
        Error::MissingDatabase => "missing-database",
        Error::MalformedBson(_) => "malformed-bson",
        _ => "unparseable",
    }
}

async fn raw_send(pool: &mut SessionPool, packet: &Packet, opts: &ReplayOptions) -> Dispatch {
    let mut outcome = outcome_shell(packet);
    if let Err(e) = check_raw_packet(packet) {
        outcome.error = Some(e.to_string());
        return Dispatch::Sent(outcome);
    }

    let start = Instant::now();
    let result: anyhow::Result<bool> = async {
        let conn = pool.get(packet.session_id).await?;
        conn.send_raw(&packet.message).await?;
        if opts.validate_responses {
            let reply = conn.read_message().await?;
            return Ok(judge_raw_response(&reply));
        }
        Ok(true)
    }
    .await;
    outcome.duration = start.elapsed();

    match result {
        Ok(success) => {
            outcome.success = success;
            if !success {
                outcome.error = Some("server response not ok".into());
            }
        }
        Err(e) => {
            pool.evict(packet.session_id);
            outcome.error = Some(transport_error(e));
        }
    }
    Dispatch::Sent(outcome)
}

/// Keep taxonomy errors as-is; everything else from the connection layer is
/// a server error.
fn transport_error(e: anyhow::Error) -> String {
    match e.downcast::<Error>() {
        Ok(err) => err.to_string(),
        Err(other) => Error::ServerError(other.to_string()).to_string(),
    }
}

/// A raw-mode response counts as success when it frames correctly and, where
/// the body is inspectable, reports `ok`.
fn judge_raw_response(reply: &[u8]) -> bool {
    let Some((header, _)) = MessageHeader::parse(reply) else {
        return false;
    };
    let inspectable = if header.op_code == OP_COMPRESSED {
        protocol::decompress_message(reply).ok()
    } else {
        Some(reply.to_vec())
    };
    match inspectable {
        Some(msg) if inspect::opcode(&msg) == OP_MSG => {
            match protocol::decode_op_msg_section0(&msg[16..]) {
                Some((_flags, doc)) => target::document_ok(&doc),
                None => false,
            }
        }
        // A framed response we cannot open still proves the server answered.
        _ => true,
    }
}

async fn command_send(pool: &mut SessionPool, packet: &Packet, opts: &ReplayOptions) -> Dispatch {
    let cmd = match Command::parse(&packet.message) {
        Ok(cmd) => cmd,
        Err(e) => return Dispatch::Skipped(skip_reason(&e)),
    };

    let mut outcome = outcome_shell(packet);
    outcome.command = Some(cmd.name.clone());
    outcome.database = Some(cmd.database.clone());

    let start = Instant::now();
    let result = run_command_with_timeout(pool, packet.session_id, &cmd, opts.op_timeout_ms).await;
    outcome.duration = start.elapsed();

    match result {
        Ok(response) => {
            if target::document_ok(&response) {
                outcome.success = true;
            } else {
                let errmsg = response.get_str("errmsg").unwrap_or("ok != 1");
                outcome.error = Some(
                    Error::CommandFailed {
                        name: cmd.name,
                        detail: errmsg.to_string(),
                    }
                    .to_string(),
                );
            }
        }
        Err(e) => {
            pool.evict(packet.session_id);
            outcome.error = Some(transport_error(e));
        }
    }
    Dispatch::Sent(outcome)
}

async fn run_command_with_timeout(
    pool: &mut SessionPool,
    session_id: u64,
    cmd: &Command,
    op_timeout_ms: Option<u64>,
) -> anyhow::Result<bson::Document> {
    let conn = pool.get(session_id).await?;
    let fut = conn.run_command(&cmd.database, cmd.document.clone());
    match op_timeout_ms {
        Some(ms) => {
            let dur = Duration::from_millis(ms);
            tokio::time::timeout(dur, fut)
                .await
                .map_err(|_| anyhow::Error::from(Error::Timeout(dur)))?
        }
        None => fut.await,
    }
}
