//! Recording statistics: one decoding pass, aggregate breakdowns.

use crate::classify;
use crate::error::{Error, Result};
use crate::inspect;
use crate::protocol::{self, OP_COMPRESSED};
use crate::recording::Packet;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;

#[derive(Debug, Default, Serialize)]
pub struct AnalyzeReport {
    pub packets: u64,
    pub requests: u64,
    pub responses: u64,
    pub session_markers: u64,
    /// Distinct session ids; start/end events are synthesized from
    /// per-session first/last order numbers since the frame format carries
    /// no event tag.
    pub sessions: u64,
    pub first_offset_us: u64,
    pub last_offset_us: u64,
    pub duration_us: u64,
    pub user_operations: u64,
    pub internal_operations: u64,
    /// OP_COMPRESSED envelopes opened for attribution.
    pub compressed: u64,
    /// Envelopes with an unknown compressor or broken payload.
    pub compressed_opaque: u64,
    /// Files whose tail frame was cut off.
    pub truncated_files: u64,
    pub by_opcode: BTreeMap<String, u64>,
    pub by_command: BTreeMap<String, u64>,
    pub by_category: BTreeMap<String, u64>,
}

/// Summarize a packet stream. Truncated-file errors are tallied and the
/// stream continues (the recording set advances to the next file); any other
/// decode error aborts.
pub fn analyze<I>(packets: I) -> Result<AnalyzeReport>
where
    I: Iterator<Item = Result<Packet>>,
{
    let mut report = AnalyzeReport::default();
    let mut sessions: HashMap<u64, (u64, u64)> = HashMap::new();
    let mut first_offset: Option<u64> = None;

    for item in packets {
        let packet = match item {
            Ok(packet) => packet,
            Err(Error::Truncated) => {
                report.truncated_files += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        report.packets += 1;

        if first_offset.is_none() {
            first_offset = Some(packet.offset_us);
            report.first_offset_us = packet.offset_us;
        }
        report.last_offset_us = report.last_offset_us.max(packet.offset_us);

        sessions
            .entry(packet.session_id)
            .and_modify(|(_, last)| *last = (*last).max(packet.order))
            .or_insert((packet.order, packet.order));

        if packet.message.is_empty() {
            report.session_markers += 1;
            continue;
        }

        *report
            .by_opcode
            .entry(inspect::opcode_label(&packet.message).to_string())
            .or_default() += 1;
        if inspect::is_request(&packet.message) {
            report.requests += 1;
        } else {
            report.responses += 1;
        }

        // Attribute compressed traffic by opening the envelope.
        let opened: Option<Vec<u8>> = if inspect::opcode(&packet.message) == OP_COMPRESSED {
            match protocol::decompress_message(&packet.message) {
                Ok(inner) => {
                    report.compressed += 1;
                    Some(inner)
                }
                Err(_) => {
                    report.compressed_opaque += 1;
                    None
                }
            }
        } else {
            None
        };
        let view: &[u8] = opened.as_deref().unwrap_or(&packet.message);

        *report
            .by_category
            .entry(inspect::category(view).as_str().to_string())
            .or_default() += 1;

        if inspect::is_request(view) {
            if let Some(name) = inspect::command_name(view) {
                *report.by_command.entry(name.to_string()).or_default() += 1;
                let database = inspect::database(view).unwrap_or_default();
                let collection = inspect::collection(view).unwrap_or_default();
                if classify::is_likely_user_command(name, database, collection) {
                    report.user_operations += 1;
                } else {
                    report.internal_operations += 1;
                }
            }
        }
    }

    report.sessions = sessions.len() as u64;
    report.duration_us = report.last_offset_us.saturating_sub(report.first_offset_us);
    Ok(report)
}

impl AnalyzeReport {
    pub fn render_text<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        writeln!(out, "packets:           {}", self.packets)?;
        writeln!(out, "  requests:        {}", self.requests)?;
        writeln!(out, "  responses:       {}", self.responses)?;
        writeln!(out, "  session markers: {}", self.session_markers)?;
        writeln!(out, "sessions:          {}", self.sessions)?;
        writeln!(
            out,
            "duration:          {:.3}s (offsets {}us..{}us)",
            self.duration_us as f64 / 1e6,
            self.first_offset_us,
            self.last_offset_us
        )?;
        writeln!(out, "user operations:   {}", self.user_operations)?;
        writeln!(out, "internal ops:      {}", self.internal_operations)?;
        if self.compressed + self.compressed_opaque > 0 {
            writeln!(
                out,
                "compressed:        {} ({} opaque)",
                self.compressed, self.compressed_opaque
            )?;
        }
        if self.truncated_files > 0 {
            writeln!(out, "truncated files:   {}", self.truncated_files)?;
        }
        writeln!(out, "by opcode:")?;
        for (name, count) in &self.by_opcode {
            writeln!(out, "  {name:<18} {count}")?;
        }
        writeln!(out, "by category:")?;
        for (name, count) in &self.by_category {
            writeln!(out, "  {name:<18} {count}")?;
        }
        writeln!(out, "by command:")?;
        for (name, count) in &self.by_command {
            writeln!(out, "  {name:<18} {count}")?;
        }
        Ok(())
    }

    pub fn render_json<W: Write>(&self, out: &mut W) -> Result<()> {
        serde_json::to_writer_pretty(&mut *out, self)
            .map_err(|e| Error::Msg(format!("serialize report: {e}")))?;
        writeln!(out)?;
        Ok(())
    }
}
