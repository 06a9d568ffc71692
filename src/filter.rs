//! Recording filter: rewrite a recording into a smaller equivalent one.
//!
//! Surviving packets are re-encoded in the identical frame format with
//! metadata and message bytes copied verbatim, so the output stays valid
//! input for raw-mode replay.

use crate::classify;
use crate::error::Result;
use crate::inspect;
use crate::recording::{self, Packet};
use std::collections::HashSet;
use std::io::Write;

/// Which packets survive. All enabled tests must pass.
#[derive(Debug, Clone, Default)]
pub struct FilterPredicate {
    pub requests_only: bool,
    pub user_ops_only: bool,
    pub user_ops_smart: bool,
    pub exclude_internal: bool,
    pub include_commands: HashSet<String>,
    pub exclude_commands: HashSet<String>,
    /// Microsecond bounds; 0 disables the bound.
    pub min_offset_us: u64,
    pub max_offset_us: u64,
}

/// Why a packet was dropped, tallied for the completion report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Response,
    InternalOperation,
    CommandFilter,
    TimeRange,
    EmptyMessage,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Response => "response",
            Self::InternalOperation => "internal-operation",
            Self::CommandFilter => "command-filter",
            Self::TimeRange => "time-range",
            Self::EmptyMessage => "empty-message",
        }
    }
}

impl FilterPredicate {
    /// `None` when the packet passes, otherwise the first failing test.
    pub fn evaluate(&self, packet: &Packet) -> Option<DropReason> {
        if self.min_offset_us != 0 && packet.offset_us < self.min_offset_us {
            return Some(DropReason::TimeRange);
        }
        if self.max_offset_us != 0 && packet.offset_us > self.max_offset_us {
            return Some(DropReason::TimeRange);
        }

        let msg = &packet.message;

        // Session markers carry no command: the user-ops predicates can
        // never accept them, while a plain requests-only pass keeps them so
        // session boundaries survive into the output.
        if msg.is_empty() {
            if self.user_ops_only || self.user_ops_smart {
                return Some(DropReason::EmptyMessage);
            }
        } else if self.requests_only && !inspect::is_request(msg) {
            return Some(DropReason::Response);
        }

        if self.user_ops_only {
            let name = inspect::command_name(msg).unwrap_or_default();
            if !inspect::is_user_command(name) {
                return Some(DropReason::InternalOperation);
            }
        }
        if self.user_ops_smart && !classify::is_likely_user_operation(packet) {
            return Some(DropReason::InternalOperation);
        }
        if self.exclude_internal && classify::is_internal_operation(packet) {
            return Some(DropReason::InternalOperation);
        }

        if !self.include_commands.is_empty() || !self.exclude_commands.is_empty() {
            let name = inspect::command_name(msg).unwrap_or_default();
            if !self.include_commands.is_empty() && !self.include_commands.contains(name) {
                return Some(DropReason::CommandFilter);
            }
            if self.exclude_commands.contains(name) {
                return Some(DropReason::CommandFilter);
            }
        }

        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FilterStats {
    pub read: u64,
    pub kept: u64,
    pub dropped_response: u64,
    pub dropped_internal: u64,
    pub dropped_command_filter: u64,
    pub dropped_time_range: u64,
    pub dropped_empty_message: u64,
}

impl FilterStats {
    fn record_drop(&mut self, reason: DropReason) {
        match reason {
            DropReason::Response => self.dropped_response += 1,
            DropReason::InternalOperation => self.dropped_internal += 1,
            DropReason::CommandFilter => self.dropped_command_filter += 1,
            DropReason::TimeRange => self.dropped_time_range += 1,
            DropReason::EmptyMessage => self.dropped_empty_message += 1,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.read - self.kept
    }
}

/// Copy packets that pass `predicate` from `packets` to `out`, preserving
/// order and byte-level framing.
pub fn run<I, W>(packets: I, out: &mut W, predicate: &FilterPredicate) -> Result<FilterStats>
where
    I: Iterator<Item = Result<Packet>>,
    W: Write,
{
    let mut stats = FilterStats::default();
    for packet in packets {
        let packet = packet?;
        stats.read += 1;
        match predicate.evaluate(&packet) {
            None => {
                recording::write_packet(out, &packet)?;
                stats.kept += 1;
            }
            Some(reason) => {
                stats.record_drop(reason);
                tracing::trace!(
                    order = packet.order,
                    reason = reason.as_str(),
                    "dropped packet"
                );
            }
        }
    }
    out.flush()?;
    tracing::info!(
        read = stats.read,
        kept = stats.kept,
        dropped = stats.dropped(),
        "filter pass complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_op_msg;
    use crate::recording::PacketReader;
    use bson::doc;
    use bytes::Bytes;

    fn packet(offset_us: u64, order: u64, message: Vec<u8>) -> Packet {
        Packet {
            session_id: 1,
            session_metadata: Bytes::from_static(b"peer"),
            offset_us,
            order,
            message: Bytes::from(message),
        }
    }

    fn request(doc: bson::Document) -> Vec<u8> {
        encode_op_msg(&doc, 0, 1).unwrap()
    }

    fn response(doc: bson::Document) -> Vec<u8> {
        encode_op_msg(&doc, 9, 2).unwrap()
    }

    #[test]
    fn accept_all_roundtrip() {
        let packets = vec![
            packet(0, 1, Vec::new()),
            packet(5, 2, request(doc! {"insert": "u", "$db": "app"})),
            packet(9, 3, response(doc! {"ok": 1.0})),
        ];
        let mut input = Vec::new();
        for p in &packets {
            recording::write_packet(&mut input, p).unwrap();
        }

        let mut output = Vec::new();
        let stats = run(
            PacketReader::new(&input[..]),
            &mut output,
            &FilterPredicate::default(),
        )
        .unwrap();
        assert_eq!(stats.read, 3);
        assert_eq!(stats.kept, 3);
        assert_eq!(output, input);
    }

    #[test]
    fn requests_only_keeps_session_markers() {
        let predicate = FilterPredicate {
            requests_only: true,
            ..Default::default()
        };
        assert_eq!(predicate.evaluate(&packet(0, 1, Vec::new())), None);
        assert_eq!(
            predicate.evaluate(&packet(0, 2, request(doc! {"find": "u", "$db": "app"}))),
            None
        );
        assert_eq!(
            predicate.evaluate(&packet(0, 3, response(doc! {"ok": 1.0}))),
            Some(DropReason::Response)
        );
    }

    #[test]
    fn user_ops_drop_session_markers() {
        for predicate in [
            FilterPredicate {
                user_ops_only: true,
                ..Default::default()
            },
            FilterPredicate {
                user_ops_smart: true,
                ..Default::default()
            },
        ] {
            assert_eq!(
                predicate.evaluate(&packet(0, 1, Vec::new())),
                Some(DropReason::EmptyMessage)
            );
        }
    }

    #[test]
    fn user_ops_simple_set() {
        let predicate = FilterPredicate {
            user_ops_only: true,
            ..Default::default()
        };
        assert_eq!(
            predicate.evaluate(&packet(0, 1, request(doc! {"insert": "u", "$db": "app"}))),
            None
        );
        // simple path has no namespace context; getMore on the oplog passes
        assert_eq!(
            predicate.evaluate(&packet(
                0,
                2,
                request(doc! {"getMore": 1i64, "collection": "oplog.rs", "$db": "local"})
            )),
            None
        );
        assert_eq!(
            predicate.evaluate(&packet(0, 3, request(doc! {"hello": 1i32, "$db": "admin"}))),
            Some(DropReason::InternalOperation)
        );
    }

    #[test]
    fn user_ops_smart_drops_oplog_tailing() {
        let predicate = FilterPredicate {
            user_ops_smart: true,
            ..Default::default()
        };
        assert_eq!(
            predicate.evaluate(&packet(
                0,
                1,
                request(doc! {"getMore": 1i64, "collection": "oplog.rs", "$db": "local"})
            )),
            Some(DropReason::InternalOperation)
        );
        assert_eq!(
            predicate.evaluate(&packet(
                0,
                2,
                request(doc! {"getMore": 1i64, "collection": "orders", "$db": "shop"})
            )),
            None
        );
    }

    #[test]
    fn exclude_internal() {
        let predicate = FilterPredicate {
            exclude_internal: true,
            ..Default::default()
        };
        assert_eq!(
            predicate.evaluate(&packet(0, 1, request(doc! {"ping": 1i32, "$db": "admin"}))),
            Some(DropReason::InternalOperation)
        );
        assert_eq!(
            predicate.evaluate(&packet(0, 2, request(doc! {"insert": "u", "$db": "app"}))),
            None
        );
    }

    #[test]
    fn command_include_exclude() {
        let predicate = FilterPredicate {
            include_commands: ["insert".to_string()].into(),
            ..Default::default()
        };
        assert_eq!(
            predicate.evaluate(&packet(0, 1, request(doc! {"insert": "u", "$db": "app"}))),
            None
        );
        assert_eq!(
            predicate.evaluate(&packet(0, 2, request(doc! {"find": "u", "$db": "app"}))),
            Some(DropReason::CommandFilter)
        );

        let predicate = FilterPredicate {
            exclude_commands: ["find".to_string()].into(),
            ..Default::default()
        };
        assert_eq!(
            predicate.evaluate(&packet(0, 3, request(doc! {"find": "u", "$db": "app"}))),
            Some(DropReason::CommandFilter)
        );
        assert_eq!(
            predicate.evaluate(&packet(0, 4, request(doc! {"count": "u", "$db": "app"}))),
            None
        );
    }

    #[test]
    fn time_range_bounds() {
        let predicate = FilterPredicate {
            min_offset_us: 100,
            max_offset_us: 200,
            ..Default::default()
        };
        let m = request(doc! {"find": "u", "$db": "app"});
        assert_eq!(
            predicate.evaluate(&packet(50, 1, m.clone())),
            Some(DropReason::TimeRange)
        );
        assert_eq!(predicate.evaluate(&packet(150, 2, m.clone())), None);
        assert_eq!(
            predicate.evaluate(&packet(250, 3, m)),
            Some(DropReason::TimeRange)
        );
    }

    #[test]
    fn zero_bound_is_disabled() {
        let predicate = FilterPredicate::default();
        let m = request(doc! {"find": "u", "$db": "app"});
        assert_eq!(predicate.evaluate(&packet(u64::MAX, 1, m)), None);
    }

    #[test]
    fn drop_tallies() {
        let packets = vec![
            packet(0, 1, Vec::new()),
            packet(5, 2, request(doc! {"insert": "u", "$db": "app"})),
            packet(6, 3, request(doc! {"hello": 1i32, "$db": "admin"})),
            packet(9, 4, response(doc! {"ok": 1.0})),
        ];
        let mut input = Vec::new();
        for p in &packets {
            recording::write_packet(&mut input, p).unwrap();
        }
        let predicate = FilterPredicate {
            requests_only: true,
            user_ops_smart: true,
            ..Default::default()
        };
        let mut output = Vec::new();
        let stats = run(PacketReader::new(&input[..]), &mut output, &predicate).unwrap();
        assert_eq!(stats.kept, 1);
        assert_eq!(stats.dropped_empty_message, 1);
        assert_eq!(stats.dropped_internal, 1);
        assert_eq!(stats.dropped_response, 1);
        assert_eq!(stats.dropped(), 3);
    }
}
