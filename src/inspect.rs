//! Byte-level wire message inspection.
//!
//! Pure functions over a packet's raw message slice. These answer the
//! questions the filter, classifier and analyzer need (opcode, direction,
//! command name, `$db`, target collection) without pulling the payload
//! through a BSON parser; recorded messages can be large and internal
//! commands carry opaque sub-documents.

use crate::protocol::{
    self, OP_COMPRESSED, OP_MSG, OP_REPLY, is_legacy_opcode,
};

/// Offset of the first section kind byte in an OP_MSG (16-byte header + 4
/// flag bytes).
const SECTION_KIND_OFFSET: usize = 20;

/// First field name of a section-0 body starts after the section kind byte,
/// the document length prefix and the element type byte.
const FIRST_NAME_OFFSET: usize = 26;

/// `$db` values longer than this are treated as payload collisions.
const MAX_DB_LEN: usize = 64;

/// Opcode of the wire message, or 0 when the message is shorter than its header.
pub fn opcode(msg: &[u8]) -> i32 {
    if msg.len() < 16 {
        return 0;
    }
    i32::from_le_bytes([msg[12], msg[13], msg[14], msg[15]])
}

/// A message is a request iff its `response_to` field is zero.
pub fn is_request(msg: &[u8]) -> bool {
    if msg.len() < 16 {
        return false;
    }
    i32::from_le_bytes([msg[8], msg[9], msg[10], msg[11]]) == 0
}

/// First field name of an OP_MSG section-0 body, which by convention is the
/// command name. `None` for anything that is not a section-0 OP_MSG.
pub fn command_name(msg: &[u8]) -> Option<&str> {
    if msg.len() < 21 || opcode(msg) != OP_MSG {
        return None;
    }
    if msg[SECTION_KIND_OFFSET] != 0 {
        return None;
    }
    let (name, _) = read_cstr(msg.get(FIRST_NAME_OFFSET..)?)?;
    if name.is_empty() { None } else { Some(name) }
}

/// Database targeted by an OP_MSG, located by scanning for the `$db` field
/// drivers insert into every command body.
///
/// A match is only accepted when the following bytes look like a sane BSON
/// string (encoded length 2..=65, i.e. a non-empty value of at most 64
/// bytes, terminated, printable UTF-8); otherwise the scan resumes at the
/// next candidate. Collisions against payload strings are theoretically
/// possible, so consumers treat the result as a hint.
pub fn database(msg: &[u8]) -> Option<&str> {
    const PATTERN: &[u8] = b"$db\x00";
    let mut search_from = 0;
    while let Some(found) = find(&msg[search_from..], PATTERN) {
        let value_at = search_from + found + PATTERN.len();
        if let Some(db) = read_bson_string(msg.get(value_at..)?) {
            if !db.is_empty()
                && db.len() <= MAX_DB_LEN
                && !db.bytes().any(|b| b < 0x20 || b == 0x7f)
            {
                return Some(db);
            }
        }
        search_from += found + 1;
    }
    None
}

/// Target collection for commands whose first BSON value is a string naming
/// it (`insert`, `find`, `update`, ...). `None` when the first value has any
/// other element type.
pub fn collection(msg: &[u8]) -> Option<&str> {
    let name = command_name(msg)?;
    // element type precedes the name cstring
    if msg[FIRST_NAME_OFFSET - 1] != 0x02 {
        return None;
    }
    let value_at = FIRST_NAME_OFFSET + name.len() + 1;
    read_bson_string(msg.get(value_at..)?)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Null-terminated UTF-8 string; returns the string and bytes consumed
/// including the terminator.
fn read_cstr(buf: &[u8]) -> Option<(&str, usize)> {
    let end = buf.iter().position(|&b| b == 0)?;
    let s = std::str::from_utf8(&buf[..end]).ok()?;
    Some((s, end + 1))
}

/// BSON string payload: i32 length (including the trailing null), bytes, null.
fn read_bson_string(buf: &[u8]) -> Option<&str> {
    if buf.len() < 4 {
        return None;
    }
    let len = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len < 1 {
        return None;
    }
    let len = len as usize;
    let bytes = buf.get(4..4 + len)?;
    if bytes[len - 1] != 0 {
        return None;
    }
    std::str::from_utf8(&bytes[..len - 1]).ok()
}

/// Coarse traffic category of a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    Crud,
    Read,
    ReadContinuation,
    Ddl,
    HealthCheck,
    Info,
    Replication,
    Admin,
    RecordingControl,
    LegacyQuery,
    LegacyReply,
    Unknown,
    Other,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crud => "crud",
            Self::Read => "read",
            Self::ReadContinuation => "read-continuation",
            Self::Ddl => "ddl",
            Self::HealthCheck => "health-check",
            Self::Info => "info",
            Self::Replication => "replication",
            Self::Admin => "admin",
            Self::RecordingControl => "recording-control",
            Self::LegacyQuery => "legacy-query",
            Self::LegacyReply => "legacy-reply",
            Self::Unknown => "unknown",
            Self::Other => "other",
        }
    }
}

pub fn category(msg: &[u8]) -> Category {
    if msg.len() < 16 {
        return Category::Unknown;
    }
    let op = opcode(msg);
    if op == OP_REPLY {
        return Category::LegacyReply;
    }
    if is_legacy_opcode(op) {
        return Category::LegacyQuery;
    }
    if op == OP_COMPRESSED {
        return Category::Other;
    }
    if op != OP_MSG {
        return Category::Unknown;
    }
    match command_name(msg) {
        Some(name) => category_for_command(name),
        None => Category::Unknown,
    }
}

pub fn category_for_command(name: &str) -> Category {
    match name {
        "insert" | "update" | "delete" | "findAndModify" => Category::Crud,
        "find" | "aggregate" | "count" | "distinct" => Category::Read,
        "getMore" | "killCursors" => Category::ReadContinuation,
        "create" | "drop" | "createIndexes" | "dropIndexes" | "collMod"
        | "renameCollection" | "dropDatabase" => Category::Ddl,
        "hello" | "isMaster" | "ismaster" | "ping" => Category::HealthCheck,
        "buildInfo" | "serverStatus" | "listDatabases" | "listCollections" | "listIndexes"
        | "connectionStatus" | "getParameter" | "whatsmyuri" | "getLog" | "hostInfo"
        | "getCmdLineOpts" => Category::Info,
        "startRecordingTraffic" | "stopRecordingTraffic" => Category::RecordingControl,
        "saslStart" | "saslContinue" | "logout" | "endSessions" | "killAllSessions"
        | "killOp" | "currentOp" | "commitTransaction" | "abortTransaction"
        | "setParameter" | "fsync" => Category::Admin,
        _ => {
            if name.starts_with("replSet")
                || name.starts_with("_configsvr")
                || name.starts_with("_shardsvr")
                || name.starts_with("_flush")
            {
                Category::Replication
            } else {
                Category::Other
            }
        }
    }
}

/// Closed set of command names that carry user data or user-initiated DDL.
/// This is the simple (context-free) user-operation test; the smart path in
/// `classify` additionally weighs database and collection.
pub fn is_user_command(name: &str) -> bool {
    matches!(
        name,
        "insert"
            | "update"
            | "delete"
            | "find"
            | "findAndModify"
            | "aggregate"
            | "count"
            | "distinct"
            | "getMore"
            | "create"
            | "drop"
            | "createIndexes"
            | "dropIndexes"
            | "collMod"
            | "renameCollection"
            | "dropDatabase"
    )
}

/// Convenience: opcode name for reporting, tolerating short messages.
pub fn opcode_label(msg: &[u8]) -> &'static str {
    if msg.len() < 16 {
        return "short";
    }
    protocol::opcode_name(opcode(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_op_msg;
    use bson::doc;

    fn msg(doc: bson::Document) -> Vec<u8> {
        encode_op_msg(&doc, 0, 1).unwrap()
    }

    #[test]
    fn opcode_and_request() {
        let m = msg(doc! {"ping": 1i32, "$db": "admin"});
        assert_eq!(opcode(&m), OP_MSG);
        assert!(is_request(&m));
        assert_eq!(opcode(&[0u8; 4]), 0);
        assert!(!is_request(&[0u8; 4]));
    }

    #[test]
    fn response_is_not_request() {
        let m = encode_op_msg(&doc! {"ok": 1.0}, 42, 7).unwrap();
        assert!(!is_request(&m));
    }

    #[test]
    fn command_name_extraction() {
        let m = msg(doc! {"insert": "users", "$db": "app"});
        assert_eq!(command_name(&m), Some("insert"));
        let m = msg(doc! {"replSetHeartbeat": "rs0", "$db": "admin"});
        assert_eq!(command_name(&m), Some("replSetHeartbeat"));
    }

    #[test]
    fn command_name_needs_section0_op_msg() {
        let mut m = msg(doc! {"ping": 1i32});
        m[20] = 1; // section kind 1
        assert_eq!(command_name(&m), None);

        let mut m = msg(doc! {"ping": 1i32});
        m[12..16].copy_from_slice(&crate::protocol::OP_QUERY.to_le_bytes());
        assert_eq!(command_name(&m), None);

        assert_eq!(command_name(&[0u8; 20]), None);
    }

    #[test]
    fn database_extraction() {
        let m = msg(doc! {"find": "users", "filter": {"a": 1i32}, "$db": "app"});
        assert_eq!(database(&m), Some("app"));
    }

    #[test]
    fn database_skips_payload_collision() {
        // a payload string containing the pattern must not shadow the real field
        let m = msg(doc! {"insert": "u", "documents": [{"note": "x$db\u{0}y"}], "$db": "app"});
        assert_eq!(database(&m), Some("app"));
    }

    #[test]
    fn database_absent() {
        let m = msg(doc! {"ping": 1i32});
        assert_eq!(database(&m), None);
    }

    #[test]
    fn collection_extraction() {
        let m = msg(doc! {"insert": "users", "$db": "app"});
        assert_eq!(collection(&m), Some("users"));
        let m = msg(doc! {"findAndModify": "jobs", "query": {}, "$db": "app"});
        assert_eq!(collection(&m), Some("jobs"));
    }

    #[test]
    fn collection_requires_string_first_value() {
        let m = msg(doc! {"ping": 1i32, "$db": "admin"});
        assert_eq!(collection(&m), None);
        let m = msg(doc! {"getMore": 99i64, "collection": "oplog.rs", "$db": "local"});
        assert_eq!(collection(&m), None);
    }

    #[test]
    fn categories() {
        assert_eq!(category(&msg(doc! {"insert": "u", "$db": "d"})), Category::Crud);
        assert_eq!(category(&msg(doc! {"find": "u", "$db": "d"})), Category::Read);
        assert_eq!(
            category(&msg(doc! {"getMore": 1i64, "collection": "u", "$db": "d"})),
            Category::ReadContinuation
        );
        assert_eq!(category(&msg(doc! {"createIndexes": "u", "$db": "d"})), Category::Ddl);
        assert_eq!(category(&msg(doc! {"hello": 1i32, "$db": "admin"})), Category::HealthCheck);
        assert_eq!(category(&msg(doc! {"serverStatus": 1i32, "$db": "admin"})), Category::Info);
        assert_eq!(
            category(&msg(doc! {"replSetHeartbeat": "rs0", "$db": "admin"})),
            Category::Replication
        );
        assert_eq!(
            category(&msg(doc! {"startRecordingTraffic": 1i32, "$db": "admin"})),
            Category::RecordingControl
        );
        assert_eq!(category(&msg(doc! {"saslStart": 1i32, "$db": "admin"})), Category::Admin);
        assert_eq!(category(&msg(doc! {"frobnicate": 1i32, "$db": "d"})), Category::Other);
        assert_eq!(category(&[0u8; 8]), Category::Unknown);
    }

    #[test]
    fn legacy_categories() {
        let mut m = msg(doc! {"x": 1i32});
        m[12..16].copy_from_slice(&crate::protocol::OP_QUERY.to_le_bytes());
        assert_eq!(category(&m), Category::LegacyQuery);
        m[12..16].copy_from_slice(&crate::protocol::OP_REPLY.to_le_bytes());
        assert_eq!(category(&m), Category::LegacyReply);
    }

    #[test]
    fn user_command_set() {
        for name in ["insert", "find", "getMore", "dropIndexes"] {
            assert!(is_user_command(name));
        }
        for name in ["hello", "replSetHeartbeat", "saslStart", ""] {
            assert!(!is_user_command(name));
        }
    }
}
