//! Semantic command extraction for command-mode replay and script generation.
//!
//! Raw replay never needs this; it writes captured bytes verbatim. Command
//! mode re-parses the OP_MSG body so it can be re-issued through a fresh
//! connection, which requires dropping the session and consistency fields the
//! original driver stamped onto it.

use crate::error::{Error, Result};
use crate::protocol::{MessageHeader, OP_MSG};
use bson::{Bson, Document};

/// Keys stripped recursively from extracted command documents. Everything
/// else, including `$`-prefixed query operators, is preserved.
const STRIPPED_FIELDS: [&str; 9] = [
    "$clusterTime",
    "$db",
    "$readPreference",
    "lsid",
    "txnNumber",
    "autocommit",
    "startTransaction",
    "readConcern",
    "writeConcern",
];

/// A parsed view of a recorded OP_MSG request.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub database: String,
    pub name: String,
    pub document: Document,
}

impl Command {
    /// Parse the section-0 body of an OP_MSG wire message.
    pub fn parse(msg: &[u8]) -> Result<Self> {
        let (header, _) = MessageHeader::parse(msg)
            .ok_or_else(|| Error::MalformedWireMessage("short header".into()))?;
        if header.op_code != OP_MSG {
            return Err(Error::UnsupportedOpcode(header.op_code));
        }
        if msg.len() < 21 {
            return Err(Error::MalformedWireMessage("OP_MSG body too short".into()));
        }
        if msg[20] != 0 {
            return Err(Error::MalformedWireMessage(format!(
                "first section kind {} is not a body section",
                msg[20]
            )));
        }
        let raw = Document::from_reader(&mut std::io::Cursor::new(&msg[21..]))?;

        let name = raw
            .keys()
            .next()
            .cloned()
            .ok_or(Error::MissingCommandName)?;
        if STRIPPED_FIELDS.contains(&name.as_str()) {
            return Err(Error::MissingCommandName);
        }
        let database = raw
            .get_str("$db")
            .map_err(|_| Error::MissingDatabase)?
            .to_string();
        if database.is_empty() {
            return Err(Error::MissingDatabase);
        }

        Ok(Self {
            database,
            name,
            document: strip_internal_fields(&raw),
        })
    }

    /// Collection the command targets, when its first value is a string.
    pub fn collection(&self) -> Option<&str> {
        match self.document.get(&self.name) {
            Some(Bson::String(coll)) => Some(coll),
            _ => None,
        }
    }
}

/// Remove driver/session bookkeeping fields at every document depth.
/// Idempotent; arrays are traversed, scalar values are copied as-is.
pub fn strip_internal_fields(doc: &Document) -> Document {
    let mut out = Document::new();
    for (key, value) in doc.iter() {
        if STRIPPED_FIELDS.contains(&key.as_str()) {
            continue;
        }
        out.insert(key.clone(), strip_value(value));
    }
    out
}

fn strip_value(value: &Bson) -> Bson {
    match value {
        Bson::Document(doc) => Bson::Document(strip_internal_fields(doc)),
        Bson::Array(items) => Bson::Array(items.iter().map(strip_value).collect()),
        other => other.clone(),
    }
}
