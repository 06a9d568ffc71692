//! Translate recorded commands into an executable mongosh script.
//!
//! Every statement is scoped through `db.getSiblingDB(...)` so the script
//! runs correctly regardless of the shell's current database. Commands
//! without a dedicated shell method fall back to `runCommand`.

use crate::command::Command;
use crate::error::Result;
use crate::inspect;
use crate::protocol::{self, OP_COMPRESSED};
use crate::recording::Packet;
use bson::{Bson, Document};
use std::io::Write;

#[derive(Debug, Clone, Default)]
pub struct ScriptOptions {
    /// Keep only data-path commands (CRUD and reads).
    pub crud_only: bool,
    /// Drop response messages instead of annotating them.
    pub requests_only: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptStats {
    pub packets: u64,
    pub statements: u64,
    pub comments: u64,
    pub skipped: u64,
}

const CRUD_COMMANDS: [&str; 8] = [
    "insert",
    "update",
    "delete",
    "findAndModify",
    "find",
    "aggregate",
    "count",
    "distinct",
];

/// Generate shell statements for every translatable packet in `packets`.
pub fn generate<I, W>(packets: I, out: &mut W, opts: &ScriptOptions) -> Result<ScriptStats>
where
    I: Iterator<Item = Result<Packet>>,
    W: Write,
{
    let mut stats = ScriptStats::default();
    writeln!(out, "// generated from a MongoDB traffic recording")?;

    for packet in packets {
        let packet = packet?;
        stats.packets += 1;

        if packet.message.is_empty() {
            stats.skipped += 1;
            continue;
        }
        if !inspect::is_request(&packet.message) {
            if opts.requests_only {
                stats.skipped += 1;
            } else {
                writeln!(out, "// packet {}: response, not translated", packet.order)?;
                stats.comments += 1;
            }
            continue;
        }

        // Open compressed envelopes so their commands translate too.
        let message: Vec<u8> = if inspect::opcode(&packet.message) == OP_COMPRESSED {
            match protocol::decompress_message(&packet.message) {
                Ok(inner) => inner,
                Err(e) => {
                    writeln!(out, "// packet {}: {}", packet.order, e)?;
                    stats.comments += 1;
                    continue;
                }
            }
        } else {
            packet.message.to_vec()
        };

        let cmd = match Command::parse(&message) {
            Ok(cmd) => cmd,
            Err(e) => {
                let name = inspect::command_name(&message).unwrap_or("unknown");
                writeln!(out, "// packet {}: {} ({})", packet.order, name, e)?;
                stats.comments += 1;
                continue;
            }
        };

        if opts.crud_only && !CRUD_COMMANDS.contains(&cmd.name.as_str()) {
            stats.skipped += 1;
            continue;
        }

        for statement in statements_for(&cmd) {
            writeln!(out, "{statement}")?;
            stats.statements += 1;
        }
    }

    out.flush()?;
    tracing::info!(
        packets = stats.packets,
        statements = stats.statements,
        comments = stats.comments,
        "script generation complete"
    );
    Ok(stats)
}

/// Shell statements for one parsed command.
pub fn statements_for(cmd: &Command) -> Vec<String> {
    let db = scope(&cmd.database);
    let Some(coll) = cmd.collection() else {
        return vec![run_command(&db, &cmd.document)];
    };
    let target = format!("{db}.{}", member(coll));

    match cmd.name.as_str() {
        "insert" => match cmd.document.get_array("documents") {
            Ok(docs) => docs
                .iter()
                .map(|doc| format!("{target}.insertOne({});", js(doc)))
                .collect(),
            Err(_) => vec![run_command(&db, &cmd.document)],
        },
        "update" => match cmd.document.get_array("updates") {
            Ok(updates) => updates
                .iter()
                .filter_map(|entry| entry.as_document())
                .map(|entry| {
                    let q = entry.get_document("q").cloned().unwrap_or_default();
                    let u = entry.get("u").cloned().unwrap_or(Bson::Document(Document::new()));
                    let method = if entry.get_bool("multi").unwrap_or(false) {
                        "updateMany"
                    } else {
                        "updateOne"
                    };
                    format!("{target}.{method}({}, {});", js_doc(&q), js(&u))
                })
                .collect(),
            Err(_) => vec![run_command(&db, &cmd.document)],
        },
        "delete" => match cmd.document.get_array("deletes") {
            Ok(deletes) => deletes
                .iter()
                .filter_map(|entry| entry.as_document())
                .map(|entry| {
                    let q = entry.get_document("q").cloned().unwrap_or_default();
                    let method = if entry.get_i32("limit").unwrap_or(0) == 1
                        || entry.get_i64("limit").unwrap_or(0) == 1
                    {
                        "deleteOne"
                    } else {
                        "deleteMany"
                    };
                    format!("{target}.{method}({});", js_doc(&q))
                })
                .collect(),
            Err(_) => vec![run_command(&db, &cmd.document)],
        },
        "find" => {
            let filter = cmd.document.get_document("filter").cloned().unwrap_or_default();
            let mut statement = format!("{target}.find({})", js_doc(&filter));
            if let Ok(projection) = cmd.document.get_document("projection") {
                statement.push_str(&format!(".project({})", js_doc(projection)));
            }
            if let Ok(sort) = cmd.document.get_document("sort") {
                statement.push_str(&format!(".sort({})", js_doc(sort)));
            }
            if let Some(limit) = int_value(cmd.document.get("limit")) {
                statement.push_str(&format!(".limit({limit})"));
            }
            statement.push(';');
            vec![statement]
        }
        "aggregate" => match cmd.document.get_array("pipeline") {
            Ok(pipeline) => vec![format!(
                "{target}.aggregate({});",
                js(&Bson::Array(pipeline.clone()))
            )],
            Err(_) => vec![run_command(&db, &cmd.document)],
        },
        "findAndModify" => {
            let mut args = cmd.document.clone();
            args.remove("findAndModify");
            vec![format!("{target}.findAndModify({});", js_doc(&args))]
        }
        "createIndexes" => match cmd.document.get_array("indexes") {
            Ok(indexes) => indexes
                .iter()
                .filter_map(|entry| entry.as_document())
                .map(|index| {
                    let key = index.get_document("key").cloned().unwrap_or_default();
                    let mut options = Document::new();
                    if let Ok(name) = index.get_str("name") {
                        options.insert("name", name);
                    }
                    if let Ok(unique) = index.get_bool("unique") {
                        options.insert("unique", unique);
                    }
                    if options.is_empty() {
                        format!("{target}.createIndex({});", js_doc(&key))
                    } else {
                        format!(
                            "{target}.createIndex({}, {});",
                            js_doc(&key),
                            js_doc(&options)
                        )
                    }
                })
                .collect(),
            Err(_) => vec![run_command(&db, &cmd.document)],
        },
        "dropIndexes" => match cmd.document.get("index") {
            Some(index) => vec![format!("{target}.dropIndex({});", js(index))],
            None => vec![run_command(&db, &cmd.document)],
        },
        "create" => vec![format!("{db}.createCollection({});", js_str(coll))],
        "drop" => vec![format!("{target}.drop();")],
        _ => vec![run_command(&db, &cmd.document)],
    }
}

fn scope(database: &str) -> String {
    format!("db.getSiblingDB({})", js_str(database))
}

fn run_command(db_scope: &str, doc: &Document) -> String {
    format!("{db_scope}.runCommand({});", js_doc(doc))
}

/// Collection access; names that are not identifier-safe go through the
/// indexing form.
fn member(coll: &str) -> String {
    let identifier_safe = !coll.is_empty()
        && coll
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !coll.chars().next().is_some_and(|c| c.is_ascii_digit());
    if identifier_safe {
        coll.to_string()
    } else {
        format!("getCollection({})", js_str(coll))
    }
}

fn js(value: &Bson) -> String {
    value.clone().into_relaxed_extjson().to_string()
}

fn js_doc(doc: &Document) -> String {
    js(&Bson::Document(doc.clone()))
}

fn js_str(s: &str) -> String {
    js(&Bson::String(s.to_string()))
}

fn int_value(value: Option<&Bson>) -> Option<i64> {
    match value {
        Some(Bson::Int32(v)) => Some(*v as i64),
        Some(Bson::Int64(v)) => Some(*v),
        Some(Bson::Double(v)) => Some(*v as i64),
        _ => None,
    }
}
