//! User-vs-internal traffic classification.
//!
//! A command name alone cannot separate application traffic from cluster
//! coordination: the same `getMore` verb carries both user cursor
//! continuation and oplog tailing, and the latter can dominate a recording.
//! The smart path therefore joins the command with its database and
//! collection context.

use crate::inspect;
use crate::recording::Packet;

pub fn is_internal_database(db: &str) -> bool {
    matches!(db, "local" | "admin" | "config")
}

pub fn is_internal_collection(coll: &str) -> bool {
    coll.starts_with("system.")
        || matches!(
            coll,
            "oplog.rs"
                | "startup_log"
                | "replset.election"
                | "replset.minvalid"
                | "replset.oplogTruncateAfterPoint"
        )
}

/// Commands that never originate from application code. `getMore` is listed
/// here even though it is ambiguous; the smart path below reclassifies it.
pub fn is_internal_command(name: &str) -> bool {
    matches!(
        name,
        "replSetHeartbeat"
            | "replSetGetStatus"
            | "replSetGetConfig"
            | "replSetUpdatePosition"
            | "getMore"
            | "hello"
            | "isMaster"
            | "ping"
            | "buildInfo"
            | "serverStatus"
            | "_configsvrCommitChunkMigration"
            | "_configsvrCommitChunkSplit"
            | "_shardsvrCloneCatalogData"
            | "_flushRoutingTableCacheUpdates"
    )
}

/// Context-aware user-operation test over (command, database, collection).
pub fn is_likely_user_command(command: &str, database: &str, collection: &str) -> bool {
    if command.is_empty() {
        return false;
    }
    match command {
        // User data and DDL, unless aimed at system namespaces
        "insert" | "update" | "delete" | "findAndModify" | "create" | "drop"
        | "createIndexes" | "dropIndexes" => {
            !is_internal_database(database) && !is_internal_collection(collection)
        }
        // Driver discovery and replication chatter
        "hello" | "isMaster" | "ping" | "buildInfo" | "replSetHeartbeat"
        | "replSetGetStatus" | "replSetUpdatePosition" => false,
        // Reads cut both ways; decide from context
        "find" | "aggregate" | "count" | "distinct" | "getMore" | "listIndexes"
        | "listCollections" | "listDatabases" => {
            // Oplog tailing is the dominant getMore conversation in a capture;
            // test it before the generic internal-database rule.
            if command == "getMore" && database == "local" && collection == "oplog.rs" {
                return false;
            }
            if is_internal_database(database) {
                return false;
            }
            true
        }
        _ => false,
    }
}

/// Packet-level simple test: is this an internal operation by command name?
pub fn is_internal_operation(packet: &Packet) -> bool {
    inspect::command_name(&packet.message).is_some_and(is_internal_command)
}

/// Packet-level smart test joining command, `$db` and collection.
pub fn is_likely_user_operation(packet: &Packet) -> bool {
    let msg = &packet.message;
    let Some(command) = inspect::command_name(msg) else {
        return false;
    };
    let database = inspect::database(msg).unwrap_or_default();
    let collection = inspect::collection(msg).unwrap_or_default();
    is_likely_user_command(command, database, collection)
}
