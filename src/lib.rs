//! Replay recorded MongoDB wire traffic against a live server.
//!
//! The pipeline: [`recording`] decodes `*.bin` capture files into packets,
//! [`inspect`] and [`classify`] answer questions about each packet without a
//! full BSON parse, [`filter`] rewrites recordings, [`replay`] drives packets
//! to a target (raw bytes or re-issued commands), and [`script`] translates
//! recorded commands into a mongosh script.

pub mod analyze;
pub mod classify;
pub mod command;
pub mod config;
pub mod error;
pub mod filter;
pub mod inspect;
pub mod protocol;
pub mod recording;
pub mod replay;
pub mod scram;
pub mod script;
pub mod target;
pub mod tls;
