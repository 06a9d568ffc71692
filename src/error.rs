use std::result::Result as StdResult;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("bad frame: {0}")]
    BadFrame(String),

    #[error("session metadata exceeds {limit} bytes without a terminator")]
    MetadataOverflow { limit: usize },

    #[error("unexpected end of stream inside a frame")]
    Truncated,

    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(i32),

    #[error("malformed wire message: {0}")]
    MalformedWireMessage(String),

    #[error("malformed BSON: {0}")]
    MalformedBson(#[from] bson::de::Error),

    #[error("message carries no command name")]
    MissingCommandName,

    #[error("message carries no $db field")]
    MissingDatabase,

    #[error("command {name} failed: {detail}")]
    CommandFailed { name: String, detail: String },

    #[error("server error: {0}")]
    ServerError(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("replay cancelled")]
    Cancelled,

    #[error("{0}")]
    Msg(String),
}

pub type Result<T> = StdResult<T, Error>;
