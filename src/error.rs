use thiserror::Error;

/// Synchronous rejections of an administrative command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("malformed command JSON: {0}")]
    BadJson(String),

    #[error("missing required fields: {0}")]
    MissingFields(String),

    #[error("{table}/{item} is not writable")]
    NotAllowed { table: String, item: String },

    #[error("invalid value for {table}/{item}: {reason}")]
    BadValue {
        table: String,
        item: String,
        reason: String,
    },
}

impl CommandError {
    /// Error code published in the command result.
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::BadJson(_) => "bad_json",
            CommandError::MissingFields(_) => "missing_fields",
            CommandError::NotAllowed { .. } => "not_allowed",
            CommandError::BadValue { .. } => "bad_value",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    // connectivity
    #[error("cloud connect to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("cloud closed the connection")]
    CloudClosed,

    #[error("no cloud acknowledgement within {0:?}")]
    AckTimeout(std::time::Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // protocol
    #[error("command rejected: {0}")]
    Command(#[from] CommandError),

    // lifecycle
    #[error("transaction {tx_id} failed: {detail}")]
    Lifecycle { tx_id: String, detail: String },

    // ownership
    #[error("ACK for {tx_id} arrived on conn {got}, command was delivered on conn {expected}")]
    ForeignAck {
        tx_id: String,
        expected: u64,
        got: u64,
    },

    #[error("config error in [{section}] {key}: {reason}")]
    Config {
        section: String,
        key: String,
        reason: String,
    },

    #[error("state file error: {0}")]
    State(#[from] serde_json::Error),

    #[error("pending delivery slot is occupied by {0}")]
    SlotBusy(String),
}

impl ProxyError {
    /// Short reason handed to the circuit breaker and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            ProxyError::Connect { .. } => "connect_failed",
            ProxyError::CloudClosed => "cloud_eof",
            ProxyError::AckTimeout(_) => "ack_timeout",
            ProxyError::Io(_) => "cloud_error",
            ProxyError::Command(_) => "command_rejected",
            ProxyError::Lifecycle { .. } => "lifecycle",
            ProxyError::ForeignAck { .. } => "foreign_ack",
            ProxyError::Config { .. } => "config",
            ProxyError::State(_) => "state_file",
            ProxyError::SlotBusy(_) => "slot_busy",
        }
    }
}
