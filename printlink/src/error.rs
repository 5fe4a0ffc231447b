use uuid::Uuid;

use printlink_proto::display_uuid;

/// Errors surfaced by the connection lifecycle
///
/// `Clone` so a single in-flight connection attempt can hand its outcome to
/// every caller waiting on it.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("device selection cancelled")]
    SelectionCancelled,
    #[error("bluetooth is not supported: {0}")]
    SelectionUnsupported(String),
    #[error("GATT connect failed: {0}")]
    GattConnectFailed(String),
    #[error("service {} not found", short(.0))]
    ServiceNotFound(Uuid),
    #[error("characteristic {} not found", short(.0))]
    CharacteristicNotFound(Uuid),
    #[error("characteristic {} does not support notifications", short(.0))]
    NotificationUnsupported(Uuid),
    #[error("not connected")]
    NotReady,
    #[error("connection attempt aborted by disconnect")]
    Aborted,
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("bluetooth error: {0}")]
    Platform(String),
}

fn short(uuid: &Uuid) -> String {
    display_uuid(*uuid)
}

impl From<btleplug::Error> for LinkError {
    fn from(e: btleplug::Error) -> Self {
        Self::Platform(e.to_string())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid {field} identifier: {source}")]
    Identifier {
        field: &'static str,
        source: printlink_proto::UuidError,
    },
    #[error("max_write_len must be between 1 and {max}, got {got}")]
    WriteLen { max: usize, got: usize },
}
