//! Error types for Nancy.

use std::path::PathBuf;

use thiserror::Error;

use crate::comms::{MessageType, Role};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid message type '{msg_type}' for {role} (allowed: {})", join_types(.allowed))]
    InvalidType {
        msg_type: String,
        role: Role,
        allowed: &'static [MessageType],
    },

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Malformed message {}: {reason}", .path.display())]
    MalformedMessage { path: PathBuf, reason: String },

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn join_types(types: &[MessageType]) -> String {
    types
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::MalformedMessage {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
