use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WsError {
    Io(#[from] std::io::Error),
    Command(String),
    Remote(String),
    Validation(String),
    Parse(String),
    Internal(String),
    Cancelled,
    Other(#[from] anyhow::Error),
}

impl Display for WsError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            WsError::Io(e) => write!(f, "I/O error: {}", e),
            WsError::Command(s) => write!(f, "Command failed: {}", s),
            WsError::Remote(s) => write!(f, "Remote shell error: {}", s),
            WsError::Validation(s) => write!(f, "Validation error: {}", s),
            WsError::Parse(s) => write!(f, "Parse error: {}", s),
            WsError::Internal(s) => write!(f, "Internal error: {}", s),
            WsError::Cancelled => write!(f, "Operation cancelled"),
            WsError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl From<serde_json::Error> for WsError {
    fn from(err: serde_json::Error) -> Self {
        WsError::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WsError>;
