//! Observer errors

use fco_dom::SelectorError;

use crate::source::SourceKind;

/// Change source failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("{kind} source could not be created: {reason}")]
    Unavailable { kind: SourceKind, reason: String },

    #[error("{kind} source failed to connect: {reason}")]
    ConnectFailed { kind: SourceKind, reason: String },

    #[error("{kind} source lost its connection")]
    Disconnected { kind: SourceKind },
}

/// Engine error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ObserverError {
    #[error("invalid selector: {0}")]
    InvalidSelector(#[from] SelectorError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid subscription `{id}`: {reason}")]
    InvalidDescriptor { id: String, reason: String },

    #[error("change source error: {0}")]
    Source(#[from] SourceError),

    #[error("configuration could not be parsed: {0}")]
    ConfigFormat(String),

    #[error("pipeline failure: {0}")]
    Systemic(String),

    #[error("observer has been destroyed")]
    Destroyed,
}

impl From<serde_json::Error> for ObserverError {
    fn from(err: serde_json::Error) -> Self {
        ObserverError::ConfigFormat(err.to_string())
    }
}

/// Failure reported by a subscriber callback
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CallbackError {
    message: String,
}

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for CallbackError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for CallbackError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}
