use crate::model::{SlotKey, SlotKind, Span};

#[derive(Debug)]
pub enum EngineError {
    InvalidPeriod(Span),
    KeyMismatch {
        expected: SlotKey,
        found: SlotKey,
    },
    PayloadKindMismatch {
        key: SlotKey,
        payload: SlotKind,
    },
    MissingReference(String),
    Storage(String),
    LimitExceeded(&'static str),
    InvalidConfig(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidPeriod(span) => write!(f, "invalid period: {span}"),
            EngineError::KeyMismatch { expected, found } => {
                write!(f, "slot key mismatch: expected {expected}, found {found}")
            }
            EngineError::PayloadKindMismatch { key, payload } => {
                write!(f, "payload of kind {payload:?} cannot be stored on timeline {key}")
            }
            EngineError::MissingReference(what) => write!(f, "missing reference: {what}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
