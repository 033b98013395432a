use ulid::Ulid;

use crate::model::HostId;

#[derive(Debug)]
pub enum EngineError {
    LinkNotFound(String),
    HostNotFound(HostId),
    InvalidInput(String),
    /// The requested slot is not in the current grid (outside rules, busy, or past).
    SlotUnavailable,
    /// Another committed booking already holds an overlapping span.
    Conflict(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::LinkNotFound(slug) => write!(f, "booking link not found: {slug}"),
            EngineError::HostNotFound(id) => write!(f, "host not found: {id}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::SlotUnavailable => {
                write!(f, "selected time is no longer available, please pick another slot")
            }
            EngineError::Conflict(id) => {
                write!(f, "slot was just booked by someone else (booking {id}), please refresh availability")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
