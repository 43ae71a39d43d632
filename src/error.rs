use crate::types::{Phase, StopReason};

/// Violations of the vision socket protocol.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Short read: expected {expected} bytes, got {received}")]
    ShortRead { expected: usize, received: usize },

    #[error("Reply is not valid UTF-8")]
    InvalidEncoding,

    #[error("Expected 3 tokens in reply, found {found}: {payload:?}")]
    TokenCount { found: usize, payload: String },

    #[error("Token {token:?} is not a finite number")]
    InvalidNumber { token: String },
}

/// Errors that stop the pick-and-place cell.
#[derive(Debug, thiserror::Error)]
pub enum CellError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Vision protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("[{phase}] {command} failed, code={code}")]
    Command {
        phase: Phase,
        command: String,
        code: i32,
    },

    #[error("[{phase}] actuator reports error code {code}")]
    ActuatorFault { phase: Phase, code: i32 },

    #[error("[{phase}] safety stop: {reason}")]
    SafetyStop { phase: Phase, reason: StopReason },

    #[error("[{phase}] stop requested")]
    StopRequested { phase: Phase },

    #[error("Counter store error: {0}")]
    Store(String),

    #[error("Counter value {value} exceeds capacity {capacity}")]
    CounterOutOfRange { value: u16, capacity: u16 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to spawn thread: {0}")]
    Spawn(String),

    #[error("Engine already stopped")]
    AlreadyStopped,
}

impl CellError {
    /// Numeric actuator code carried by the error, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            CellError::Command { code, .. } | CellError::ActuatorFault { code, .. } => Some(*code),
            CellError::SafetyStop {
                reason: StopReason::Error { code },
                ..
            } => Some(*code),
            CellError::SafetyStop {
                reason: StopReason::TerminalState { state },
                ..
            } => Some(*state),
            _ => None,
        }
    }
}
