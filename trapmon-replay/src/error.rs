use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("io error reading/writing the record/replay log: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed log entry: {0}")]
    Malformed(String),

    #[error("expected log tag {expected} but found {found}")]
    UnexpectedTag { expected: &'static str, found: String },

    #[error("replay log n_exec {logged:#x} is behind the guest's current n_exec {current:#x}")]
    NExecSkew { logged: u64, current: u64 },

    #[error("RAM mismatch at offset {offset:#x}: expected {expected:#04x}, found {actual:#04x}")]
    RamMismatch { offset: usize, expected: u8, actual: u8 },

    #[error("RAM length mismatch: log holds {logged} bytes, guest has {actual}")]
    RamLengthMismatch { logged: usize, actual: usize },
}

pub type Result<T> = core::result::Result<T, ReplayError>;
