use thiserror::Error;

/// Errors surfaced by the fuzzing engine's library surface.
///
/// EVM-level reverts and traps are *not* represented here -- they are
/// recorded as data (`uniqueExceptions`, synthesized oracle events) and
/// never stop the fuzz loop. Only configuration, format, and persistence
/// failures are errors.
#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("malformed source map row {0}: no predecessor to inherit from")]
    SourceMap(usize),

    #[error("invalid hex in bytecode/testcase: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("unknown library placeholder: {0}")]
    UnknownLibrary(String),

    #[error("missing persisted state file for fuzz mode: {0}")]
    MissingWeightFile(String),

    #[error("invalid ABI descriptor: {0}")]
    Abi(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FuzzError>;
