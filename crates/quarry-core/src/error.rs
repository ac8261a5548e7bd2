use thiserror::Error;

/// Error surface of the engine, observable at the API boundary.
///
/// Internal filesystem and serialization failures are wrapped in `Io` /
/// `Serialization` with the table or partition identifier in the message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("schema: {0}")]
    Schema(String),
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("table already exists: {0}")]
    TableExists(String),
    #[error("partition not found: {0}")]
    PartitionNotFound(String),
    #[error("partition already exists: {0}")]
    PartitionExists(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("plan error: {0}")]
    Plan(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[error("coordination error: {0}")]
    Coordination(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("io: {0}")]
    Io(String),
    #[error("serialization: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
