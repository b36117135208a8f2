use eventpipe_kafka::BrokerError;
use eventpipe_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// A dependency was unreachable at startup; the process should exit non-zero
    #[error("Fatal startup error: {component} unavailable: {reason}")]
    FatalStartup { component: &'static str, reason: String },

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
