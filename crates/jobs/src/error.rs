use thiserror::Error;

/// Errors that can occur in the batch-job layer.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("result channel closed")]
    ChannelClosed,
}
