use thiserror::Error;

/// Errors crossing the chain-reader boundary. The pipeline branches on the
/// variant: transient failures and timeouts abort the current step with the
/// watermark unadvanced, while a missing contract capability only skips the
/// step for that token.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("rpc call timed out after {0}s")]
    Timeout(u64),

    #[error("contract {address} does not implement {method}")]
    MissingCapability { address: String, method: String },
}

impl ChainError {
    /// True when retrying on a later run can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Rpc(_) | ChainError::Timeout(_))
    }
}

pub type ChainResult<T> = Result<T, ChainError>;
