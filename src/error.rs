//! Error taxonomy for the LIC engine.
//!
//! Extent algebra never fails. Decomposition and transfer fail closed with
//! these errors; the integrator only surfaces failures of its core
//! convolution passes.

use crate::comm::Tag;

/// Failures of the rank-to-rank message layer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    #[error("rank {rank} is outside a world of {size} ranks")]
    InvalidRank { rank: usize, size: usize },

    #[error("rank {peer} disconnected")]
    Disconnected { peer: usize },

    #[error("timed out waiting for rank {peer} (tag {tag})")]
    Timeout { peer: usize, tag: Tag },

    #[error("transaction {id} does not fit the tag space")]
    TagOverflow { id: usize },

    #[error("unexpected payload from rank {peer} (tag {tag}): {reason}")]
    UnexpectedPayload {
        peer: usize,
        tag: Tag,
        reason: String,
    },
}

/// Centralized error type for decomposition, transfer and integration.
#[derive(thiserror::Error, Debug)]
pub enum LicError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("resource error in pass {pass}: {reason}")]
    Resource { pass: &'static str, reason: String },

    #[error("transfer {id} with rank {rank} failed: {source}")]
    Transfer {
        id: usize,
        rank: usize,
        #[source]
        source: CommError,
    },

    #[error("{stage} failed on another rank")]
    PeerFailed { stage: &'static str },

    #[error("communication error: {0}")]
    Comm(#[from] CommError),
}

impl LicError {
    pub fn config<T: ToString>(msg: T) -> Self {
        LicError::Config(msg.to_string())
    }

    pub fn resource<T: ToString>(pass: &'static str, reason: T) -> Self {
        LicError::Resource {
            pass,
            reason: reason.to_string(),
        }
    }

    pub fn transfer(id: usize, rank: usize, source: CommError) -> Self {
        LicError::Transfer { id, rank, source }
    }
}

pub type LicResult<T> = Result<T, LicError>;
