//! Error taxonomy.
//!
//! Every error type here is an ordinary enum with a hand-written
//! `Display` and `std::error::Error` impl rather than a `thiserror`
//! derive, matching the rest of this crate's conventions.

use std::fmt;

/// Errors from the low-level coinbase/varint primitives in
/// `template_creator`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoinbaseError {
    InvalidBlockTemplateData,
    ConsensusDecodeError,
}

impl fmt::Display for CoinbaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinbaseError::InvalidBlockTemplateData => write!(f, "invalid block template data"),
            CoinbaseError::ConsensusDecodeError => write!(f, "failed to consensus-decode transaction"),
        }
    }
}

impl std::error::Error for CoinbaseError {}

/// Errors on the `mining.submit` hot path. Each variant maps to a
/// Stratum JSON-RPC rejection message for the downstream miner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    BadExtranonce2Size { expected: usize, got: usize },
    BadNtimeSize { expected: usize, got: usize },
    BadNonceSize { expected: usize, got: usize },
    JobNotFound { job_id: String },
    NtimeOutOfRange,
    DuplicateShare,
    AboveTarget,
    RiecoinBelowTarget,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::BadExtranonce2Size { expected, got } => {
                write!(f, "Incorrect size of extranonce2: expected {expected}, got {got}")
            }
            SubmitError::BadNtimeSize { expected, got } => {
                write!(f, "Incorrect size of ntime: expected {expected}, got {got}")
            }
            SubmitError::BadNonceSize { expected, got } => {
                write!(f, "Incorrect size of nonce: expected {expected}, got {got}")
            }
            SubmitError::JobNotFound { job_id } => write!(f, "Job '{job_id}' not found"),
            SubmitError::NtimeOutOfRange => write!(f, "Ntime out of range"),
            SubmitError::DuplicateShare => write!(f, "Duplicate share"),
            SubmitError::AboveTarget => write!(f, "Share is above target"),
            SubmitError::RiecoinBelowTarget => write!(f, "Share does not meet target"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Errors on the `update_block` refresh path. These are absorbed by the
/// registry (logged, guard cleared) rather than propagated to miners.
#[derive(Debug)]
pub enum RegistryError {
    Rpc(crate::rpc::RpcError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Rpc(e) => write!(f, "upstream rpc error: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<crate::rpc::RpcError> for RegistryError {
    fn from(e: crate::rpc::RpcError) -> Self {
        RegistryError::Rpc(e)
    }
}

/// Errors surfaced while handling a Stratum wire message from a
/// downstream connection, distinct from share-submission errors (which
/// use [`SubmitError`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StratumErrors {
    InvalidMethod { method: String },
    InvalidMethodParams { method: String },
    ParamNotFound { param: String, method: String },
    NotSubscribed,
    NotAuthorized,
    /// A syntactically valid `mining.submit` was rejected by
    /// `TemplateRegistry::submit_share`; `reason` is the underlying
    /// `SubmitError`'s message.
    ShareRejected { reason: String },
}

impl fmt::Display for StratumErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StratumErrors::InvalidMethod { method } => write!(f, "invalid method: {method}"),
            StratumErrors::InvalidMethodParams { method } => {
                write!(f, "invalid params for method: {method}")
            }
            StratumErrors::ParamNotFound { param, method } => {
                write!(f, "param '{param}' not found for method '{method}'")
            }
            StratumErrors::NotSubscribed => write!(f, "client has not subscribed"),
            StratumErrors::NotAuthorized => write!(f, "client has not authorized"),
            StratumErrors::ShareRejected { reason } => write!(f, "{reason}"),
        }
    }
}

impl std::error::Error for StratumErrors {}

impl From<SubmitError> for StratumErrors {
    fn from(e: SubmitError) -> Self {
        StratumErrors::ShareRejected {
            reason: e.to_string(),
        }
    }
}
