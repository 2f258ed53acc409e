// src/errors.rs

use crate::types::conversions::ConversionError;

/// Failure taxonomy shared by every refresh path.
///
/// The enum is `Clone` so a single in-flight refresh can hand the same
/// outcome to every caller that joined it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FarmError {
    /// Pool storage matched a protocol shape but was missing fields for it.
    /// The farm is flagged errant and retried on the next pass.
    #[error("classification failed for {subject}: {reason}")]
    Classification { subject: String, reason: String },

    /// Indexer, price feed or pool feed call failed. Previous state is kept.
    #[error("upstream fetch failed ({origin}): {message}")]
    Upstream {
        origin: &'static str,
        message: String,
    },

    /// Token metadata lookup failed; callers fall back to the placeholder.
    #[error("metadata resolution failed for {token}: {message}")]
    Metadata { token: String, message: String },

    #[error("degenerate arithmetic: {0}")]
    Degenerate(String),

    #[error("unknown farm {0}")]
    UnknownFarm(String),

    #[error("no wallet connected")]
    WalletNotConnected,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl FarmError {
    pub fn upstream(origin: &'static str, err: impl std::fmt::Display) -> Self {
        FarmError::Upstream {
            origin,
            message: err.to_string(),
        }
    }

    pub fn classification(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        FarmError::Classification {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    /// Short label used for metrics and log grouping.
    pub fn kind(&self) -> &'static str {
        match self {
            FarmError::Classification { .. } => "classification",
            FarmError::Upstream { .. } => "upstream",
            FarmError::Metadata { .. } => "metadata",
            FarmError::Degenerate(_) => "degenerate",
            FarmError::UnknownFarm(_) => "unknown_farm",
            FarmError::WalletNotConnected => "wallet",
            FarmError::InvalidPayload(_) => "payload",
        }
    }
}

impl From<ConversionError> for FarmError {
    fn from(err: ConversionError) -> Self {
        FarmError::InvalidPayload(err.to_string())
    }
}

impl From<reqwest::Error> for FarmError {
    fn from(err: reqwest::Error) -> Self {
        FarmError::upstream("http", err)
    }
}

impl From<serde_json::Error> for FarmError {
    fn from(err: serde_json::Error) -> Self {
        FarmError::InvalidPayload(err.to_string())
    }
}

pub type FarmResult<T> = Result<T, FarmError>;
