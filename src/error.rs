use thiserror::Error;

use crate::signals::Check;

pub const INVALID_TOKEN: &str = "Invalid or expired token";
pub const LINK_NOT_FOUND: &str = "Link not found";
pub const TOO_SUSPICIOUS: &str = "Too many suspicious indicators detected";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Token,
    Link,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("{0:?} not found")]
    NotFound(Subject),

    #[error("token expired")]
    Expired,

    #[error("token already used")]
    AlreadyUsed,

    #[error("token is bound to another link")]
    LinkMismatch,

    #[error("link is inactive")]
    LinkInactive,

    #[error("critical check failed: {0}")]
    CriticalCheckFailed(Check),

    #[error("suspicion score {score} over threshold")]
    SuspicionThresholdExceeded { score: u32 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

pub type GateResult<T> = Result<T, GateError>;

impl GateError {
    /// Message safe to show the requester. Token-side failures share one text
    /// so a prober cannot tell unknown, used, expired and foreign tokens apart.
    pub fn public_reason(&self) -> String {
        match self {
            GateError::NotFound(Subject::Token)
            | GateError::Expired
            | GateError::AlreadyUsed
            | GateError::LinkMismatch => INVALID_TOKEN.to_string(),
            GateError::NotFound(Subject::Link) | GateError::LinkInactive => {
                LINK_NOT_FOUND.to_string()
            }
            GateError::CriticalCheckFailed(check) => {
                format!("Critical security check failed: {check}")
            }
            GateError::SuspicionThresholdExceeded { .. } => TOO_SUSPICIOUS.to_string(),
            GateError::InvalidInput(msg) => msg.clone(),
            GateError::StorageUnavailable(_) => "Validation failed".to_string(),
        }
    }

    /// Denials are decisions and get an access-log row; the rest are failures.
    pub fn is_denial(&self) -> bool {
        !matches!(
            self,
            GateError::StorageUnavailable(_) | GateError::InvalidInput(_)
        )
    }

    /// Stable tag for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::NotFound(Subject::Token) => "token_not_found",
            GateError::NotFound(Subject::Link) => "link_not_found",
            GateError::Expired => "expired",
            GateError::AlreadyUsed => "already_used",
            GateError::LinkMismatch => "link_mismatch",
            GateError::LinkInactive => "link_inactive",
            GateError::CriticalCheckFailed(_) => "critical_check_failed",
            GateError::SuspicionThresholdExceeded { .. } => "suspicion_threshold_exceeded",
            GateError::InvalidInput(_) => "invalid_input",
            GateError::StorageUnavailable(_) => "storage_unavailable",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            GateError::NotFound(Subject::Link) | GateError::LinkInactive => 404,
            GateError::InvalidInput(_) => 400,
            GateError::StorageUnavailable(_) => 500,
            _ => 403,
        }
    }
}

pub(crate) fn storage_err<E: std::fmt::Display>(context: &'static str) -> impl Fn(E) -> GateError {
    move |e| GateError::StorageUnavailable(format!("{context}: {e}"))
}
