//! Upload transport seam and response classification.

use serde::{Deserialize, Serialize};

/// What the transport reported for one payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UploadStatus {
    Success,
    /// 4xx other than rate limiting and authentication.
    ClientError(u16),
    /// 408 or 429.
    RateLimited(u16),
    /// 5xx.
    ServerError(u16),
    /// The request never produced a response.
    NetworkError(String),
    /// 401 or 403.
    InvalidToken(u16),
    /// Any other code.
    Unknown(u16),
}

/// What happens to the batch after an upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadOutcome {
    /// Delivered; delete the batch.
    Success,
    /// Keep the batch for a later attempt.
    Retry,
    /// Rejected permanently; delete the batch without retrying.
    TerminalFailure,
}

impl UploadStatus {
    /// Classify an HTTP response code.
    pub fn from_http_code(code: u16) -> Self {
        match code {
            200..=299 => UploadStatus::Success,
            408 | 429 => UploadStatus::RateLimited(code),
            401 | 403 => UploadStatus::InvalidToken(code),
            400..=499 => UploadStatus::ClientError(code),
            500..=599 => UploadStatus::ServerError(code),
            _ => UploadStatus::Unknown(code),
        }
    }

    pub fn outcome(&self) -> UploadOutcome {
        match self {
            UploadStatus::Success => UploadOutcome::Success,
            UploadStatus::RateLimited(_)
            | UploadStatus::ServerError(_)
            | UploadStatus::NetworkError(_) => UploadOutcome::Retry,
            UploadStatus::ClientError(_)
            | UploadStatus::InvalidToken(_)
            | UploadStatus::Unknown(_) => UploadOutcome::TerminalFailure,
        }
    }

    /// HTTP code, when there was a response.
    pub fn code(&self) -> Option<u16> {
        match self {
            UploadStatus::Success | UploadStatus::NetworkError(_) => None,
            UploadStatus::ClientError(code)
            | UploadStatus::RateLimited(code)
            | UploadStatus::ServerError(code)
            | UploadStatus::InvalidToken(code)
            | UploadStatus::Unknown(code) => Some(*code),
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadStatus::Success => write!(f, "success"),
            UploadStatus::ClientError(code) => write!(f, "client error ({})", code),
            UploadStatus::RateLimited(code) => write!(f, "rate limited ({})", code),
            UploadStatus::ServerError(code) => write!(f, "server error ({})", code),
            UploadStatus::NetworkError(msg) => write!(f, "network error: {}", msg),
            UploadStatus::InvalidToken(code) => write!(f, "invalid token ({})", code),
            UploadStatus::Unknown(code) => write!(f, "unknown status ({})", code),
        }
    }
}

/// Sends one decorated batch payload to the collection endpoint.
///
/// Timeouts and transport errors are the implementation's concern; they come
/// back as [`UploadStatus::NetworkError`].
pub trait Uploader: Send + Sync {
    fn upload(&self, payload: &[u8]) -> UploadStatus;
}

/// Inert uploader. Nothing is sent and every batch is kept.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpUploader;

impl Uploader for NoOpUploader {
    fn upload(&self, _payload: &[u8]) -> UploadStatus {
        UploadStatus::NetworkError("uploads disabled".to_string())
    }
}
