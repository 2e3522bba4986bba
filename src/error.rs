use std::fmt;

use thiserror::Error;

/// Closed set of error kinds surfaced across the public API boundary.
///
/// The numeric comments on a few variants are the wire status codes the
/// kind is derived from; they are not part of the Rust API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unknown,
    QuotaExceeded,
    DeviceMessageLockLost,
    DeviceNotFound,
    NetworkErrors,
    Suspended,
    PreconditionFailed,
    MessageTooLarge,
    ServerBusy,
    ServerError,
    Unauthorized,
    TlsAuthenticationError,
    /// 408
    Timeout,
    /// 429
    Throttled,
    /// 400004
    ArgumentInvalid,
}

impl ErrorKind {
    /// Whether an operation that failed with this kind is worth retrying.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkErrors
                | ErrorKind::ServerBusy
                | ErrorKind::ServerError
                | ErrorKind::Timeout
                | ErrorKind::Throttled
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Unknown => "Unknown",
            ErrorKind::QuotaExceeded => "QuotaExceeded",
            ErrorKind::DeviceMessageLockLost => "DeviceMessageLockLost",
            ErrorKind::DeviceNotFound => "DeviceNotFound",
            ErrorKind::NetworkErrors => "NetworkErrors",
            ErrorKind::Suspended => "Suspended",
            ErrorKind::PreconditionFailed => "PreconditionFailed",
            ErrorKind::MessageTooLarge => "MessageTooLarge",
            ErrorKind::ServerBusy => "ServerBusy",
            ErrorKind::ServerError => "ServerError",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::TlsAuthenticationError => "TlsAuthenticationError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Throttled => "Throttled",
            ErrorKind::ArgumentInvalid => "ArgumentInvalid",
        };
        f.write_str(s)
    }
}

/// An error crossing the public API boundary.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct SdkError {
    pub kind: ErrorKind,
    pub message: String,
    pub tracking_id: Option<String>,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl SdkError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            tracking_id: None,
            source: None,
        }
    }

    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_tracking_id(mut self, tracking_id: impl Into<String>) -> Self {
        self.tracking_id = Some(tracking_id.into());
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Maps a server-reported numeric status code onto a kind, falling back
    /// to `Unknown` for anything not explicitly recognised. Used to
    /// classify twin-response and method-response error bodies.
    pub fn kind_from_status(status: u32) -> ErrorKind {
        match status {
            400 => ErrorKind::Unknown,
            400_004 => ErrorKind::ArgumentInvalid,
            404 => ErrorKind::DeviceNotFound,
            408 => ErrorKind::Timeout,
            412 => ErrorKind::PreconditionFailed,
            403 => ErrorKind::QuotaExceeded,
            413 => ErrorKind::MessageTooLarge,
            423 => ErrorKind::DeviceMessageLockLost,
            429 => ErrorKind::Throttled,
            503 => ErrorKind::ServerBusy,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, SdkError>;
