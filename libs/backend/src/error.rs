/// A deliberately narrow error type for [`crate::Backend`] operations.
///
/// Backends report a boolean-ish outcome plus a [`crate::StatusBits`]
/// bit-field in the happy path; this type is reserved for the cases that
/// cannot be expressed as a status bit: transport failures, cancellation,
/// and content mismatches caught by the backend itself (as opposed to the
/// frontend's own MD5 check against the catalog).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("transport error talking to backend: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("integrity mismatch for {key}: expected md5 {expected}, got {actual}")]
    IntegrityMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("backend reported out of space")]
    Enospc,
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transport(_))
    }
}

/// A short, grep-able rendering used in retry log lines.
impl BackendError {
    pub fn kind_str(&self) -> &'static str {
        match self {
            BackendError::NotFound(_) => "not_found",
            BackendError::Transport(_) => "transport",
            BackendError::IntegrityMismatch { .. } => "integrity",
            BackendError::Cancelled => "cancelled",
            BackendError::Enospc => "enospc",
        }
    }
}
