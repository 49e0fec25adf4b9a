use thiserror::Error;

/// Convenience alias for `Result<T, HeronError>`.
pub type HeronResult<T> = Result<T, HeronError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   — malformed input, missing entity, constraint violation (4xx equivalent)
/// - `Retryable`   — busy cursor, revision conflict; caller SHOULD retry or reconcile
/// - `Transient`   — cluster timeout, lost connection; caller MAY retry after back-off
/// - `InternalBug` — should never happen; logged with full context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error type for the storage core.
///
/// Every variant carries a stable integer code (`code()`) that survives
/// serialization across the wire, plus a free-text message where useful.
#[derive(Error, Debug, Clone)]
pub enum HeronError {
    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("corrupted JSON: {0}")]
    CorruptedJson(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cursor not found")]
    CursorNotFound,

    #[error("cursor busy")]
    CursorBusy,

    #[error("duplicate name: {0}")]
    DuplicateName(String),

    #[error("unique constraint violated: {0}")]
    UniqueConstraintViolated(String),

    #[error("conflict: revision mismatch on '{0}'")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("must not specify a value for one of the sharding attributes")]
    ShardingAttributesMissing,

    #[error("timeout within cluster")]
    ClusterTimeout,

    #[error("lost connection within cluster")]
    ConnectionLost,

    #[error("data corrupted: {0}")]
    Corrupted(String),

    #[error("shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("not yet implemented: {0}")]
    NotYetImplemented(&'static str),
}

impl HeronError {
    /// Stable integer code reported to clients. These follow the numbering
    /// the replication protocol was built against and must not change.
    pub fn code(&self) -> u32 {
        match self {
            HeronError::BadParameter(_) => 400,
            HeronError::CorruptedJson(_) => 600,
            HeronError::NotFound(_) => 1202,
            HeronError::CursorNotFound => 1600,
            HeronError::CursorBusy => 1601,
            HeronError::DuplicateName(_) => 1207,
            HeronError::UniqueConstraintViolated(_) => 1210,
            HeronError::Conflict(_) => 1200,
            HeronError::Forbidden(_) => 11,
            HeronError::ShardingAttributesMissing => 1581,
            HeronError::ClusterTimeout => 1457,
            HeronError::ConnectionLost => 1458,
            HeronError::Corrupted(_) => 1104,
            HeronError::ShuttingDown => 30,
            HeronError::Internal(_) => 4,
            HeronError::NotYetImplemented(_) => 9,
        }
    }

    /// HTTP status class the external REST adapter should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            HeronError::BadParameter(_) | HeronError::CorruptedJson(_) => 400,
            HeronError::NotFound(_) | HeronError::CursorNotFound => 404,
            HeronError::CursorBusy => 409,
            HeronError::DuplicateName(_)
            | HeronError::UniqueConstraintViolated(_)
            | HeronError::Conflict(_) => 409,
            HeronError::Forbidden(_) => 403,
            HeronError::ShardingAttributesMissing => 400,
            HeronError::ClusterTimeout | HeronError::ConnectionLost => 502,
            HeronError::ShuttingDown => 503,
            HeronError::Corrupted(_)
            | HeronError::Internal(_)
            | HeronError::NotYetImplemented(_) => 500,
        }
    }

    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HeronError::BadParameter(_)
            | HeronError::CorruptedJson(_)
            | HeronError::NotFound(_)
            | HeronError::CursorNotFound
            | HeronError::DuplicateName(_)
            | HeronError::UniqueConstraintViolated(_)
            | HeronError::Forbidden(_)
            | HeronError::ShardingAttributesMissing => ErrorKind::UserError,

            HeronError::CursorBusy | HeronError::Conflict(_) => ErrorKind::Retryable,

            HeronError::ClusterTimeout
            | HeronError::ConnectionLost
            | HeronError::ShuttingDown => ErrorKind::Transient,

            HeronError::Corrupted(_)
            | HeronError::Internal(_)
            | HeronError::NotYetImplemented(_) => ErrorKind::InternalBug,
        }
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HeronError::NotFound(_) | HeronError::CursorNotFound)
    }

    /// Prepend a context string to the error message, preserving the variant
    /// (and thereby the stable code) wherever the variant carries a message.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            HeronError::BadParameter(m) => HeronError::BadParameter(format!("{ctx}: {m}")),
            HeronError::CorruptedJson(m) => HeronError::CorruptedJson(format!("{ctx}: {m}")),
            HeronError::NotFound(m) => HeronError::NotFound(format!("{ctx}: {m}")),
            HeronError::DuplicateName(m) => HeronError::DuplicateName(format!("{ctx}: {m}")),
            HeronError::UniqueConstraintViolated(m) => {
                HeronError::UniqueConstraintViolated(format!("{ctx}: {m}"))
            }
            HeronError::Conflict(m) => HeronError::Conflict(format!("{ctx}: {m}")),
            HeronError::Forbidden(m) => HeronError::Forbidden(format!("{ctx}: {m}")),
            HeronError::Corrupted(m) => HeronError::Corrupted(format!("{ctx}: {m}")),
            HeronError::Internal(m) => HeronError::Internal(format!("{ctx}: {m}")),
            other => other,
        }
    }

    /// Emit a structured log entry for internal-bug class errors. Call before
    /// handing such an error back to a client.
    pub fn log_if_internal(&self) {
        if self.kind() == ErrorKind::InternalBug {
            tracing::error!(code = self.code(), error = %self, "internal error surfaced");
        }
    }
}

impl From<std::io::Error> for HeronError {
    fn from(e: std::io::Error) -> Self {
        HeronError::Internal(format!("io error: {e}"))
    }
}

/// Add context to a `Result`, preserving the error classification.
/// Usage: `store.get(&key).ctx("counter sync")?`
pub trait ErrorContext<T> {
    fn ctx(self, context: &str) -> HeronResult<T>;
    fn ctx_with(self, f: impl FnOnce() -> String) -> HeronResult<T>;
}

impl<T, E: Into<HeronError>> ErrorContext<T> for Result<T, E> {
    fn ctx(self, context: &str) -> HeronResult<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn ctx_with(self, f: impl FnOnce() -> String) -> HeronResult<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}
