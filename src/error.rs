use thiserror::Error;

/// Failures of the durable credential store. These are the only errors that
/// should abort request processing: continuing with inconsistent credential
/// state could falsely grant or deny access.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// For host-provided store/directory implementations backed by something
    /// other than the bundled Postgres layer.
    #[error("credential store unavailable: {0}")]
    Backend(String),
}

/// Authentication/authorization outcomes. Everything except `Storage` is a
/// routine, expected result that the request boundary turns into a client
/// rejection — never a crash.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Malformed structure, bad signature, or unparsable payload.
    #[error("invalid token")]
    InvalidToken,
    /// Structurally valid and correctly signed, but past its `exp`.
    #[error("token expired")]
    TokenExpired,
    /// No recognized credential was presented, or all presented ones failed.
    #[error("not authenticated")]
    Unauthenticated,
    /// Credential was valid but the permission engine denied the action.
    #[error("insufficient permission")]
    InsufficientPermission,
    #[error(transparent)]
    Storage(#[from] StoreError),
}
