/// Failure modes of the object-store operations.
///
/// The mirror treats `BucketNotFound` and `AccessDenied` as unrecoverable:
/// the operator has to fix credentials or configuration. Everything else is
/// either expected (`NotFound`) or transient.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object does not exist.
    #[error("no such object")]
    NotFound,
    /// The configured bucket does not exist.
    #[error("no such bucket")]
    BucketNotFound,
    /// The credentials in use are not allowed to perform the operation.
    #[error("access denied")]
    AccessDenied,
    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,
    /// The per-request timeout elapsed before a response arrived.
    #[error("operation timed out")]
    Timeout,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    /// Errors that retrying cannot fix; the caller should shut down and
    /// surface the problem to the operator.
    pub fn is_permanent(&self) -> bool {
        matches!(self, StoreError::BucketNotFound | StoreError::AccessDenied)
    }
}
