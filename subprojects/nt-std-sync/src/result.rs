/// Error returned by the non-blocking `try_*` lock methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryLockError {
    /// The lock could not be acquired without blocking.
    #[error("try_lock failed because the operation would block")]
    WouldBlock,
}

/// Result of a non-blocking lock attempt.
pub type TryLockResult<Guard> = Result<Guard, TryLockError>;
