//! Policies deciding which errors count against a dependency.

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;

use crate::error::{find_in_chain, DbError, RemoteError};

/// Predicate deciding whether an operation error counts toward the failure window.
pub type FailurePredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync + 'static>;

/// Default failure classification.
///
/// The breaker should only react to the dependency being unhealthy, not to the
/// caller sending something wrong. Walking the error's `source()` chain, the
/// following do not count:
///
/// - a [`RemoteError`] reporting invalid input, a rate limit, or a 4xx status
///   other than 408,
/// - a [`DbError`] in SQLSTATE class 22 (data exception) or 23 (integrity
///   constraint violation),
/// - an [`io::Error`] of kind `InvalidInput` or `InvalidData`.
///
/// Everything else counts, including network errors and 5xx responses.
pub fn default_is_failure<E>(error: &E) -> bool
where
    E: StdError + 'static,
{
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(e) = current {
        if let Some(remote) = e.downcast_ref::<RemoteError>() {
            if remote.is_caller_fault() {
                return false;
            }
        } else if let Some(db) = e.downcast_ref::<DbError>() {
            if db.is_caller_fault() {
                return false;
            }
        } else if let Some(io) = e.downcast_ref::<io::Error>() {
            if matches!(
                io.kind(),
                io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData
            ) {
                return false;
            }
        }
        current = e.source();
    }
    true
}

/// Returns true if `error` or any of its sources is a database error that is
/// safe to retry in a fresh transaction.
pub fn is_retryable_db_error(error: &(dyn StdError + 'static)) -> bool {
    find_in_chain::<DbError>(error).is_some_and(DbError::is_retryable)
}
