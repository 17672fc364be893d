//! Lock error handling utilities
//!
//! Node slots and the node arena are guarded by `RwLock`s; a panic while one
//! of them is held poisons it. These helpers turn the poison into an `MdBoxError`
//! so callers can propagate it with `?`.

use crate::core::common::MdBoxError;
use std::sync::{MutexGuard, PoisonError, RwLockReadGuard, RwLockWriteGuard};

/// Convert a poisoned mutex error to MdBoxError with a generic message
pub fn lock_poisoned<T>(_: PoisonError<MutexGuard<'_, T>>) -> MdBoxError {
    MdBoxError::Lock("Mutex poisoned".to_string())
}

/// Convert a poisoned read lock error to MdBoxError
pub fn read_lock_poisoned<T>(_: PoisonError<RwLockReadGuard<'_, T>>) -> MdBoxError {
    MdBoxError::Lock("Failed to acquire read lock".to_string())
}

/// Convert a poisoned write lock error to MdBoxError
pub fn write_lock_poisoned<T>(_: PoisonError<RwLockWriteGuard<'_, T>>) -> MdBoxError {
    MdBoxError::Lock("Failed to acquire write lock".to_string())
}

/// Convert a poisoned write lock error with context
pub fn write_lock_poisoned_with_context<T>(
    context: &str,
) -> impl Fn(PoisonError<RwLockWriteGuard<'_, T>>) -> MdBoxError + '_ {
    move |_| MdBoxError::Lock(format!("Failed to acquire write lock: {}", context))
}
