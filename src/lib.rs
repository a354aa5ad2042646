pub mod actuator;
pub mod capture;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod error;
pub mod led_ring;

pub use error::{EdgeError, Result};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex shared with driver threads. A panic on the other side must
/// not take the control loop down with it, so poisoning is ignored.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
