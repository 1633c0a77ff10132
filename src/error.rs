//! Error taxonomy for the reconstruction engine.
//!
//! Three failure classes exist: precondition violations (shape or
//! configuration mismatches, raised before any work is submitted),
//! primitive execution failures (kernel or stream faults, propagated
//! uncaught to the caller), and write failures (surfaced after every
//! write worker has joined). No stage catches and suppresses errors.

use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

/// Errors produced by the back-projection engine.
#[derive(Debug, Error)]
pub enum LamError {
    /// Rejected configuration (from `LamConfig::validate`).
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Buffer shape does not match the negotiated geometry. Fatal; raised
    /// before any stream work is submitted.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    /// A transform primitive failed. Propagates through the per-step
    /// stream barrier with no stage-level recovery.
    #[error("kernel `{kernel}` failed: {message}")]
    Kernel {
        kernel: &'static str,
        message: String,
    },
    /// Execution stream fault (worker gone, queue closed, poisoned lock).
    #[error("stream fault: {0}")]
    Stream(String),
    /// A write worker failed. Carries the chunk ordinal and the global
    /// slice range that could not be written.
    #[error("write of chunk {ordinal} (slices {start}..{end}) failed: {message}")]
    Write {
        ordinal: usize,
        start: usize,
        end: usize,
        message: String,
    },
}

impl LamError {
    /// Shorthand for a shape mismatch from ndarray `.dim()` tuples.
    pub(crate) fn shape(
        context: &'static str,
        expected: &[usize],
        actual: &[usize],
    ) -> Self {
        LamError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

/// Lock a mutex, converting poisoning into a stream fault instead of
/// panicking.
pub(crate) fn lock_mutex<'a, T>(
    mutex: &'a Mutex<T>,
    what: &'static str,
) -> Result<MutexGuard<'a, T>, LamError> {
    mutex
        .lock()
        .map_err(|_| LamError::Stream(format!("mutex poisoned: {what}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LamError::shape("dev_proj slot", &[8, 64, 64], &[8, 64, 32]);
        let msg = format!("{err}");
        assert!(msg.contains("dev_proj slot"));
        assert!(msg.contains("[8, 64, 64]"));
        assert!(msg.contains("[8, 64, 32]"));

        let err = LamError::Write {
            ordinal: 3,
            start: 12,
            end: 16,
            message: "disk full".to_string(),
        };
        assert!(format!("{err}").contains("chunk 3"));
    }

    #[test]
    fn test_lock_mutex_ok() {
        let m = Mutex::new(5u32);
        let guard = lock_mutex(&m, "counter").unwrap();
        assert_eq!(*guard, 5);
    }

    #[test]
    fn test_lock_mutex_poisoned() {
        let m = std::sync::Arc::new(Mutex::new(0u32));
        let m2 = std::sync::Arc::clone(&m);
        let _ = std::thread::spawn(move || {
            let _guard = m2.lock().unwrap();
            panic!("poison it");
        })
        .join();
        let result = lock_mutex(&m, "counter");
        match result {
            Err(LamError::Stream(msg)) => assert!(msg.contains("counter")),
            other => panic!("expected stream fault, got {other:?}"),
        }
    }
}
