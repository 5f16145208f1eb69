//! Process halt for unrecoverable storage failures.
//!
//! Once a write, rename or fsync fails unexpectedly the files under a
//! service may be half-updated, and only startup recovery can bring them
//! back to a consistent state. Callers at the dispatch layer route fatal
//! errors through [`halt`] rather than carrying on.

use std::backtrace::Backtrace;

use crate::error::{Result, StoreError};

/// Exit status used when the store halts the process.
pub const HALT_EXIT_CODE: i32 = 70;

/// Log the error with a backtrace and terminate the process.
pub fn halt(context: &str, err: &StoreError) -> ! {
    let trace = Backtrace::force_capture();
    tracing::error!(context, error = %err, "fatal store error, halting");
    tracing::error!("{trace}");
    std::process::exit(HALT_EXIT_CODE)
}

/// Halt on fatal errors and hand everything else back to the caller.
pub trait OrHalt<T> {
    fn or_halt(self, context: &str) -> Result<T>;
}

impl<T> OrHalt<T> for Result<T> {
    fn or_halt(self, context: &str) -> Result<T> {
        match self {
            Err(err) if err.is_fatal() => halt(context, &err),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_fatal_errors_pass_through() {
        let res: Result<()> = Err(StoreError::NotFound("t1".into()));
        assert!(matches!(res.or_halt("test"), Err(StoreError::NotFound(_))));

        let ok: Result<u8> = Ok(7);
        assert_eq!(ok.or_halt("test").unwrap(), 7);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(StoreError::CorruptTrailer("x".into()).is_fatal());
        assert!(!StoreError::Renamed("x".into()).is_fatal());
        assert!(!StoreError::SimulatedCrash("staged").is_fatal());
    }
}
