//! Crash injection at named points of the staging lifecycle.
//!
//! `staged` fires after the staging file is durably renamed and before it is
//! applied; `applied` fires after apply and before the staging file is
//! removed. In exit mode the process terminates on the spot. In abort mode
//! the operation returns [`StoreError::SimulatedCrash`] and leaves every file
//! as it was, which lets tests reopen the store and run recovery in-process.

use std::fmt;

use crate::error::{Result, StoreError};

/// Exit status of a simulated crash.
pub const CRASH_EXIT_CODE: i32 = 86;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Staged,
    Applied,
}

impl Checkpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staged => "staged",
            Self::Applied => "applied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "staged" => Some(Self::Staged),
            "applied" => Some(Self::Applied),
            _ => None,
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Exit,
    Abort,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrashHook {
    at: Option<(Checkpoint, Mode)>,
}

impl CrashHook {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Terminate the process when `point` is reached.
    pub fn exit_at(point: Checkpoint) -> Self {
        Self {
            at: Some((point, Mode::Exit)),
        }
    }

    /// Fail the operation with [`StoreError::SimulatedCrash`] at `point`.
    pub fn abort_at(point: Checkpoint) -> Self {
        Self {
            at: Some((point, Mode::Abort)),
        }
    }

    /// Build from a checkpoint name such as the `TMTP_CRASH_AT` setting.
    pub fn from_setting(value: Option<&str>) -> Self {
        match value.map(str::trim).filter(|v| !v.is_empty()) {
            None => Self::disabled(),
            Some(v) => match Checkpoint::parse(v) {
                Some(point) => Self::exit_at(point),
                None => {
                    tracing::warn!(value = v, "unknown crash checkpoint, hook disabled");
                    Self::disabled()
                }
            },
        }
    }

    pub fn is_armed(&self) -> bool {
        self.at.is_some()
    }

    pub fn check(&self, point: Checkpoint, staging_name: &str) -> Result<()> {
        match self.at {
            Some((at, mode)) if at == point => {
                tracing::warn!(checkpoint = %point, file = staging_name, "simulated crash");
                match mode {
                    Mode::Exit => std::process::exit(CRASH_EXIT_CODE),
                    Mode::Abort => Err(StoreError::SimulatedCrash(point.as_str())),
                }
            }
            _ => Ok(()),
        }
    }
}
