//! Per-family lifecycle tracking.
//!
//! Every family the pipeline tries moves through
//! `Unscanned -> Detected(version) -> Initialized -> Applied`. Two terminal states end a
//! family early: [`FamilyState::NotDetected`] for a miss and
//! [`FamilyState::DetectedButUndecryptable`] when the family was recognized but its
//! payload could not be obtained. A family that fails with an error keeps the last state
//! it reached, and its [`FamilyReport`] carries the error message.

use std::fmt;

use crate::{deobfuscation::obfuscators::Family, Error, Result};

/// Where a family is in its detect, initialize, apply lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FamilyState {
    /// Not looked at yet
    #[default]
    Unscanned,
    /// The fingerprint matched. `None` means the version could not be classified.
    Detected(Option<String>),
    /// The payload was located and decoded
    Initialized,
    /// Rewrites have been performed
    Applied,
    /// The fingerprint did not match
    NotDetected,
    /// The fingerprint matched but the payload is unavailable
    DetectedButUndecryptable(String),
}

impl FamilyState {
    /// Returns true for states that end the family's processing.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FamilyState::Applied
                | FamilyState::NotDetected
                | FamilyState::DetectedButUndecryptable(_)
        )
    }

    /// Returns true once the fingerprint matched, whatever happened afterwards.
    #[must_use]
    pub fn is_detected(&self) -> bool {
        !matches!(self, FamilyState::Unscanned | FamilyState::NotDetected)
    }

    /// Move to `next`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Invariant`] for a transition the lifecycle does not allow.
    pub fn advance(&mut self, next: FamilyState) -> Result<()> {
        let allowed = matches!(
            (&*self, &next),
            (
                FamilyState::Unscanned,
                FamilyState::Detected(_) | FamilyState::NotDetected
            ) | (
                FamilyState::Detected(_),
                FamilyState::Initialized | FamilyState::DetectedButUndecryptable(_)
            ) | (
                FamilyState::Initialized,
                FamilyState::Applied | FamilyState::DetectedButUndecryptable(_)
            )
        );
        if !allowed {
            return Err(Error::Invariant(format!(
                "Illegal family state transition {self} -> {next}"
            )));
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for FamilyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FamilyState::Unscanned => f.write_str("unscanned"),
            FamilyState::Detected(Some(version)) => write!(f, "detected ({version})"),
            FamilyState::Detected(None) => f.write_str("detected (unknown version)"),
            FamilyState::Initialized => f.write_str("initialized"),
            FamilyState::Applied => f.write_str("applied"),
            FamilyState::NotDetected => f.write_str("not detected"),
            FamilyState::DetectedButUndecryptable(reason) => {
                write!(f, "detected, not decryptable: {reason}")
            }
        }
    }
}

/// Outcome of one family in a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyReport {
    /// The family
    pub family: Family,
    /// The last state reached
    pub state: FamilyState,
    /// Error that aborted the family, if any
    pub error: Option<String>,
}

impl FamilyReport {
    /// A report for a family that has not been scanned.
    #[must_use]
    pub fn new(family: Family) -> Self {
        FamilyReport {
            family,
            state: FamilyState::Unscanned,
            error: None,
        }
    }

    /// Returns true if the family finished without an error.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for FamilyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.family, self.state)?;
        if let Some(error) = &self.error {
            write!(f, " (error: {error})")?;
        }
        Ok(())
    }
}
