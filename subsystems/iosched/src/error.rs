//! # Error Handling
//!
//! Errors raised by the elevator framework and its policies.
//!
//! ## Error Categories
//!
//! | Category | Example | Handling |
//! |----------|---------|----------|
//! | Resource | descriptor arena full | refuse, caller retries |
//! | Invariant | dispatch from an empty queue | fatal abort |
//! | Policy init | unknown or failing elevator | fall back to default |
//! | Tunable | non-numeric value written | rejected, old value kept |
//!
//! None of these reach the submitter of the I/O: from the outside a request
//! either eventually dispatches or is failed by the driver.

use core::fmt;

// =============================================================================
// ERROR TYPE
// =============================================================================

/// Result type for elevator operations
pub type IoSchedResult<T> = Result<T, IoSchedError>;

/// Recoverable elevator errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoSchedError {
    /// Out of descriptors or policy memory, retry later
    Exhausted,
    /// No elevator registered under the requested name
    UnknownElevator,
    /// Elevator constructor refused to initialize
    InitFailed,
    /// Elevator with this name is already registered
    AlreadyRegistered,
    /// No tunable with this name on the active elevator
    UnknownTunable,
    /// Tunable write was not a decimal integer
    InvalidTunableValue,
    /// Handle refers to a freed descriptor
    StaleHandle,
    /// Operation not possible in the current state
    Busy,
}

impl IoSchedError {
    /// Whether the caller should simply retry the operation
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Exhausted | Self::Busy)
    }
}

impl fmt::Display for IoSchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Exhausted => "resource exhausted, retry",
            Self::UnknownElevator => "unknown elevator",
            Self::InitFailed => "elevator initialization failed",
            Self::AlreadyRegistered => "elevator already registered",
            Self::UnknownTunable => "unknown tunable",
            Self::InvalidTunableValue => "invalid tunable value",
            Self::StaleHandle => "stale request handle",
            Self::Busy => "queue busy",
        };
        f.write_str(msg)
    }
}

// =============================================================================
// INVARIANT VIOLATIONS
// =============================================================================

/// Internal consistency failures.
///
/// In production these abort through [`bug_on!`](crate::bug_on). The
/// `check_invariants` methods on the queue structures report them as values
/// so tests can assert on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvariantViolation {
    /// Dispatch was requested from a queue with nothing pending
    DispatchFromEmpty,
    /// Descriptor inserted while already held by the elevator
    DoubleInsertion,
    /// Descriptor missing from an index it claims to be in
    MissingReference,
    /// Index entry points at a descriptor that does not record it
    IndexMismatch,
    /// Queue counters disagree with the indexes they summarize
    CountMismatch,
    /// Queue is on more than one ring, or on a ring it should not be
    RingMembership,
    /// Queue torn down while it still owned descriptors
    TeardownNotEmpty,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::DispatchFromEmpty => "dispatch from empty queue",
            Self::DoubleInsertion => "double insertion",
            Self::MissingReference => "missing reference",
            Self::IndexMismatch => "index mismatch",
            Self::CountMismatch => "count mismatch",
            Self::RingMembership => "ring membership",
            Self::TeardownNotEmpty => "teardown of non-empty queue",
        };
        f.write_str(msg)
    }
}

/// Abort on a violated "must never happen" condition.
///
/// Logs the violation before panicking so the message survives a panic
/// handler that does not print.
#[macro_export]
macro_rules! bug_on {
    ($cond:expr, $kind:expr) => {
        if $cond {
            let kind: $crate::error::InvariantViolation = $kind;
            log::error!(
                "iosched: BUG at {}:{}: {} ({})",
                file!(),
                line!(),
                kind,
                stringify!($cond)
            );
            panic!("iosched: {}", kind);
        }
    };
}

/// Turn a condition into an invariant check result.
#[inline]
pub fn ensure(cond: bool, kind: InvariantViolation) -> Result<(), InvariantViolation> {
    if cond {
        Ok(())
    } else {
        Err(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(IoSchedError::Exhausted.is_retryable());
        assert!(IoSchedError::Busy.is_retryable());
        assert!(!IoSchedError::UnknownElevator.is_retryable());
    }

    #[test]
    fn test_ensure() {
        assert_eq!(ensure(true, InvariantViolation::CountMismatch), Ok(()));
        assert_eq!(
            ensure(false, InvariantViolation::CountMismatch),
            Err(InvariantViolation::CountMismatch)
        );
    }

    #[test]
    #[should_panic(expected = "dispatch from empty queue")]
    fn test_bug_on_panics() {
        bug_on!(true, InvariantViolation::DispatchFromEmpty);
    }
}
