//! Lib-private utilities

use std::fmt;

/// Panic payload raised when a fiber invariant is broken under `cfg(test)`.
///
/// On the thread's own stack the panic unwinds normally. Inside a fiber it
/// cannot cross the context boundary, so the process aborts instead.
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InvariantViolation {
    message: String,
}

#[cfg_attr(not(test), allow(dead_code))]
impl InvariantViolation {
    pub(crate) fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber invariant violated: {}", self.message)
    }
}

/// Reports a broken invariant and aborts the process.
#[cfg(not(test))]
#[cold]
pub(crate) fn violation(message: String) -> ! {
    log::error!("fiber invariant violated: {}", message);
    std::process::abort()
}

/// Unit tests observe violations as panics instead.
#[cfg(test)]
#[cold]
#[track_caller]
pub(crate) fn violation(message: String) -> ! {
    log::error!("fiber invariant violated: {}", message);
    std::panic::panic_any(InvariantViolation { message })
}

/// Like `assert!`, but reports through the log and ends in [`violation`].
macro_rules! fiber_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::utils::violation(format!($($arg)+))
        }
    };
}

pub(crate) use fiber_assert;

#[cfg(test)]
mod tests {
    use std::panic;

    use super::*;

    #[test]
    fn violation_carries_message() {
        let payload = panic::catch_unwind(|| {
            fiber_assert!(1 + 1 == 3, "arithmetic is {}", "broken");
        })
        .unwrap_err();
        let violation = payload.downcast::<InvariantViolation>().unwrap();
        assert_eq!(violation.message(), "arithmetic is broken");
        assert_eq!(violation.to_string(), "fiber invariant violated: arithmetic is broken");
    }

    #[test]
    fn holding_condition_is_silent() {
        fiber_assert!(true, "never shown");
    }
}
