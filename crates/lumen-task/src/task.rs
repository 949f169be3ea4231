//! Task identity and priority.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique 64-bit task identifier, minted by the scheduler at submission time.
///
/// Identifiers are never reused within one scheduler's lifetime; they
/// correlate timeline records with slot occupants.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TaskId(u64);

impl TaskId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority level that determines selection order within a starvation window.
///
/// The order is total and numeric: `Background < Service < Normal <
/// Interactive < Critical`.  Priority only ever acts *inside* the starvation
/// window, so an endless stream of high-priority work cannot permanently
/// shut out low-priority tasks.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum TaskPriority {
    /// Bulk / best-effort work.
    Background = 0,
    /// Housekeeping that should not compete with user-visible work.
    Service = 1,
    /// Default priority for most tasks.
    #[default]
    Normal = 2,
    /// Directly user-visible work (input handling, animation).
    Interactive = 3,
    /// Must run before anything else.
    Critical = 4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_is_numeric() {
        assert!(TaskPriority::Background < TaskPriority::Service);
        assert!(TaskPriority::Service < TaskPriority::Normal);
        assert!(TaskPriority::Normal < TaskPriority::Interactive);
        assert!(TaskPriority::Interactive < TaskPriority::Critical);
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
    }

    #[test]
    fn ids_compare_by_value() {
        assert_eq!(TaskId::new(7), TaskId::new(7));
        assert!(TaskId::new(1) < TaskId::new(2));
        assert_eq!(TaskId::new(42).to_string(), "42");
    }
}
