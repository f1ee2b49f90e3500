//! Canonical identifier types used across the reactor, chain executor and worker pool.

use std::fmt;

/// Reactor-assigned identifier of one client connection.
///
/// Suspended chains hold this id instead of a reference so a closed connection can be
/// detected when the chain is due to resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wraps a raw connection number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the inner number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Strongly typed worker-count wrapper to avoid passing raw integers around runtime APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerCount(u16);

impl WorkerCount {
    /// Creates a validated worker-count value.
    ///
    /// Returns `None` for zero because blocking jobs always need at least one worker.
    #[must_use]
    pub fn new(value: u16) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Returns the inner count.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionId, WorkerCount};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn worker_count_rejects_zero() {
        assert_that!(WorkerCount::new(0), eq(None));
    }

    #[rstest]
    #[case(1)]
    #[case(5)]
    #[case(u16::MAX)]
    fn worker_count_accepts_positive_values(#[case] input: u16) {
        let count = WorkerCount::new(input).expect("positive count must be valid");
        assert_that!(count.get(), eq(input));
    }

    #[rstest]
    fn connection_id_displays_with_prefix() {
        assert_that!(ConnectionId::new(42).to_string(), eq("c42"));
    }
}
