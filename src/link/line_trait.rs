//! Trait abstraction for OpenTherm line I/O to enable testing

use async_trait::async_trait;
use std::io;
use std::time::Duration;

/// Logical line level, independent of the adapter's electrical polarity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    /// Line at rest (low current / low voltage)
    Idle,
    /// Line driven (high current / high voltage)
    Active,
}

/// A transition observed on an input line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Level after the transition
    pub level: Level,
    /// Monotonic timestamp of the transition in microseconds
    pub at_us: u64,
}

/// Trait for one OpenTherm line pair (an output and an input)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LineIo: Send {
    /// Drive the output through `levels`, holding each for `half_bit`, then return it to idle
    async fn transmit(&mut self, levels: &[Level], half_bit: Duration) -> io::Result<()>;

    /// Wait for the next input transition, `None` if nothing arrives within `timeout`
    async fn next_edge(&mut self, timeout: Duration) -> io::Result<Option<Edge>>;
}
