/*
Aliases and small value types shared by every endpoint
*/
use std::time::{Duration, Instant};

pub type MessageLength = u32; // Fixed width length prefix written before every TCP frame
pub type ProcessorCount = usize; // Zero means no limit on concurrently running callbacks

pub const PROCESSOR_LIMIT_INFINITE: ProcessorCount = 0;

/// How long a blocking call may wait. `WaitTime::INFINITE` never expires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaitTime(Option<Duration>);

impl WaitTime {
    pub const INFINITE: WaitTime = WaitTime(None);

    pub fn from_millis(millis: u64) -> Self {
        Self(Some(Duration::from_millis(millis)))
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self(Some(duration))
    }

    pub fn is_infinite(self: &Self) -> bool {
        self.0.is_none()
    }

    pub fn duration(self: &Self) -> Option<Duration> {
        self.0
    }

    /// Time left before this wait expires when it started at `start`. `None` means
    /// wait forever, `Some(Duration::ZERO)` means the wait has already expired.
    pub fn remaining(self: &Self, start: Instant) -> Option<Duration> {
        self.0.map(|limit| limit.saturating_sub(start.elapsed()))
    }
}

impl From<Option<u64>> for WaitTime {
    fn from(millis: Option<u64>) -> Self {
        match millis {
            Some(millis) => Self::from_millis(millis),
            None => Self::INFINITE,
        }
    }
}
