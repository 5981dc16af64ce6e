use std::{sync::OnceLock, time::Instant};

/// Monotonic millisecond source used by blocking waits.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Countdown against caller-supplied monotonic time. An unstarted
/// countdown is already due.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Countdown {
    deadline_ms: Option<u64>,
}

impl Countdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(now_ms: u64, duration_ms: u64) -> Self {
        let mut countdown = Self::new();
        countdown.start(now_ms, duration_ms);
        countdown
    }

    pub fn start(&mut self, now_ms: u64, duration_ms: u64) {
        self.deadline_ms = Some(now_ms.saturating_add(duration_ms));
    }

    pub fn stop(&mut self) {
        self.deadline_ms = None;
    }

    pub fn is_running(&self) -> bool {
        self.deadline_ms.is_some()
    }

    pub fn expired(&self, now_ms: u64) -> bool {
        self.remaining_ms(now_ms) == 0
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        match self.deadline_ms {
            Some(deadline) => deadline.saturating_sub(now_ms),
            None => 0,
        }
    }
}
