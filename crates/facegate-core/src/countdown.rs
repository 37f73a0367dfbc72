//! Whole-second countdowns driving the submit delay and the post-success reset.
//!
//! The countdown only holds state; whoever owns the 1-second timer calls
//! [`Countdown::tick`]. Once cancelled it never reports [`CountdownStep::Elapsed`],
//! so a stale timer callback firing after teardown changes nothing.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownStep {
    /// Seconds still to go after this tick.
    Remaining(u32),
    /// Reached zero on this tick. Reported exactly once.
    Elapsed,
    /// Cancelled, or already elapsed earlier.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Countdown {
    remaining: u32,
    done: bool,
}

impl Countdown {
    pub fn new(seconds: u32) -> Self {
        Self {
            remaining: seconds,
            done: false,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_active(&self) -> bool {
        !self.done
    }

    pub fn tick(&mut self) -> CountdownStep {
        if self.done {
            return CountdownStep::Cancelled;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.done = true;
            CountdownStep::Elapsed
        } else {
            CountdownStep::Remaining(self.remaining)
        }
    }

    pub fn cancel(&mut self) {
        self.done = true;
    }
}
