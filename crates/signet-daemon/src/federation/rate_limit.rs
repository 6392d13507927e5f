//! Per-connection rate limiting
//!
//! Sliding counter: at most `max_per_minute` frames accepted per window;
//! the window resets 60 s after the first message in it. Overruns are
//! answered with `ERROR {code: RATE_LIMITED}` but never close the socket.

use std::time::{Duration, Instant};

/// Window length.
const WINDOW: Duration = Duration::from_secs(60);

/// Sliding message counter for one connection.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: u32,
    count: u32,
    window_start: Option<Instant>,
}

impl RateLimiter {
    /// Limiter allowing `max_per_minute` frames per window.
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_window: max_per_minute.max(1),
            count: 0,
            window_start: None,
        }
    }

    /// Account one inbound frame at `now`; returns whether it is allowed.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        match self.window_start {
            Some(start) if now.duration_since(start) < WINDOW => {}
            _ => {
                self.window_start = Some(now);
                self.count = 0;
            }
        }
        self.count += 1;
        self.count <= self.max_per_window
    }

    /// Account one inbound frame now.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }
}
