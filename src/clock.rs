use tokio::time::Instant;

/// 32-bit millisecond clock for driving engines and inactivity checks. It wraps around after
///  roughly 49.7 days; all comparisons on its values use wrapping subtraction, which is valid for
///  gaps below roughly 24 days.
///
/// It is based on tokio's [Instant] so that tests with a paused runtime control it.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock::new()
    }
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock { origin: Instant::now() }
    }

    pub fn now_ms(&self) -> u32 {
        // truncation is the wrap-around
        self.origin.elapsed().as_millis() as u32
    }
}

/// `now - earlier` in milliseconds on the wrapping clock
pub fn elapsed_since(now: u32, earlier: u32) -> u32 {
    now.wrapping_sub(earlier)
}
