use once_cell::sync::Lazy;
use quanta::Clock;
use std::time::Duration;

/// Global high-performance clock for scrape timing.
pub static CLOCK: Lazy<Clock> = Lazy::new(Clock::new);

/// Get current instant (precise, ~10ns overhead).
#[inline]
pub fn now() -> quanta::Instant {
    CLOCK.now()
}

/// Wall-clock time elapsed since `start`, never negative.
#[inline]
pub fn elapsed(start: quanta::Instant) -> Duration {
    now().saturating_duration_since(start)
}
