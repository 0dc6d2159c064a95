//! Monotonic cycle counter used to timestamp every log entry.
//!
//! On x86_64 this reads the TSC directly; elsewhere it falls back to a
//! process-start-anchored [`std::time::Instant`] expressed in nanoseconds.
//! Conversions to wall time go through a one-shot calibration that measures
//! the counter frequency against the OS clock.

mod __test__;

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static ANCHOR: OnceLock<Instant> = OnceLock::new();
static CYCLES_PER_SEC: OnceLock<f64> = OnceLock::new();

/// Current value of the fine-grain cycle counter.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn rdtsc() -> u64 {
  unsafe { core::arch::x86_64::_rdtsc() }
}

/// Current value of the fine-grain cycle counter.
#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub fn rdtsc() -> u64 {
  ANCHOR.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Counter ticks per second, measured once against the OS clock.
pub fn per_second() -> f64 {
  *CYCLES_PER_SEC.get_or_init(calibrate)
}

/// Converts a tick count to seconds.
pub fn to_seconds(cycles: u64) -> f64 {
  cycles as f64 / per_second()
}

/// Converts a tick count to whole nanoseconds.
pub fn to_nanos(cycles: u64) -> u64 {
  (cycles as f64 * 1e9 / per_second()) as u64
}

/// Converts a duration in seconds to a tick count.
pub fn from_seconds(seconds: f64) -> u64 {
  (seconds * per_second()) as u64
}

/// Forces calibration up front so the first conversion does not pay for it.
pub fn init() {
  ANCHOR.get_or_init(Instant::now);
  per_second();
}

// Measures the counter against Instant over short windows until two
// consecutive measurements agree within 0.1%, bounded at eight rounds.
fn calibrate() -> f64 {
  let mut previous = 0.0f64;
  let mut rate = 0.0f64;

  for _ in 0..8 {
    let wall_start = Instant::now();
    let tick_start = rdtsc();
    while wall_start.elapsed() < Duration::from_millis(10) {
      std::hint::spin_loop();
    }
    let ticks = rdtsc().wrapping_sub(tick_start);
    rate = ticks as f64 / wall_start.elapsed().as_secs_f64();

    if previous > 0.0 && ((rate - previous) / rate).abs() < 0.001 {
      break;
    }
    previous = rate;
  }

  rate
}
