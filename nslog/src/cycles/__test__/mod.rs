#[cfg(test)]
mod __test__ {

  use crate::cycles;

  #[test]
  fn test_counter_is_monotonic() {
    let mut last = cycles::rdtsc();
    for _ in 0..1000 {
      let now = cycles::rdtsc();
      assert!(now >= last);
      last = now;
    }
  }

  #[test]
  fn test_calibration_is_positive() {
    let rate = cycles::per_second();
    // Anything slower than 1 MHz or faster than 100 GHz is a broken clock.
    assert!(rate > 1e6);
    assert!(rate < 1e11);
  }

  #[test]
  fn test_calibration_is_stable() {
    assert_eq!(cycles::per_second(), cycles::per_second());
  }

  #[test]
  fn test_seconds_round_trip() {
    let ticks = cycles::from_seconds(1.5);
    let seconds = cycles::to_seconds(ticks);
    assert!((seconds - 1.5).abs() < 1e-6);
  }

  #[test]
  fn test_to_nanos_scales_with_seconds() {
    let one_sec = cycles::from_seconds(1.0);
    let nanos = cycles::to_nanos(one_sec);
    assert!((nanos as f64 - 1e9).abs() < 1e4);
  }

  #[test]
  fn test_elapsed_ticks_match_sleep() {
    let start = cycles::rdtsc();
    std::thread::sleep(std::time::Duration::from_millis(20));
    let elapsed = cycles::to_seconds(cycles::rdtsc() - start);
    assert!(elapsed >= 0.015, "measured {elapsed}s for a 20ms sleep");
    assert!(elapsed < 1.0);
  }
}
