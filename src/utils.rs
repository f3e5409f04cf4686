//! Small helpers shared by the binaries.

use std::time::{Duration, Instant};

/// Runs `f` and returns its result with the wall-clock time it took.
pub fn measure_time<F, T>(f: F) -> (T, Duration)
where
    F: FnOnce() -> T,
{
    let start = Instant::now();
    let result = f();
    (result, start.elapsed())
}

/// Largest absolute difference between two equally long slices.
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measures_and_returns() {
        let (value, elapsed) = measure_time(|| 6 * 7);
        assert_eq!(value, 42);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn max_diff() {
        assert_eq!(max_abs_diff(&[1.0, 2.0], &[1.5, 1.0]), 1.0);
        assert_eq!(max_abs_diff(&[], &[]), 0.0);
    }
}
