//! Timing helpers: a logging stopwatch guard and a deadline iterator.

use std::time::{Duration, Instant};

/// Logs the time elapsed between construction and drop.
///
/// Nothing is logged when the elapsed time is below `threshold`. When the
/// guard is dropped during a panic unwind the message says so.
#[derive(Debug)]
pub struct Stopwatch {
    desc: String,
    threshold: Duration,
    start: Instant,
}

impl Stopwatch {
    #[must_use]
    pub fn start(desc: impl Into<String>, threshold: Duration) -> Self {
        Self {
            desc: desc.into(),
            threshold,
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Stopwatch {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        if elapsed < self.threshold {
            return;
        }
        let prefix = if self.desc.is_empty() {
            String::new()
        } else {
            format!("{} ", self.desc)
        };
        if std::thread::panicking() {
            tracing::info!("{prefix}{:.3} s elapsed before panic", elapsed.as_secs_f64());
        } else {
            tracing::info!("{prefix}{:.3} s elapsed", elapsed.as_secs_f64());
        }
    }
}

/// Iterator yielding the elapsed time until `duration` has passed.
///
/// ```
/// use std::time::Duration;
/// use tandem_core::timing::timeout_iter;
///
/// let polls = timeout_iter(Duration::from_millis(20)).count();
/// assert!(polls >= 1);
/// ```
#[must_use]
pub fn timeout_iter(duration: Duration) -> TimeoutIter {
    TimeoutIter {
        start: Instant::now(),
        duration,
    }
}

/// See [`timeout_iter`].
#[derive(Debug, Clone)]
pub struct TimeoutIter {
    start: Instant,
    duration: Duration,
}

impl Iterator for TimeoutIter {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let elapsed = self.start.elapsed();
        (elapsed < self.duration).then_some(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_iter_stops_after_duration() {
        let start = Instant::now();
        let mut last = Duration::ZERO;
        for elapsed in timeout_iter(Duration::from_millis(30)) {
            assert!(elapsed >= last);
            last = elapsed;
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(last < Duration::from_millis(30));
    }

    #[test]
    fn zero_timeout_yields_nothing() {
        assert_eq!(timeout_iter(Duration::ZERO).count(), 0);
    }

    #[test]
    fn stopwatch_tracks_elapsed() {
        let watch = Stopwatch::start("probe", Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(10));
        assert!(watch.elapsed() >= Duration::from_millis(10));
    }
}
