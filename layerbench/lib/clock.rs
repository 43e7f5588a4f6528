use std::{
    cell::{Cell, RefCell},
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::LayerbenchResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const SECOND: Duration = Duration::from_secs(1);

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A source of wall-clock time that scenarios sensitive to timestamp granularity can wait on.
pub trait Clock {
    /// Returns the current time.
    fn now(&self) -> SystemTime;

    /// Blocks for `duration`.
    fn sleep(&self, duration: Duration);
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

/// A deterministic clock whose time only moves when it sleeps or is advanced.
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<SystemTime>,
    sleeps: RefCell<Vec<Duration>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ManualClock {
    /// Creates a manual clock stopped at `start`.
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Cell::new(start),
            sleeps: RefCell::new(Vec::new()),
        }
    }

    /// Moves the clock forward by `duration` without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }

    /// Returns every duration the clock was asked to sleep for, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns how long to wait from `now` until the next whole second.
///
/// A time that already sits on a second boundary waits a full second.
pub fn until_next_second(now: SystemTime) -> Duration {
    let subsec = now
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos())
        .unwrap_or_default();

    SECOND - Duration::from_nanos(u64::from(subsec))
}

/// Runs `f` `iterations` times, waiting for the next whole second on `clock` between runs.
///
/// Filesystems with one-second timestamp granularity can hide a changed file when the change lands
/// in the same second as the original write. Repeating across second boundaries makes such a
/// scenario land on both sides of one.
///
/// ## Errors
///
/// Stops at and returns the first error from `f`.
pub fn repeat_at_second_boundaries(
    clock: &impl Clock,
    iterations: usize,
    mut f: impl FnMut(usize) -> LayerbenchResult<()>,
) -> LayerbenchResult<()> {
    for iteration in 0..iterations {
        if iteration > 0 {
            let wait = until_next_second(clock.now());
            tracing::debug!("Waiting {:?} for the next second boundary", wait);
            clock.sleep(wait);
        }

        f(iteration)?;
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
        self.advance(duration);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(UNIX_EPOCH)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LayerbenchError;

    #[test]
    fn test_until_next_second() {
        let on_boundary = UNIX_EPOCH + Duration::from_secs(10);
        assert_eq!(until_next_second(on_boundary), SECOND);

        let mid = on_boundary + Duration::from_millis(250);
        assert_eq!(until_next_second(mid), Duration::from_millis(750));
    }

    #[test_log::test]
    fn test_repeat_waits_between_runs_only() -> anyhow::Result<()> {
        let clock = ManualClock::new(UNIX_EPOCH + Duration::from_millis(400));
        let mut runs = Vec::new();

        repeat_at_second_boundaries(&clock, 3, |i| {
            runs.push((i, clock.now()));
            Ok(())
        })?;

        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(600), Duration::from_secs(1)]
        );
        assert_eq!(
            runs,
            vec![
                (0, UNIX_EPOCH + Duration::from_millis(400)),
                (1, UNIX_EPOCH + Duration::from_secs(1)),
                (2, UNIX_EPOCH + Duration::from_secs(2)),
            ]
        );

        Ok(())
    }

    #[test_log::test]
    fn test_repeat_stops_at_first_failure() -> anyhow::Result<()> {
        let clock = ManualClock::default();
        let mut calls = 0;

        let result = repeat_at_second_boundaries(&clock, 5, |i| {
            calls += 1;
            if i == 1 {
                return Err(LayerbenchError::custom(anyhow::anyhow!("run {i} failed")));
            }
            Ok(())
        });

        assert!(result.is_err());
        assert_eq!(calls, 2);
        assert_eq!(clock.sleeps().len(), 1);

        Ok(())
    }
}
