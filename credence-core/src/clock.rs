//! ## credence-core::clock
//! **Virtual time for balance accounting**
//!
//! All balance arithmetic is expressed against [`Clock`], never against the OS
//! clock directly. Two implementations exist:
//! - [`SystemClock`]: monotonic wall clock, nanoseconds since construction.
//! - [`SimulatedClock`]: manually advanced, deterministic. Advancing it fires
//!   every due timer of the attached drivers before `advance` returns.

use std::fmt;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Absolute virtual time in nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AbsTime(pub u64);

impl AbsTime {
    pub const ZERO: AbsTime = AbsTime(0);

    #[inline]
    pub fn as_nanos(self) -> u64 {
        self.0
    }

    /// Elapsed time since `earlier`, zero if `earlier` is in the future.
    #[inline]
    pub fn saturating_since(self, earlier: AbsTime) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for AbsTime {
    type Output = AbsTime;

    fn add(self, rhs: Duration) -> AbsTime {
        let nanos = u64::try_from(rhs.as_nanos()).unwrap_or(u64::MAX);
        AbsTime(self.0.saturating_add(nanos))
    }
}

impl Sub for AbsTime {
    type Output = Duration;

    fn sub(self, rhs: AbsTime) -> Duration {
        self.saturating_since(rhs)
    }
}

impl fmt::Display for AbsTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

/// Something that owns scheduled deadlines and can fire the due ones.
pub trait TimerDriver: Send + Sync {
    /// Earliest pending deadline, if any.
    fn next_deadline(&self) -> Option<AbsTime>;

    /// Fires every pending entry scheduled at or before `now`.
    fn fire_due(&self, now: AbsTime);
}

/// Monotonic time source.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> AbsTime;

    /// Hands the driver to the clock. Returns `true` if the clock takes over
    /// firing its deadlines; `false` means the caller must run its own
    /// real-time dispatcher.
    fn attach(&self, _driver: Weak<dyn TimerDriver>) -> bool {
        false
    }
}

/// Wall clock measured from construction.
#[derive(Clone, Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> AbsTime {
        AbsTime(u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX))
    }
}

/// Deterministic clock that only moves when told to.
#[derive(Clone, Default)]
pub struct SimulatedClock {
    inner: Arc<SimulatedInner>,
}

#[derive(Default)]
struct SimulatedInner {
    now: AtomicU64,
    drivers: Mutex<Vec<Weak<dyn TimerDriver>>>,
}

impl SimulatedClock {
    /// Creates a clock starting at `seed` nanoseconds.
    pub fn new(seed: u64) -> Self {
        let clock = Self::default();
        clock.inner.now.store(seed, Ordering::Release);
        clock
    }

    /// Advances the clock by `duration`, firing due timers in time order.
    ///
    /// Each due entry fires with the clock set to its own deadline, so timer
    /// work observes the exact instant it was scheduled for.
    pub fn advance(&self, duration: Duration) {
        let target = self.now() + duration;
        while let Some((at, driver)) = self.earliest_due(target) {
            if at > self.now() {
                self.inner.now.store(at.0, Ordering::Release);
            }
            driver.fire_due(self.now());
        }
        self.inner.now.store(target.0, Ordering::Release);
    }

    /// Number of live drivers attached to the clock.
    pub fn attached_drivers(&self) -> usize {
        let mut drivers = self.inner.drivers.lock();
        drivers.retain(|d| d.strong_count() > 0);
        drivers.len()
    }

    fn earliest_due(&self, target: AbsTime) -> Option<(AbsTime, Arc<dyn TimerDriver>)> {
        // Collect strong handles first so no clock lock is held while firing.
        let live: Vec<Arc<dyn TimerDriver>> = {
            let mut drivers = self.inner.drivers.lock();
            drivers.retain(|d| d.strong_count() > 0);
            drivers.iter().filter_map(Weak::upgrade).collect()
        };
        live.into_iter()
            .filter_map(|driver| driver.next_deadline().map(|at| (at, driver)))
            .filter(|(at, _)| *at <= target)
            .min_by_key(|(at, _)| *at)
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> AbsTime {
        AbsTime(self.inner.now.load(Ordering::Acquire))
    }

    fn attach(&self, driver: Weak<dyn TimerDriver>) -> bool {
        self.inner.drivers.lock().push(driver);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_clock_initial_value() {
        let clock = SimulatedClock::new(100);
        assert_eq!(clock.now(), AbsTime(100));
    }

    #[test]
    fn test_clock_advance() {
        let clock = SimulatedClock::new(0);
        clock.advance(Duration::from_nanos(500));
        assert_eq!(clock.now(), AbsTime(500));
        clock.advance(Duration::from_nanos(250));
        assert_eq!(clock.now(), AbsTime(750));
    }

    #[test]
    fn abs_time_arithmetic_saturates() {
        assert_eq!(AbsTime(5) - AbsTime(9), Duration::ZERO);
        assert_eq!(AbsTime(u64::MAX - 1) + Duration::from_secs(1), AbsTime(u64::MAX));
    }

    struct Recorder {
        pending: Mutex<BTreeMap<AbsTime, &'static str>>,
        fired: Mutex<Vec<(AbsTime, &'static str)>>,
    }

    impl TimerDriver for Recorder {
        fn next_deadline(&self) -> Option<AbsTime> {
            self.pending.lock().keys().next().copied()
        }

        fn fire_due(&self, now: AbsTime) {
            let mut pending = self.pending.lock();
            loop {
                let next = pending.keys().next().copied();
                let Some(at) = next.filter(|at| *at <= now) else {
                    break;
                };
                let label = pending.remove(&at).unwrap_or_default();
                self.fired.lock().push((now, label));
            }
        }
    }

    #[test]
    fn advance_fires_due_timers_in_order_at_their_deadline() {
        let clock = SimulatedClock::new(0);
        let recorder = Arc::new(Recorder {
            pending: Mutex::new(BTreeMap::from([
                (AbsTime(30), "c"),
                (AbsTime(10), "a"),
                (AbsTime(20), "b"),
                (AbsTime(99), "late"),
            ])),
            fired: Mutex::new(Vec::new()),
        });
        let weak = Arc::downgrade(&recorder);
        assert!(clock.attach(weak));

        clock.advance(Duration::from_nanos(30));
        assert_eq!(
            *recorder.fired.lock(),
            vec![(AbsTime(10), "a"), (AbsTime(20), "b"), (AbsTime(30), "c")]
        );
        assert_eq!(clock.now(), AbsTime(30));

        drop(recorder);
        clock.advance(Duration::from_nanos(100));
        assert_eq!(clock.attached_drivers(), 0);
    }
}
