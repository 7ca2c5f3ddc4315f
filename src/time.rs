use derive_more::{Add, AddAssign, Display, From, Into};
use ordered_float::OrderedFloat;
use std::num::NonZeroU32;
use std::ops;
use std::time::Duration;

/// Elapsed seconds since the previous event on the same stream.
///
/// Stored in single precision on the wire, so summing many of them drifts;
/// `Timer` frames restate the absolute time to bound that.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, From, Display)]
#[display(fmt = "{_0}")]
pub struct TimeDelta(pub(crate) OrderedFloat<f32>);

impl TimeDelta {
    pub fn zero() -> Self {
        Self(OrderedFloat(0.0))
    }

    pub fn from_secs(secs: f32) -> Self {
        Self(OrderedFloat(secs))
    }

    pub fn as_secs(&self) -> f32 {
        self.0.into_inner()
    }
}

impl From<Duration> for TimeDelta {
    fn from(d: Duration) -> Self {
        Self::from_secs(d.as_secs_f32())
    }
}

/// Accumulated seconds since the start of the trace
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Default,
    From,
    Into,
    Display,
    Add,
    AddAssign,
)]
#[display(fmt = "{_0}")]
pub struct ElapsedTime(pub(crate) OrderedFloat<f64>);

impl ElapsedTime {
    pub fn zero() -> Self {
        Self(OrderedFloat(0.0))
    }

    pub fn from_secs(secs: f64) -> Self {
        Self(OrderedFloat(secs))
    }

    pub fn as_secs(&self) -> f64 {
        self.0.into_inner()
    }
}

impl ops::AddAssign<TimeDelta> for ElapsedTime {
    fn add_assign(&mut self, dt: TimeDelta) {
        self.0 = OrderedFloat(self.0.into_inner() + f64::from(dt.as_secs()));
    }
}

impl From<Duration> for ElapsedTime {
    fn from(d: Duration) -> Self {
        Self::from_secs(d.as_secs_f64())
    }
}

/// How often the recorder restates absolute elapsed time with a `Timer` frame.
///
/// Counted in traced calls. The right interval depends on the event rate of
/// the traced application, so it is a tunable rather than a fixed constant.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TimerSchedule {
    interval: Option<NonZeroU32>,
    counter: u32,
}

impl TimerSchedule {
    pub const DEFAULT_INTERVAL: u32 = 100;

    pub fn every(calls: u32) -> Self {
        Self {
            interval: NonZeroU32::new(calls),
            counter: 0,
        }
    }

    pub fn disabled() -> Self {
        Self::every(0)
    }

    pub fn interval(&self) -> Option<NonZeroU32> {
        self.interval
    }

    /// Count one traced call, returning true when a `Timer` frame is due
    pub fn tick(&mut self) -> bool {
        let Some(interval) = self.interval else {
            return false;
        };
        self.counter += 1;
        if self.counter >= interval.get() {
            self.counter = 0;
            true
        } else {
            false
        }
    }
}

impl Default for TimerSchedule {
    fn default() -> Self {
        Self::every(Self::DEFAULT_INTERVAL)
    }
}
