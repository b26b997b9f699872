use std::{
    ops::{Add, Sub},
    time::Duration,
};

use serde::Serialize;

/// A timestamp tracks the simulated time from the start of the run.
///
/// All configured delays and means are expressed in simulated milliseconds;
/// [`millis`] converts a (possibly fractional) millisecond count into a
/// [`Duration`] to add to a timestamp.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp(Duration);

impl Timestamp {
    pub fn zero() -> Self {
        Self(Duration::from_secs(0))
    }

    pub fn as_millis_f64(&self) -> f64 {
        self.0.as_secs_f64() * 1000.0
    }

    pub fn as_nanos(&self) -> u128 {
        self.0.as_nanos()
    }
}

pub fn millis(ms: f64) -> Duration {
    Duration::from_secs_f64(ms.max(0.0) / 1000.0)
}

impl From<Duration> for Timestamp {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0 + rhs)
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Self::Output {
        self.0 - rhs.0
    }
}

impl Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_f64(self.as_millis_f64())
    }
}
