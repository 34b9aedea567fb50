//! Trigger timestamps: sample-counter time-keeping for a running stream.

use std::ops;
use std::ops::AddAssign;
use std::time::Duration;

/// Timestamp value, which computes duration information from a provided
/// samplerate and a running sample counter.
///
/// The PCM layer records one of these when a stream is triggered and
/// advances it as frames move, so `status` can report how long the stream
/// has been running in stream time rather than wall time.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Timestamp {
    /// Number of samples counted in this timestamp.
    pub counter: u64,
    /// Samplerate of the audio stream associated with the counter.
    pub samplerate: f64,
}

impl AddAssign<Duration> for Timestamp {
    fn add_assign(&mut self, rhs: Duration) {
        let samples = rhs.as_secs_f64() * self.samplerate;
        self.counter += samples as u64;
    }
}

impl AddAssign<u64> for Timestamp {
    fn add_assign(&mut self, rhs: u64) {
        self.counter += rhs;
    }
}

impl<T> ops::Add<T> for Timestamp
where
    Self: AddAssign<T>,
{
    type Output = Self;

    fn add(mut self, rhs: T) -> Self {
        self.add_assign(rhs);
        self
    }
}

impl Timestamp {
    /// Create a zeroed timestamp with the provided sample rate.
    pub fn new(samplerate: f64) -> Self {
        Self {
            counter: 0,
            samplerate,
        }
    }

    /// Create a timestamp from the given sample rate and existing sample count.
    pub fn from_count(samplerate: f64, counter: u64) -> Self {
        Self {
            samplerate,
            counter,
        }
    }

    /// Compute the duration represented by this [`Timestamp`].
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs_f64(self.as_seconds())
    }

    /// Compute the number of seconds represented in this [`Timestamp`].
    pub fn as_seconds(&self) -> f64 {
        self.counter as f64 / self.samplerate
    }
}
