//! Bucket clock: aligns wall-clock time to bucket boundaries.
//!
//! Boundaries are multiples of the interval counted from the Unix epoch, so
//! every process (and every restart) derives the same bucket for the same
//! instant. The only state kept is the last boundary seen, which is what lets
//! the clock ride out a backward wall-clock jump without reopening a bucket
//! that was already closed.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// What the clock concluded about one observed instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First instant ever observed; `start` is the bucket to open
    First { start: DateTime<Utc> },

    /// Still inside the open bucket
    Same { start: DateTime<Utc> },

    /// The open bucket ended; `opened` is the new bucket's start
    Rollover {
        closed: DateTime<Utc>,
        opened: DateTime<Utc>,
    },

    /// Wall clock moved backward past the open bucket's start. The open bucket
    /// (`start`) stays open; `observed` is the floor of the regressed instant.
    Regressed {
        start: DateTime<Utc>,
        observed: DateTime<Utc>,
    },
}

impl Observation {
    /// Start of the bucket that is open after this observation.
    pub fn open_bucket(&self) -> DateTime<Utc> {
        match *self {
            Observation::First { start } => start,
            Observation::Same { start } => start,
            Observation::Rollover { opened, .. } => opened,
            Observation::Regressed { start, .. } => start,
        }
    }

    pub fn is_rollover(&self) -> bool {
        matches!(self, Observation::Rollover { .. })
    }
}

#[derive(Debug, Clone)]
pub struct BucketClock {
    interval_secs: i64,
    last_boundary: Option<DateTime<Utc>>,
}

impl BucketClock {
    /// Create a clock for the given bucket interval. Sub-second parts of the
    /// interval are ignored; an interval under one second is treated as one.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_secs: interval.as_secs().max(1) as i64,
            last_boundary: None,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs as u64)
    }

    /// Floor `t` to the start of its bucket.
    pub fn floor(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let secs = t.timestamp();
        let start = secs - secs.rem_euclid(self.interval_secs);
        DateTime::<Utc>::from_timestamp(start, 0).unwrap_or(t)
    }

    /// End (exclusive) of the bucket starting at `start`.
    pub fn end_of(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start + chrono::Duration::seconds(self.interval_secs)
    }

    /// Last boundary observed, i.e. the start of the open bucket.
    pub fn last_boundary(&self) -> Option<DateTime<Utc>> {
        self.last_boundary
    }

    /// Observe the current wall-clock time.
    pub fn observe(&mut self, now: DateTime<Utc>) -> Observation {
        let floor = self.floor(now);
        let observation = match self.last_boundary {
            None => Observation::First { start: floor },
            Some(last) if floor == last => Observation::Same { start: last },
            Some(last) if floor > last => Observation::Rollover {
                closed: last,
                opened: floor,
            },
            Some(last) => Observation::Regressed {
                start: last,
                observed: floor,
            },
        };
        self.last_boundary = Some(observation.open_bucket());
        observation
    }
}
