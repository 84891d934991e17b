//! Stateful differences between successive readings of monotonic counters.

use std::{borrow::Borrow, collections::HashMap, hash::Hash};

/// A monotonically increasing counter value.
pub trait Counter: Copy {
    type Diff;

    /// Returns `self - previous`, or `None` if the counter went backwards
    /// (overflow or external reset).
    fn diff(self, previous: Self) -> Option<Self::Diff>;
}

impl Counter for u64 {
    type Diff = u64;

    fn diff(self, previous: u64) -> Option<u64> {
        self.checked_sub(previous)
    }
}

/// The difference between two readings of the same counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Delta<D> {
    pub value: D,
    /// Always strictly positive.
    pub elapsed_ns: i64,
}

impl Delta<u64> {
    /// Counter units per nanosecond.
    pub fn per_ns(&self) -> f64 {
        self.value as f64 / self.elapsed_ns as f64
    }
}

/// Outcome of a counter update.
///
/// `Unavailable` and `Invalid` are kept apart because they are reported differently:
/// the first one only means "no history yet", the second one is an anomaly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeltaResult<T> {
    Valid(T),
    /// First sample of a stream, or nothing meaningful to compute.
    Unavailable,
    /// The counter went backwards, or the time did not move forward.
    Invalid,
}

impl<T> DeltaResult<T> {
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> DeltaResult<U> {
        match self {
            DeltaResult::Valid(v) => DeltaResult::Valid(f(v)),
            DeltaResult::Unavailable => DeltaResult::Unavailable,
            DeltaResult::Invalid => DeltaResult::Invalid,
        }
    }

    pub fn and_then<U, F: FnOnce(T) -> DeltaResult<U>>(self, f: F) -> DeltaResult<U> {
        match self {
            DeltaResult::Valid(v) => f(v),
            DeltaResult::Unavailable => DeltaResult::Unavailable,
            DeltaResult::Invalid => DeltaResult::Invalid,
        }
    }

    pub fn valid(self) -> Option<T> {
        match self {
            DeltaResult::Valid(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, DeltaResult::Valid(_))
    }
}

impl DeltaResult<f64> {
    /// Arithmetic mean of the values.
    ///
    /// A partial average is never reported: if any value is not `Valid`,
    /// or if there is no value at all, the mean is `Unavailable`.
    pub fn mean<I: IntoIterator<Item = DeltaResult<f64>>>(values: I) -> DeltaResult<f64> {
        let mut sum = 0.0;
        let mut count = 0usize;
        for v in values {
            match v {
                DeltaResult::Valid(x) => {
                    sum += x;
                    count += 1;
                }
                _ => return DeltaResult::Unavailable,
            }
        }
        if count == 0 {
            DeltaResult::Unavailable
        } else {
            DeltaResult::Valid(sum / count as f64)
        }
    }
}

/// The last recorded reading of a counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterStream<V> {
    pub value: V,
    pub timestamp_ns: i64,
}

/// Remembers the previous reading of each counter stream and computes deltas.
#[derive(Debug, Clone)]
pub struct DeltaTracker<K, V = u64> {
    streams: HashMap<K, CounterStream<V>>,
}

impl<K, V> Default for DeltaTracker<K, V> {
    fn default() -> Self {
        DeltaTracker {
            streams: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, V: Counter> DeltaTracker<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new reading of `stream` and returns the delta with the previous one.
    ///
    /// The new reading is always stored, even when the result is `Invalid`,
    /// so that an anomaly only affects one tick.
    pub fn update(&mut self, stream: K, timestamp_ns: i64, value: V) -> DeltaResult<Delta<V::Diff>> {
        let current = CounterStream { value, timestamp_ns };
        let Some(previous) = self.streams.insert(stream, current) else {
            return DeltaResult::Unavailable;
        };

        let elapsed_ns = timestamp_ns - previous.timestamp_ns;
        if elapsed_ns <= 0 {
            return DeltaResult::Invalid;
        }
        match value.diff(previous.value) {
            Some(diff) => DeltaResult::Valid(Delta {
                value: diff,
                elapsed_ns,
            }),
            None => DeltaResult::Invalid,
        }
    }

    /// Returns the last reading of a stream, if any.
    pub fn last<Q>(&self, stream: &Q) -> Option<&CounterStream<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.streams.get(stream)
    }

    /// Drops the history of a stream whose source has disappeared.
    pub fn forget<Q>(&mut self, stream: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.streams.remove(stream).is_some()
    }

    /// Drops the history of all the streams that don't satisfy the predicate.
    pub fn retain<F: FnMut(&K) -> bool>(&mut self, mut keep: F) {
        self.streams.retain(|k, _| keep(k))
    }

    pub fn clear(&mut self) {
        self.streams.clear()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
