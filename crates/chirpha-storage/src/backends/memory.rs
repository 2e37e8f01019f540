//! In-memory time-series backend.
//!
//! Keeps every written point in a vector. Query and write failures can be
//! switched on to exercise the reconciler's soft-failure paths.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::timeseries::{SampleValue, SeriesKey, TimeSeriesBackend, WritePoint};
use crate::{Error, Result};

#[derive(Default)]
pub struct MemoryBackend {
    points: RwLock<Vec<WritePoint>>,
    fail_queries: AtomicBool,
    fail_writes: AtomicBool,
    query_calls: AtomicUsize,
    write_calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a point directly, bypassing the write counters.
    pub fn seed(&self, point: WritePoint) {
        self.points.write().push(point);
    }

    /// Make every query fail with [`Error::Unavailable`].
    pub fn set_query_failure(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail with [`Error::Unavailable`].
    pub fn set_write_failure(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// All stored points in insertion order.
    pub fn points(&self) -> Vec<WritePoint> {
        self.points.read().clone()
    }

    pub fn points_for(&self, key: &SeriesKey) -> Vec<WritePoint> {
        self.points
            .read()
            .iter()
            .filter(|p| p.matches(key))
            .cloned()
            .collect()
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    /// Number of `write_points` calls, failed ones included.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TimeSeriesBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn query_last_value(
        &self,
        key: &SeriesKey,
        lookback: Duration,
    ) -> Result<Option<SampleValue>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("memory backend query failure".to_string()));
        }

        let oldest = chrono::Utc::now().timestamp() - lookback.as_secs() as i64;
        let points = self.points.read();
        // Latest timestamp wins; among equal timestamps the last written wins.
        let last = points
            .iter()
            .filter(|p| p.matches(key) && p.timestamp >= oldest)
            .fold(None::<&WritePoint>, |best, p| match best {
                Some(b) if b.timestamp > p.timestamp => Some(b),
                _ => Some(p),
            });
        Ok(last.map(|p| p.value.clone()))
    }

    async fn write_points(&self, points: &[WritePoint]) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("memory backend write failure".to_string()));
        }
        self.points.write().extend_from_slice(points);
        Ok(())
    }
}
