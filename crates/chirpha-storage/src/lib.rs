//! Time-series storage boundary for the bridge.
//!
//! The reconciler only ever asks two things of a backend: the most recent
//! persisted sample of a series within a lookback window, and a batched
//! write of new points. Both InfluxDB protocol variants and an in-memory
//! backend implement [`TimeSeriesBackend`].

pub mod backends;
pub mod error;
pub mod timeseries;

pub use backends::{create_backend, InfluxClient, MemoryBackend};
pub use error::{Error, Result};
pub use timeseries::{
    SampleValue, SeriesKey, TimeSeriesBackend, WritePoint, FIELD_STATE, FIELD_VALUE,
    VALUE_TOLERANCE,
};
