//! Bucketing and statistics helpers used by histogram and time series queries.
//!
//! Everything here is pure arithmetic over values already fetched from the
//! engine; the SQL that gathers the inputs lives in `query_builder::histogram`.

mod fd;
mod rollup;
mod ticks;

pub use fd::{freedman_diaconis_buckets, HistogramStats, MAX_BUCKETS};
pub use rollup::{m4_rollup, m4_rollup_indices};
pub use ticks::{diagnostic_bucket_count, nice_and_step, tick_increment};
