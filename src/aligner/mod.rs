//! Ring Aligner — spatio-temporal aggregation of raw telemetry into ring records
//!
//! One excavation window in, one aggregated ring record out. The aligner is
//! the only component that creates and closes ring records; re-running it on
//! the same ring with stable inputs produces the same record.

mod aggregator;

pub use aggregator::{derived_indicators, ChannelAggregates, RingAligner};
