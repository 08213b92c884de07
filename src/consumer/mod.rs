//! # DLQ Consumer
//!
//! The [`ReprocessingEngine`] turns one delivery into one terminal broker
//! action; the [`ConsumerLoop`] feeds it from the subscription with bounded
//! concurrency and drains it on shutdown.

pub mod consumer_loop;
pub mod engine;
pub mod stats;

pub use consumer_loop::{ConsumerHandle, ConsumerLoop, DrainReport};
pub use engine::{Disposition, MaintenanceReport, ReprocessingEngine};
pub use stats::{ConsumerStats, ConsumerStatsSnapshot};
