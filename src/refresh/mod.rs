//! The refresh pipeline: fan-out fetching, snapshot publication, and the
//! scheduler that drives it.

pub mod aggregator;
pub mod cycle;
pub mod scheduler;

pub use aggregator::{Aggregator, AggregatorSettings, CycleOutput};
pub use cycle::{CycleTrigger, RefreshCycle, SegmentOutcome, SegmentReport};
pub use scheduler::{RefreshScheduler, TriggerOutcome};
