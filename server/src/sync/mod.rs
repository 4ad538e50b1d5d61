//! Background delivery: the executor and what wakes it.

mod executor;
mod trigger;

pub use executor::{ExecutorSettings, PassOutcome, PassReport, SyncExecutor};
pub use trigger::NetworkTrigger;
