//! Asynchronous result log sinks.
//!
//! Both sinks sit behind bounded channels; producers never block and drop
//! the newest entry (with a counter) when a consumer falls behind.

mod filelog;
mod index;

pub use filelog::*;
pub use index::*;
