//! Time-based task creation: triggers, schedule records, and the engine
//! that fires them into the queue.

pub mod model;
pub mod scheduler;
pub mod trigger;

pub use model::{NewSchedule, Schedule};
pub use scheduler::Scheduler;
pub use trigger::Trigger;
