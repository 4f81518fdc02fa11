//! Conveyor — crash-tolerant task queue with leased workers and schedules.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod queue;
pub mod retry;
pub mod schedule;
pub mod store;
