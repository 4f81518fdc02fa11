//! Task execution: the worker-pool dispatcher, the pluggable runner seam,
//! and the shutdown drain sequence.

pub mod dispatcher;
pub mod runner;
pub mod shutdown;

pub use dispatcher::Dispatcher;
pub use runner::{LogRunner, TaskFailure, TaskRunner};
pub use shutdown::ShutdownCoordinator;
