//! Tick cadence and deadlines.

pub mod scheduler;

pub use scheduler::TickScheduler;
