//! Background Tasks Module
//!
//! Contains the recurring maintenance task owned by each cache instance.
//!
//! # Tasks
//! - Sweep: flushes/unloads expired single-object slots and drops expired
//!   query results at a configured period

mod scheduler;

pub use scheduler::MaintenanceScheduler;
