//! Supervised runtime
//!
//! Long-lived worker loops run under a supervisor that restarts them on
//! panic, bounds the fleet-killing failure rate, and trips a down latch
//! exactly once when it has fully stopped.

pub mod runner;

pub use runner::{DownSignal, Runner};
