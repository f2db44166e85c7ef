//! A feedback-driven strategy controller for coverage-guided fuzzers.
//!
//! A controller periodically reads the fuzzer's `fuzzer_stats` record,
//! compares it with what it saw before and recommends one of a few
//! strategies. See [`controller::Controller`] for the loop and
//! [`strategy::select`] for the decision rules.

pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod log;
pub mod report;
pub mod signal;
pub mod state;
pub mod strategy;
pub mod telemetry;
pub mod trend;

pub const MAYBE_GIT_REF: Option<&str> = option_env!("GIT_REF");
