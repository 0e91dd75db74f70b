//! Stackpilot - a deploy orchestration core.
//!
//! Aggregates CI statuses per commit, admits deploys, rollbacks and
//! maintenance tasks onto stacks one at a time, streams their output, and
//! fans state changes out to webhook subscribers.

pub mod config;
pub mod engine;
pub mod events;
pub mod executor;
pub mod hooks;
pub mod jobs;
pub mod persistence;
pub mod state;
pub mod types;

#[cfg(test)]
pub mod test_utils;
