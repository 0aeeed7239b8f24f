//! # Docksmith Core
//!
//! The operation orchestrator and its supporting services:
//! staged update / restart / rollback operations over compose
//! stacks, per-stack serialization with a persisted queue, the
//! background update checker, host / container path translation,
//! and the pre-update check runner.

#[macro_use]
extern crate tracing;

pub mod checker;
pub mod config;
pub mod orchestrator;
pub mod paths;
pub mod precheck;
pub mod stackfile;
pub mod state;
