//! The `sqlstress` command line tool.
//!
//! This wraps the [`sqlstress_engine`] benchmark orchestrator in a
//! command line interface: configuration loading, tracing setup, live
//! progress rendering, signal handling, and the final JSON report on
//! stdout.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cli;
pub mod config;
pub mod observability;
pub mod progress;
