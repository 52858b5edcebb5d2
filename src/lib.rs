//! Roomtester - room acoustics testbed
//!
//! Binary support code: configuration, command line and logging. The audio
//! pipeline lives in `roomtester-core` and the control plane in
//! `roomtester-server`; both are re-exported here.

pub mod cli;
pub mod config;
pub mod logging;

pub use roomtester_core as core;
pub use roomtester_server as server;

pub use roomtester_core::{BUILD_DATE, VERSION};
