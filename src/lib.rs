//! Mobile app resource profiling.
//!
//! Samples CPU, memory and network usage of a running app by parsing the
//! text output of platform tools (`adb shell top`, `nettop`, `/proc/net`
//! counters) into typed time-series runs, then reduces those runs into
//! summaries and cross-run comparisons.

pub mod collector;
pub mod parse;
pub mod recorder;
pub mod report;
pub mod source;
pub mod stats;
