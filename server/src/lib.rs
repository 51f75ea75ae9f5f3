//! Embedding demo for the tern-net reactor framework.
//!
//! Provides the configuration, logging, and signal plumbing around an echo
//! server binary; the framework itself lives in `tern-net`.

pub mod config;
pub mod logging;
pub mod signal;

pub use config::Config;
