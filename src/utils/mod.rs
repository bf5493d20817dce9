//! Utility modules for the RTP bridge plugin

pub mod logger;

pub use logger::{setup_logging, LogGuard};
