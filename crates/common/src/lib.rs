//! Common utilities for the OTG host stack
//!
//! This crate provides the ambient pieces shared by the host stack and the
//! simulator: error handling, logging setup, transfer statistics and test
//! descriptor builders.

pub mod error;
pub mod logging;
pub mod metrics;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::{setup_logging, setup_test_logging};
pub use metrics::{StatsSnapshot, TransferStats};
