//! The `utils` module provides a collection of utility functions and common
//! definitions used across `popsubd`.
//!
//! This module centralizes the error types and logging setup shared by the
//! broker, persistence and configuration layers.

pub mod error;
pub mod logging;

pub use error::{BrokerError, TrackedSet};
