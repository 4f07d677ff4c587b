//! # daseg-core
//!
//! Core types, configuration and errors for domain-adaptive semantic
//! segmentation with class-based domain mixing.

pub mod config;
pub mod error;
pub mod types;

pub use config::*;
pub use error::{Error, Result};
pub use types::*;
