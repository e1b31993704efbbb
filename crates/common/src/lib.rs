//! Shared types and utilities for rusty-transfer.
//!
//! This crate provides common functionality used across all rusty-transfer crates:
//! - Size and store-limit constants
//! - Byte-count progress callback trait

pub mod constants;
pub mod progress;

// Re-export commonly used items at crate root
pub use constants::*;
pub use progress::{progress_fn, FnProgress, NoOpProgress, ProgressCallback};
