//! AWS SDK S3 backend for the rusty-transfer engine.
//!
//! This crate provides a `StoreClient` implementation using the AWS SDK for
//! Rust, and the mapping from S3 failures onto the engine's retry classes.
//!
//! # Example
//!
//! ```ignore
//! use rusty_transfer::{TransferConfig, TransferManager};
//! use rusty_transfer_s3::{S3Settings, S3StoreClient};
//!
//! let client = S3StoreClient::new(S3Settings::default()).await;
//! let manager = TransferManager::new(Arc::new(client), TransferConfig::default());
//! ```

mod client;
mod error;

pub use client::{copy_source, S3Credentials, S3Settings, S3StoreClient};
pub use error::map_status;
