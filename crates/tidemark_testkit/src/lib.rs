//! # Tidemark Testkit
//!
//! Test utilities for Tidemark.
//!
//! This crate provides:
//! - Sales fixtures: `Customer`, `Orders` filtered by `CustomerID`, `OrderLine`
//! - Seeded stores and wired client/server peers with their own batch directories
//! - Property-based row generators using proptest
//! - A fault-injecting store wrapper
//! - Cross-crate integration helpers and tracing setup
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tidemark_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn first_sync() {
//!     let peers = TestPeers::new().await;
//!     seed_customers(&peers.server, 1..=3);
//!     let summary = peers.agent.synchronize(SCOPE, &customer_params(1)).await.unwrap();
//!     assert_eq!(summary.total_changes_downloaded(), 3);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;
pub use integration::*;
