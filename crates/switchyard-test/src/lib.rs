//! Switchyard Test - Shared test utilities for the Switchyard shell.
//!
//! This crate provides fake loaders, in-memory code units and helpers for
//! reading shell messages that can be used across Switchyard crates as a
//! dev-dependency.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use switchyard_test::{RecordingLoader, test_manager, test_url};
//!
//! #[test]
//! fn test_loader_invoked() {
//!     let (core, mut manager, _queue) = test_manager();
//!     let loader = Arc::new(RecordingLoader::new(Arc::clone(&core)));
//!     manager.set_default_loader(Some(loader.clone()));
//!
//!     let url = test_url("app:hello");
//!     let _ = manager.connect_to_application(&url, &url, Default::default());
//!     assert_eq!(loader.load_count(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod fixtures;
pub mod mocks;

pub use fixtures::*;
pub use mocks::*;
