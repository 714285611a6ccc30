//! # Tidal Testkit
//!
//! Test utilities for Tidal.
//!
//! This crate provides:
//! - `MemoryAuthority`, a versioned in-memory server of record
//! - Collection and storage fixtures
//! - Property-based test generators using proptest
//! - Tracing initialisation for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tidal_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn adds_are_confirmed() {
//!     let authority = Arc::new(MemoryAuthority::with_server_ids());
//!     let todos = direct_collection("todos", authority.clone());
//!     todos.add_one(todo("a")).await.unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod authority;
pub mod fixtures;
pub mod generators;

use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::authority::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
}

pub use authority::{IdAssignment, MemoryAuthority};
pub use fixtures::*;
pub use generators::*;

static TRACING: Once = Once::new();

/// Installs a test-friendly tracing subscriber once per process.
///
/// The filter comes from `RUST_LOG` and defaults to `warn`. Output goes
/// through the test harness capture.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        // another subscriber may already be installed by the test binary
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
