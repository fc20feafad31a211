// Declare modules at the root level
pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod garden;
pub mod http;
pub mod id_generator;
pub mod session;
pub mod settings;
pub mod snapshot;
pub mod stomp;
pub mod storage;
pub mod time;
pub mod validators;

// Test utilities module (available in test and integration test builds)
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export everything under a shared namespace for external access
pub mod shared {
    pub use super::api;
    pub use super::config;
    pub use super::domain;
    pub use super::error;
    pub use super::garden;
    pub use super::http;
    pub use super::id_generator;
    pub use super::session;
    pub use super::settings;
    pub use super::snapshot;
    pub use super::stomp;
    pub use super::storage;
    pub use super::time;
    pub use super::validators;
}

// Also re-export at root for convenience
pub use api::*;
pub use config::*;
pub use domain::*;
pub use error::*;
pub use garden::*;
pub use http::*;
pub use id_generator::*;
pub use session::*;
pub use settings::*;
pub use snapshot::*;
pub use stomp::*;
pub use storage::*;
pub use time::*;
pub use validators::*;
