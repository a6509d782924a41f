//! # cf-core
//!
//! Domain models, port traits and the error type shared by every Civic-Fix
//! crate. Nothing in here performs I/O.

pub mod error;
pub mod models;
pub mod traits;

// Re-exporting for easier access in other crates
pub use error::*;
pub use models::*;
pub use traits::*;
