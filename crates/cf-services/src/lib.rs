//! # cf-services
//!
//! The access-control and issue-workflow engine. Every operation takes an
//! explicit [`Session`] and returns `cf_core::Result`; nothing here renders,
//! routes or notifies.

pub mod accounts;
pub mod authz;
pub mod engine;
pub mod entitlement;
pub mod payments;
pub mod session;
pub mod timeline;
pub mod workflow;

pub use engine::{Engine, EngineSettings};
pub use payments::PaymentSettings;
pub use session::Session;

use cf_core::error::{AppError, Result};

/// Collapses any store failure into `Unavailable`, logging the cause once.
pub(crate) trait StoreResultExt<T> {
    fn or_unavailable(self, operation: &'static str) -> Result<T>;
}

impl<T> StoreResultExt<T> for anyhow::Result<T> {
    fn or_unavailable(self, operation: &'static str) -> Result<T> {
        self.map_err(|err| {
            tracing::error!(operation, error = %err, "backing store failure");
            AppError::Unavailable(format!("{operation}: backing store unavailable"))
        })
    }
}
