//! Core domain model, error types, and reconciliation engine for the
//! PostgreSQL user/role controller. No I/O lives in this crate — `pgsync-k8s`,
//! `pgsync-db`, and `pgsync-state` provide the trait implementations that
//! [`reconciler::Reconciler`] is generic over.

pub mod diff;
pub mod error;
pub mod ident;
pub mod metrics;
pub mod model;
pub mod reconciler;
pub mod traits;

pub use error::ReconcileError;
pub use metrics::MetricsSink;
pub use model::{UserMap, UserRecord};
pub use reconciler::{Reconciler, ReconciliationStats};
pub use traits::{DbGateway, SecretSource, SpecSource, StateStore};
