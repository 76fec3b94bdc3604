//! prodsys — request submission and monitoring for parametric grid jobs.
//!
//! This library contains the data model, the grid backend client, the SQLite
//! store, and the reconciliation engine that drives the Request →
//! ParametricJob → GridJob lifecycle. The `prodsys-monitord` binary wires
//! these together into the periodic monitoring daemon.

pub mod config;
pub mod grid;
pub mod models;
pub mod reconciler;
pub mod store;
pub mod template;

// Re-exports for convenience
pub use config::ProdsysConfig;
pub use grid::{GridEnvelope, GridInterface, GridJobDefinition, create_grid_interface};
pub use models::{GridStatus, LocalStatus, ServiceStatus};
pub use reconciler::Reconciler;
pub use store::{Store, StoreError};
pub use template::{JobTemplate, ScriptTemplate};
