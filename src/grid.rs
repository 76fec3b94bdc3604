//! Grid backend client
//!
//! This module provides the narrow, explicitly-typed interface to the remote
//! grid gateway: submit, status polling, kill/delete cleanup, and reschedule,
//! all addressed by opaque remote job ids. The concrete implementation is
//! selected by configuration at construction time.

pub mod common;
pub mod grid_interface;
pub mod rest_interface;

pub use common::{GridEnvelope, GridJobDefinition, GridType};
pub use grid_interface::GridInterface;
pub use rest_interface::RestGridInterface;

use anyhow::Result;

use crate::config::GridConfig;

/// Factory function to create a grid interface based on the configured type
pub fn create_grid_interface(config: &GridConfig) -> Result<Box<dyn GridInterface>> {
    match config.backend {
        GridType::Rest => Ok(Box::new(RestGridInterface::new(
            &config.url,
            config.timeout_secs,
        )?)),
        GridType::Fake => Err(anyhow::anyhow!(
            "Fake grid backend is only available to tests"
        )),
    }
}
