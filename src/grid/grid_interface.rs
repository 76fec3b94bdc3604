//! Trait defining the grid backend capability surface

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use async_trait::async_trait;

use super::common::{GridEnvelope, GridJobDefinition};

/// Capability surface of the remote grid backend.
///
/// Every call is a remote, possibly slow or failing, network operation. An
/// `Err` is a transport failure; an envelope with `ok == false` is an
/// application failure reported by the backend. The reconciler handles both
/// without propagating either past its own boundary.
#[async_trait]
pub trait GridInterface: Send + Sync {
    /// Submit one parametric job definition. On success the envelope carries
    /// the remote ids of the sub-jobs the backend created.
    async fn submit(&self, definition: &GridJobDefinition) -> Result<GridEnvelope<Vec<i64>>>;

    /// Fetch the current status of the given remote ids, as raw backend
    /// status names. The backend may omit ids it could not resolve; callers
    /// must treat omission as "unknown this cycle", not as an error.
    async fn get_status(&self, ids: &BTreeSet<i64>) -> Result<GridEnvelope<HashMap<i64, String>>>;

    /// Kill running sub-jobs. Best-effort, used together with `delete` for
    /// cleanup.
    async fn kill(&self, ids: &[i64]) -> Result<GridEnvelope<()>>;

    /// Delete sub-jobs from the backend's bookkeeping. Best-effort.
    async fn delete(&self, ids: &[i64]) -> Result<GridEnvelope<()>>;

    /// Ask the backend to reschedule the given sub-jobs. The envelope carries
    /// the subset actually rescheduled; the difference was skipped.
    async fn reschedule(&self, ids: &BTreeSet<i64>) -> Result<GridEnvelope<BTreeSet<i64>>>;

    /// Reachability probe for the heartbeat record. `Ok(true)` means the
    /// backend answered healthy, `Ok(false)` that it answered unhealthy; a
    /// transport failure is an `Err`.
    async fn ping(&self) -> Result<bool>;
}
