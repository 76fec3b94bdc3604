//! Data model: status enumerations and the request/parametric-job/grid-job
//! hierarchy tracked in the local store.
//!
//! Both status enums are declared in ascending precedence order so that a
//! plain `max()` over a set of statuses yields the correct roll-up value for
//! the parent record. The order is load-bearing: `Failed` must NOT dominate
//! `Running`/`Submitting`, otherwise a single failed sub-job would mask a
//! batch that is still making progress.

use chrono::{DateTime, Utc};
use log::info;

/// Status of a single sub-job as reported by the remote grid backend.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    Default,
)]
#[serde(rename_all = "lowercase")]
pub enum GridStatus {
    #[default]
    Unknown,
    Deleted,
    Killed,
    Done,
    Completed,
    Failed,
    Stalled,
    Running,
    Submitting,
    Received,
    Queued,
    Waiting,
    Checking,
    Matched,
    Completing,
}

impl GridStatus {
    /// Every variant, in precedence order.
    pub const ALL: [GridStatus; 15] = [
        GridStatus::Unknown,
        GridStatus::Deleted,
        GridStatus::Killed,
        GridStatus::Done,
        GridStatus::Completed,
        GridStatus::Failed,
        GridStatus::Stalled,
        GridStatus::Running,
        GridStatus::Submitting,
        GridStatus::Received,
        GridStatus::Queued,
        GridStatus::Waiting,
        GridStatus::Checking,
        GridStatus::Matched,
        GridStatus::Completing,
    ];

    /// Map this backend status to the local lifecycle status.
    ///
    /// Total: every remote status maps to exactly one local status. Note that
    /// the backend's `Completed`/`Completing` mean "output still being
    /// retrieved" and map to `Running`; only `Done` maps to local `Completed`.
    pub fn to_local(&self) -> LocalStatus {
        match *self {
            GridStatus::Unknown => LocalStatus::Unknown,
            GridStatus::Deleted => LocalStatus::Deleted,
            GridStatus::Killed => LocalStatus::Killed,
            GridStatus::Done => LocalStatus::Completed,
            GridStatus::Completed => LocalStatus::Running,
            GridStatus::Completing => LocalStatus::Running,
            GridStatus::Failed => LocalStatus::Failed,
            GridStatus::Stalled => LocalStatus::Failed,
            GridStatus::Running => LocalStatus::Running,
            GridStatus::Submitting => LocalStatus::Submitting,
            GridStatus::Received => LocalStatus::Submitted,
            GridStatus::Queued => LocalStatus::Submitted,
            GridStatus::Waiting => LocalStatus::Submitted,
            GridStatus::Checking => LocalStatus::Submitted,
            GridStatus::Matched => LocalStatus::Submitted,
        }
    }
}

impl std::fmt::Display for GridStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            GridStatus::Unknown => write!(f, "unknown"),
            GridStatus::Deleted => write!(f, "deleted"),
            GridStatus::Killed => write!(f, "killed"),
            GridStatus::Done => write!(f, "done"),
            GridStatus::Completed => write!(f, "completed"),
            GridStatus::Failed => write!(f, "failed"),
            GridStatus::Stalled => write!(f, "stalled"),
            GridStatus::Running => write!(f, "running"),
            GridStatus::Submitting => write!(f, "submitting"),
            GridStatus::Received => write!(f, "received"),
            GridStatus::Queued => write!(f, "queued"),
            GridStatus::Waiting => write!(f, "waiting"),
            GridStatus::Checking => write!(f, "checking"),
            GridStatus::Matched => write!(f, "matched"),
            GridStatus::Completing => write!(f, "completing"),
        }
    }
}

impl std::str::FromStr for GridStatus {
    type Err = String;

    // Case-insensitive: the backend reports "Done", "Waiting", etc.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unknown" => Ok(GridStatus::Unknown),
            "deleted" => Ok(GridStatus::Deleted),
            "killed" => Ok(GridStatus::Killed),
            "done" => Ok(GridStatus::Done),
            "completed" => Ok(GridStatus::Completed),
            "failed" => Ok(GridStatus::Failed),
            "stalled" => Ok(GridStatus::Stalled),
            "running" => Ok(GridStatus::Running),
            "submitting" => Ok(GridStatus::Submitting),
            "received" => Ok(GridStatus::Received),
            "queued" => Ok(GridStatus::Queued),
            "waiting" => Ok(GridStatus::Waiting),
            "checking" => Ok(GridStatus::Checking),
            "matched" => Ok(GridStatus::Matched),
            "completing" => Ok(GridStatus::Completing),
            _ => Err(format!("Invalid grid status: {}", s)),
        }
    }
}

/// Lifecycle status of a request or parametric job in the local store.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LocalStatus {
    #[default]
    Requested,
    Unknown,
    Deleted,
    Killed,
    Completed,
    Failed,
    Approved,
    Submitted,
    Submitting,
    Running,
    Removing,
    // Checked/Closed belong to the request sign-off flow; the reconciler
    // never produces them but the store must round-trip them.
    Checked,
    Closed,
}

impl LocalStatus {
    /// Every variant, in precedence order.
    pub const ALL: [LocalStatus; 13] = [
        LocalStatus::Requested,
        LocalStatus::Unknown,
        LocalStatus::Deleted,
        LocalStatus::Killed,
        LocalStatus::Completed,
        LocalStatus::Failed,
        LocalStatus::Approved,
        LocalStatus::Submitted,
        LocalStatus::Submitting,
        LocalStatus::Running,
        LocalStatus::Removing,
        LocalStatus::Checked,
        LocalStatus::Closed,
    ];
}

impl std::fmt::Display for LocalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            LocalStatus::Requested => write!(f, "requested"),
            LocalStatus::Unknown => write!(f, "unknown"),
            LocalStatus::Deleted => write!(f, "deleted"),
            LocalStatus::Killed => write!(f, "killed"),
            LocalStatus::Completed => write!(f, "completed"),
            LocalStatus::Failed => write!(f, "failed"),
            LocalStatus::Approved => write!(f, "approved"),
            LocalStatus::Submitted => write!(f, "submitted"),
            LocalStatus::Submitting => write!(f, "submitting"),
            LocalStatus::Running => write!(f, "running"),
            LocalStatus::Removing => write!(f, "removing"),
            LocalStatus::Checked => write!(f, "checked"),
            LocalStatus::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for LocalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "requested" => Ok(LocalStatus::Requested),
            "unknown" => Ok(LocalStatus::Unknown),
            "deleted" => Ok(LocalStatus::Deleted),
            "killed" => Ok(LocalStatus::Killed),
            "completed" => Ok(LocalStatus::Completed),
            "failed" => Ok(LocalStatus::Failed),
            "approved" => Ok(LocalStatus::Approved),
            "submitted" => Ok(LocalStatus::Submitted),
            "submitting" => Ok(LocalStatus::Submitting),
            "running" => Ok(LocalStatus::Running),
            "removing" => Ok(LocalStatus::Removing),
            "checked" => Ok(LocalStatus::Checked),
            "closed" => Ok(LocalStatus::Closed),
            _ => Err(format!("Invalid local status: {}", s)),
        }
    }
}

/// Heartbeat status of a long-running process, written every monitoring cycle
/// and read by dashboards. Consumers treat a record whose timestamp is older
/// than ~30 minutes as equivalent to `Down`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Unknown,
    Down,
    Up,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ServiceStatus::Unknown => write!(f, "unknown"),
            ServiceStatus::Down => write!(f, "down"),
            ServiceStatus::Up => write!(f, "up"),
        }
    }
}

impl std::str::FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unknown" => Ok(ServiceStatus::Unknown),
            "down" => Ok(ServiceStatus::Down),
            "up" => Ok(ServiceStatus::Up),
            _ => Err(format!("Invalid service status: {}", s)),
        }
    }
}

/// One sub-job tracked locally, mirroring a single remote grid job id.
///
/// Created only from a successful submission; destroyed when its parent
/// parametric job is destroyed or when it is killed/deleted remotely and
/// locally in lockstep. The id is assigned by the grid backend.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GridJobModel {
    pub id: i64,
    pub request_id: i64,
    pub parametricjob_id: i64,
    pub requester_id: i64,
    pub status: GridStatus,
    /// Number of reschedule attempts already spent on this sub-job.
    pub reschedules: i32,
}

impl GridJobModel {
    pub fn new(id: i64, request_id: i64, parametricjob_id: i64, requester_id: i64) -> Self {
        Self {
            id,
            request_id,
            parametricjob_id,
            requester_id,
            status: GridStatus::Unknown,
            reschedules: 0,
        }
    }
}

/// A batch of parametrically-identical tasks submitted together.
///
/// Identified by (request_id, id) where id is a per-request sequence number.
/// Owns its grid job records; counters and status are recomputed from them on
/// every monitoring cycle.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ParametricJobModel {
    pub request_id: i64,
    pub id: i64,
    pub requester_id: i64,
    pub priority: i16,
    pub site: String,
    pub status: LocalStatus,
    /// Manual reschedule flag, set by an operator and cleared by the next
    /// successful monitoring cycle.
    pub reschedule: bool,
    pub num_jobs: i64,
    pub num_completed: i64,
    pub num_failed: i64,
    pub num_submitted: i64,
    pub num_running: i64,
    pub timestamp: DateTime<Utc>,
    pub grid_jobs: Vec<GridJobModel>,
}

impl ParametricJobModel {
    pub fn new(request_id: i64, id: i64, requester_id: i64) -> Self {
        Self {
            request_id,
            id,
            requester_id,
            priority: 3,
            site: "ANY".to_string(),
            status: LocalStatus::Requested,
            reschedule: false,
            num_jobs: 0,
            num_completed: 0,
            num_failed: 0,
            num_submitted: 0,
            num_running: 0,
            timestamp: Utc::now(),
            grid_jobs: Vec::new(),
        }
    }

    /// Number of jobs in states other than the four counted ones.
    pub fn num_other(&self) -> i64 {
        self.num_jobs
            - (self.num_submitted + self.num_running + self.num_failed + self.num_completed)
    }

    /// Set the status, logging the transition when the value changes.
    pub fn set_status(&mut self, status: LocalStatus) {
        if self.status != status {
            info!(
                "Parametric job {}.{} transitioned from status {} to {}",
                self.request_id, self.id, self.status, status
            );
            self.status = status;
        }
    }
}

/// A top-level user submission, owning an ordered collection of parametric
/// jobs. Status is the precedence maximum over the owned jobs' statuses.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RequestModel {
    pub id: i64,
    pub requester_id: i64,
    pub description: Option<String>,
    pub request_date: DateTime<Utc>,
    pub status: LocalStatus,
    pub timestamp: DateTime<Utc>,
    pub parametric_jobs: Vec<ParametricJobModel>,
}

impl RequestModel {
    pub fn new(requester_id: i64, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            requester_id,
            description,
            request_date: now,
            status: LocalStatus::Requested,
            timestamp: now,
            parametric_jobs: Vec::new(),
        }
    }

    /// Set the status, logging the transition when the value changes.
    pub fn set_status(&mut self, status: LocalStatus) {
        if self.status != status {
            info!(
                "Request {} transitioned from status {} to {}",
                self.id, self.status, status
            );
            self.status = status;
        }
    }
}

/// Liveness record for a long-running process.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServiceModel {
    pub id: i64,
    pub name: String,
    pub status: ServiceStatus,
    pub timestamp: DateTime<Utc>,
}
