//! Reconciliation engine for the request/parametric-job/grid-job lifecycle.
//!
//! One reconciliation pass per parametric job does, in order: reschedule
//! eligible failed/stalled sub-jobs, poll the backend for every outstanding
//! sub-job (including the just-rescheduled ones), then recompute the parent's
//! aggregate status and counters from the mapped sub-job statuses. Every step
//! tolerates being re-entered from scratch on the next cycle; nothing is kept
//! in memory beyond what the store persists.
//!
//! Grid failures — transport errors and `ok: false` envelopes alike — never
//! propagate past this module. They are logged and the affected sub-jobs keep
//! their prior status until the next cycle.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};

use crate::grid::GridInterface;
use crate::models::{GridJobModel, GridStatus, LocalStatus, ParametricJobModel, RequestModel};
use crate::template::JobTemplate;

/// Remote ids are killed/deleted in chunks of this size during cleanup so a
/// huge parametric job cannot produce an oversized backend call.
const CLEANUP_CHUNK_SIZE: usize = 1000;

/// Sub-jobs in these remote states are polled every cycle. Terminal states
/// (done, failed, stalled, killed, deleted) are not, unless a reschedule puts
/// them back in flight.
const MONITOR_STATUSES: [GridStatus; 9] = [
    GridStatus::Running,
    GridStatus::Received,
    GridStatus::Queued,
    GridStatus::Waiting,
    GridStatus::Checking,
    GridStatus::Matched,
    GridStatus::Unknown,
    GridStatus::Completed,
    GridStatus::Completing,
];

/// Drives submission, monitoring, and cleanup for requests and their
/// parametric jobs against an injected grid backend and job template.
pub struct Reconciler<'a> {
    grid: &'a dyn GridInterface,
    template: &'a dyn JobTemplate,
    max_reschedules: i32,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        grid: &'a dyn GridInterface,
        template: &'a dyn JobTemplate,
        max_reschedules: i32,
    ) -> Self {
        Self {
            grid,
            template,
            max_reschedules,
        }
    }

    /// Submit a parametric job: build its grid job definitions and create one
    /// local grid job record per remote id the backend returns.
    ///
    /// Backend failures are captured here: the job ends up `Failed`, remote
    /// ids already created by earlier definitions of this attempt are
    /// killed/deleted best-effort, and `Ok(())` is returned. Only workspace
    /// staging errors escape as `Err` — `submit_request` treats those as
    /// fatal for the whole request.
    pub async fn submit_parametric_job(&self, job: &mut ParametricJobModel) -> Result<()> {
        let workspace = self
            .template
            .stage()
            .context("Failed to stage submission workspace")?;

        let definitions = match self.template.build(job, &workspace) {
            Ok(definitions) => definitions,
            Err(err) => {
                error!(
                    "Error setting up the parametric job {}.{}: {:#}",
                    job.request_id, job.id, err
                );
                job.set_status(LocalStatus::Failed);
                return Ok(());
            }
        };

        // A huge parametric job is split across definitions; submit each in
        // turn and roll up the returned ids.
        let mut created: Vec<i64> = Vec::new();
        for definition in &definitions {
            let envelope = match self.grid.submit(definition).await {
                Ok(envelope) => envelope,
                Err(err) => {
                    error!(
                        "Error submitting parametric job {}.{}: {:#}",
                        job.request_id, job.id, err
                    );
                    job.set_status(LocalStatus::Failed);
                    self.cleanup_remote(&created).await;
                    return Ok(());
                }
            };

            if !envelope.ok {
                error!(
                    "Grid error submitting parametric job {}.{}: {}",
                    job.request_id,
                    job.id,
                    envelope.message()
                );
                job.set_status(LocalStatus::Failed);
                self.cleanup_remote(&created).await;
                return Ok(());
            }

            created.extend(envelope.value.unwrap_or_default());
        }

        let mut seen = HashSet::new();
        created.retain(|id| seen.insert(*id));

        job.grid_jobs = created
            .iter()
            .map(|&id| GridJobModel::new(id, job.request_id, job.id, job.requester_id))
            .collect();
        job.num_jobs = job.grid_jobs.len() as i64;
        info!(
            "Successfully submitted {} grid job(s) for {}.{}",
            job.num_jobs, job.request_id, job.id
        );
        Ok(())
    }

    /// One monitoring cycle for a parametric job: bulk-update the status of
    /// every owned grid job and recompute the aggregate.
    pub async fn monitor_parametric_job(&self, job: &mut ParametricJobModel) -> Result<()> {
        if job.grid_jobs.is_empty() {
            warn!(
                "No grid jobs associated with parametric job {}.{}, returning status unknown",
                job.request_id, job.id
            );
            job.set_status(LocalStatus::Unknown);
            job.reschedule = false;
            job.num_completed = 0;
            job.num_failed = 0;
            job.num_submitted = 0;
            job.num_running = 0;
            return Ok(());
        }

        // Group sub-jobs by remote status and collect auto-reschedule
        // candidates still under the attempt cap.
        let mut buckets: HashMap<GridStatus, BTreeSet<i64>> = HashMap::new();
        let mut candidates: BTreeSet<i64> = BTreeSet::new();
        for grid_job in &job.grid_jobs {
            buckets.entry(grid_job.status).or_default().insert(grid_job.id);
            if matches!(grid_job.status, GridStatus::Failed | GridStatus::Stalled)
                && grid_job.reschedules < self.max_reschedules
            {
                candidates.insert(grid_job.id);
            }
        }

        // Auto-reschedule only once at least one sibling finished
        // successfully; a uniformly failing batch is left alone rather than
        // thrashed through its attempt budget.
        let mut reschedule_jobs = if buckets.contains_key(&GridStatus::Done) {
            candidates
        } else {
            BTreeSet::new()
        };

        // An explicit operator request overrides both the gate and the cap.
        if job.reschedule {
            reschedule_jobs = BTreeSet::new();
            for status in [GridStatus::Failed, GridStatus::Stalled] {
                if let Some(ids) = buckets.get(&status) {
                    reschedule_jobs.extend(ids.iter().copied());
                }
            }
        }

        let mut monitor_jobs: BTreeSet<i64> = BTreeSet::new();
        for status in MONITOR_STATUSES {
            if let Some(ids) = buckets.get(&status) {
                monitor_jobs.extend(ids.iter().copied());
            }
        }

        // Reschedule before polling so the accepted ids are polled in this
        // same cycle.
        let mut rescheduled: BTreeSet<i64> = BTreeSet::new();
        if !reschedule_jobs.is_empty() {
            info!("Rescheduling grid jobs: {:?}", reschedule_jobs);
            match self.grid.reschedule(&reschedule_jobs).await {
                Err(err) => {
                    error!("Error calling grid to reschedule jobs: {:#}", err);
                }
                Ok(envelope) if !envelope.ok => {
                    error!("Grid failed to reschedule jobs: {}", envelope.message());
                }
                Ok(envelope) => {
                    rescheduled = envelope.value.unwrap_or_default();
                    info!("Rescheduled jobs: {:?}", rescheduled);
                    let skipped: Vec<i64> =
                        reschedule_jobs.difference(&rescheduled).copied().collect();
                    if !skipped.is_empty() {
                        warn!("Failed to reschedule jobs: {:?}", skipped);
                    }
                    monitor_jobs.extend(rescheduled.iter().copied());
                }
            }
        }

        // Skipped candidates keep their status and attempt count; only ids
        // the backend accepted spend an attempt.
        for grid_job in &mut job.grid_jobs {
            if rescheduled.contains(&grid_job.id) {
                grid_job.reschedules += 1;
            }
        }

        let mut monitored: HashMap<i64, String> = HashMap::new();
        debug!("Monitoring grid jobs: {:?}", monitor_jobs);
        if !monitor_jobs.is_empty() {
            match self.grid.get_status(&monitor_jobs).await {
                Err(err) => {
                    error!(
                        "Error calling grid to monitor jobs for parametric job {}.{}: {:#}",
                        job.request_id, job.id, err
                    );
                    job.reschedule = false;
                    return Ok(());
                }
                Ok(envelope) if !envelope.ok => {
                    error!(
                        "Grid failed to get statuses for jobs belonging to parametric job {}.{}: {}",
                        job.request_id,
                        job.id,
                        envelope.message()
                    );
                    job.reschedule = false;
                    return Ok(());
                }
                Ok(envelope) => {
                    monitored = envelope.value.unwrap_or_default();
                    let skipped: Vec<i64> = monitor_jobs
                        .iter()
                        .copied()
                        .filter(|id| !monitored.contains_key(id))
                        .collect();
                    if !skipped.is_empty() {
                        warn!("Couldn't check the status of jobs: {:?}", skipped);
                    }
                }
            }
        }

        // Apply the polled statuses and recompute the aggregate.
        let mut counts: BTreeMap<LocalStatus, i64> = BTreeMap::new();
        for grid_job in &mut job.grid_jobs {
            if let Some(reported) = monitored.get(&grid_job.id) {
                grid_job.status = match reported.parse::<GridStatus>() {
                    Ok(status) => status,
                    Err(_) => {
                        warn!(
                            "Unknown grid status {:?} for job {}. Setting to unknown",
                            reported, grid_job.id
                        );
                        GridStatus::Unknown
                    }
                };
            }
            *counts.entry(grid_job.status.to_local()).or_insert(0) += 1;
        }

        if let Some((&aggregate, _)) = counts.iter().next_back() {
            job.set_status(aggregate);
        }
        job.num_completed = counts.get(&LocalStatus::Completed).copied().unwrap_or(0);
        job.num_failed = counts.get(&LocalStatus::Failed).copied().unwrap_or(0);
        job.num_submitted = counts.get(&LocalStatus::Submitted).copied().unwrap_or(0);
        job.num_running = counts.get(&LocalStatus::Running).copied().unwrap_or(0);
        job.reschedule = false;
        Ok(())
    }

    /// Submit every parametric job of a request, in order.
    ///
    /// Per-job backend failures are captured inside `submit_parametric_job`
    /// and do not stop the siblings; an error escaping a job's submit marks
    /// the whole request `Failed` and stops the iteration.
    pub async fn submit_request(&self, request: &mut RequestModel) {
        info!("Submitting request {}", request.id);
        let request_id = request.id;
        let mut failed = false;
        for job in &mut request.parametric_jobs {
            if let Err(err) = self.submit_parametric_job(job).await {
                error!(
                    "Unhandled error while submitting request {}: {:#}",
                    request_id, err
                );
                failed = true;
                break;
            }
        }
        if failed {
            request.set_status(LocalStatus::Failed);
        }
    }

    /// Monitor every parametric job of a request and recompute the
    /// request-level aggregate status.
    pub async fn monitor_request(&self, request: &mut RequestModel) {
        info!("Monitoring request {}", request.id);
        if request.parametric_jobs.is_empty() {
            warn!(
                "No parametric jobs associated with request {}, returning status unknown",
                request.id
            );
            request.set_status(LocalStatus::Unknown);
            return;
        }

        let mut status = LocalStatus::Unknown;
        for job in &mut request.parametric_jobs {
            if let Err(err) = self.monitor_parametric_job(job).await {
                error!(
                    "Unhandled error monitoring parametric job {}.{}: {:#}",
                    job.request_id, job.id, err
                );
                job.set_status(LocalStatus::Unknown);
            }
            status = status.max(job.status);
        }
        request.set_status(status);
    }

    /// Best-effort remote cleanup for every grid job owned by the request,
    /// ahead of local cascade deletion.
    pub async fn remove_request(&self, request: &RequestModel) {
        for job in &request.parametric_jobs {
            self.remove_parametric_job(job).await;
        }
    }

    /// Best-effort remote cleanup for one parametric job's grid jobs.
    pub async fn remove_parametric_job(&self, job: &ParametricJobModel) {
        if job.grid_jobs.is_empty() {
            return;
        }
        info!(
            "Parametric job {}.{} is being removed, triggering bulk tidy up of grid job(s)",
            job.request_id, job.id
        );
        let ids: Vec<i64> = job.grid_jobs.iter().map(|grid_job| grid_job.id).collect();
        self.cleanup_remote(&ids).await;
    }

    /// Kill and delete the given remote ids in chunks. Failures are logged
    /// and swallowed: local records are removed regardless, accepting
    /// possibly orphaned jobs on the grid.
    async fn cleanup_remote(&self, ids: &[i64]) {
        for chunk in ids.chunks(CLEANUP_CHUNK_SIZE) {
            info!("Killing/deleting {} grid job(s).", chunk.len());

            match self.grid.kill(chunk).await {
                Ok(envelope) if !envelope.ok => {
                    warn!("Grid failed to kill job(s): {}", envelope.message());
                }
                Ok(_) => {}
                Err(err) => {
                    error!(
                        "Error doing grid tidy up of {} job(s). Cleaning up the local system and \
                         forgetting about the (possibly) orphaned jobs on the grid: {:#}",
                        chunk.len(),
                        err
                    );
                    continue;
                }
            }

            match self.grid.delete(chunk).await {
                Ok(envelope) if !envelope.ok => {
                    warn!("Grid failed to delete job(s): {}", envelope.message());
                }
                Ok(_) => {}
                Err(err) => {
                    error!(
                        "Error doing grid tidy up of {} job(s). Cleaning up the local system and \
                         forgetting about the (possibly) orphaned jobs on the grid: {:#}",
                        chunk.len(),
                        err
                    );
                }
            }
        }
    }
}
