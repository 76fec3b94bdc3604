mod common;

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;

use common::{FakeGrid, GridCall, Scripted, make_parametric_job, make_request};
use prodsys::config::ParametricJobsConfig;
use prodsys::grid::GridEnvelope;
use prodsys::models::{GridStatus, LocalStatus, ParametricJobModel};
use prodsys::reconciler::Reconciler;
use prodsys::template::{JobTemplate, ScriptTemplate, StagedWorkspace};

const MAX_RESCHEDULES: i32 = 2;

fn default_template() -> ScriptTemplate {
    ScriptTemplate::new(&ParametricJobsConfig::default())
}

fn split_template(max_jobs_per_definition: usize) -> ScriptTemplate {
    let mut config = ParametricJobsConfig::default();
    config.max_jobs_per_definition = max_jobs_per_definition;
    ScriptTemplate::new(&config)
}

/// Template whose staging always fails, standing in for an unusable
/// submission workspace (full disk, unwritable temp directory).
struct BrokenTemplate;

impl JobTemplate for BrokenTemplate {
    fn stage(&self) -> Result<StagedWorkspace> {
        anyhow::bail!("no space left on device")
    }

    fn build(
        &self,
        _job: &ParametricJobModel,
        _workspace: &StagedWorkspace,
    ) -> Result<Vec<prodsys::grid::GridJobDefinition>> {
        unreachable!("staging always fails")
    }
}

fn status_reply(entries: &[(i64, &str)]) -> Scripted<HashMap<i64, String>> {
    Scripted::Reply(GridEnvelope::success(
        entries
            .iter()
            .map(|&(id, status)| (id, status.to_string()))
            .collect(),
    ))
}

fn reschedule_reply(ids: &[i64]) -> Scripted<BTreeSet<i64>> {
    Scripted::Reply(GridEnvelope::success(ids.iter().copied().collect()))
}

// ============== submit ==============

#[tokio::test]
async fn test_submit_creates_one_grid_job_per_returned_id() {
    let grid = FakeGrid::new();
    grid.push_submit(Scripted::Reply(GridEnvelope::success(vec![101, 102, 103])));
    let template = default_template();
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let mut job = make_parametric_job(1, 1, &[]);
    job.num_jobs = 0;
    job.status = LocalStatus::Submitting;
    reconciler.submit_parametric_job(&mut job).await.unwrap();

    assert_eq!(job.num_jobs, 3);
    let ids: Vec<i64> = job.grid_jobs.iter().map(|grid_job| grid_job.id).collect();
    assert_eq!(ids, vec![101, 102, 103]);
    for grid_job in &job.grid_jobs {
        assert_eq!(grid_job.status, GridStatus::Unknown);
        assert_eq!(grid_job.reschedules, 0);
    }
    // Submit never advances the status by itself; only monitor does.
    assert_eq!(job.status, LocalStatus::Submitting);
}

#[tokio::test]
async fn test_submit_failure_cleans_up_earlier_definitions() {
    let grid = FakeGrid::new();
    grid.push_submit(Scripted::Reply(GridEnvelope::success(vec![11, 12])));
    grid.push_submit(Scripted::Reply(GridEnvelope::failure("quota exceeded")));
    // Splitting 4 jobs at 2 per definition produces two submit calls.
    let template = split_template(2);
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let mut job = make_parametric_job(1, 1, &[]);
    job.num_jobs = 4;
    reconciler.submit_parametric_job(&mut job).await.unwrap();

    assert_eq!(job.status, LocalStatus::Failed);
    assert!(job.grid_jobs.is_empty());
    let calls = grid.calls();
    assert!(calls.contains(&GridCall::Kill(vec![11, 12])));
    assert!(calls.contains(&GridCall::Delete(vec![11, 12])));
}

#[tokio::test]
async fn test_submit_transport_failure_without_created_jobs() {
    let grid = FakeGrid::new();
    grid.push_submit(Scripted::Transport);
    let template = default_template();
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let mut job = make_parametric_job(1, 1, &[]);
    reconciler.submit_parametric_job(&mut job).await.unwrap();

    assert_eq!(job.status, LocalStatus::Failed);
    // Nothing was created, so nothing to clean up.
    assert!(grid.calls_of(|c| matches!(c, GridCall::Kill(_))).is_empty());
    assert!(grid.calls_of(|c| matches!(c, GridCall::Delete(_))).is_empty());
}

// ============== monitor ==============

#[tokio::test]
async fn test_monitor_empty_job_resets_state() {
    let grid = FakeGrid::new();
    let template = default_template();
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let mut job = make_parametric_job(1, 1, &[]);
    job.status = LocalStatus::Running;
    job.reschedule = true;
    job.num_completed = 4;
    job.num_running = 2;
    reconciler.monitor_parametric_job(&mut job).await.unwrap();

    assert_eq!(job.status, LocalStatus::Unknown);
    assert!(!job.reschedule);
    assert_eq!(job.num_completed, 0);
    assert_eq!(job.num_failed, 0);
    assert_eq!(job.num_submitted, 0);
    assert_eq!(job.num_running, 0);
    assert!(grid.calls().is_empty());
}

#[tokio::test]
async fn test_monitor_reschedules_failed_job_when_sibling_done() {
    // Scenario: [done, failed, running] -> the failed id is rescheduled,
    // polled in the same cycle, and the aggregate lands on running.
    let grid = FakeGrid::new();
    grid.push_reschedule(reschedule_reply(&[102]));
    grid.push_status(status_reply(&[
        (101, "Done"),
        (102, "Queued"),
        (103, "Running"),
    ]));
    let template = default_template();
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let mut job = make_parametric_job(1, 1, &[
        (101, GridStatus::Done, 0),
        (102, GridStatus::Failed, 0),
        (103, GridStatus::Running, 0),
    ]);
    reconciler.monitor_parametric_job(&mut job).await.unwrap();

    assert_eq!(
        grid.calls_of(|c| matches!(c, GridCall::Reschedule(_))),
        vec![GridCall::Reschedule(vec![102])]
    );
    // The rescheduled id is polled in this same cycle, alongside the running
    // one. The done sibling is terminal and not polled.
    assert_eq!(
        grid.calls_of(|c| matches!(c, GridCall::GetStatus(_))),
        vec![GridCall::GetStatus(vec![102, 103])]
    );

    let rescheduled = job.grid_jobs.iter().find(|g| g.id == 102).unwrap();
    assert_eq!(rescheduled.reschedules, 1);
    assert_eq!(rescheduled.status, GridStatus::Queued);

    assert_eq!(job.status, LocalStatus::Running);
    assert_eq!(job.num_completed, 1);
    assert_eq!(job.num_submitted, 1);
    assert_eq!(job.num_running, 1);
    assert_eq!(job.num_failed, 0);
    assert!(!job.reschedule);
}

#[tokio::test]
async fn test_monitor_does_not_reschedule_without_done_sibling() {
    let grid = FakeGrid::new();
    grid.push_status(status_reply(&[(3, "Running")]));
    let template = default_template();
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let mut job = make_parametric_job(1, 1, &[
        (1, GridStatus::Failed, 0),
        (2, GridStatus::Failed, 0),
        (3, GridStatus::Running, 0),
    ]);
    reconciler.monitor_parametric_job(&mut job).await.unwrap();

    assert!(grid.calls_of(|c| matches!(c, GridCall::Reschedule(_))).is_empty());
    for grid_job in &job.grid_jobs {
        assert_eq!(grid_job.reschedules, 0);
    }
    // failed < running in the precedence order
    assert_eq!(job.status, LocalStatus::Running);
}

#[tokio::test]
async fn test_monitor_respects_reschedule_cap() {
    let grid = FakeGrid::new();
    let template = default_template();
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let mut job = make_parametric_job(1, 1, &[
        (1, GridStatus::Failed, MAX_RESCHEDULES),
        (2, GridStatus::Done, 0),
    ]);
    reconciler.monitor_parametric_job(&mut job).await.unwrap();

    // The only failed id is at the attempt cap, so no reschedule happens
    // even though a sibling is done.
    assert!(grid.calls_of(|c| matches!(c, GridCall::Reschedule(_))).is_empty());
    assert_eq!(job.grid_jobs[0].reschedules, MAX_RESCHEDULES);
}

#[tokio::test]
async fn test_manual_reschedule_overrides_gate_and_cap() {
    let grid = FakeGrid::new();
    grid.push_reschedule(reschedule_reply(&[1, 2]));
    grid.push_status(status_reply(&[(1, "Queued"), (2, "Queued"), (3, "Running")]));
    let template = default_template();
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    // No done sibling, and id 1 is over the cap: the manual flag overrides
    // both conditions.
    let mut job = make_parametric_job(1, 1, &[
        (1, GridStatus::Failed, 5),
        (2, GridStatus::Stalled, 0),
        (3, GridStatus::Running, 0),
    ]);
    job.reschedule = true;
    reconciler.monitor_parametric_job(&mut job).await.unwrap();

    assert_eq!(
        grid.calls_of(|c| matches!(c, GridCall::Reschedule(_))),
        vec![GridCall::Reschedule(vec![1, 2])]
    );
    assert_eq!(job.grid_jobs[0].reschedules, 6);
    assert_eq!(job.grid_jobs[1].reschedules, 1);
    assert!(!job.reschedule);
}

#[tokio::test]
async fn test_monitor_skipped_reschedules_spend_no_attempt() {
    let grid = FakeGrid::new();
    // Backend accepts only one of the two candidates.
    grid.push_reschedule(reschedule_reply(&[1]));
    grid.push_status(status_reply(&[(1, "Queued"), (3, "Done")]));
    let template = default_template();
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let mut job = make_parametric_job(1, 1, &[
        (1, GridStatus::Failed, 0),
        (2, GridStatus::Stalled, 0),
        (3, GridStatus::Done, 0),
    ]);
    reconciler.monitor_parametric_job(&mut job).await.unwrap();

    assert_eq!(job.grid_jobs[0].reschedules, 1);
    // The skipped id keeps its status and attempt count for the next cycle.
    assert_eq!(job.grid_jobs[1].reschedules, 0);
    assert_eq!(job.grid_jobs[1].status, GridStatus::Stalled);
}

#[tokio::test]
async fn test_monitor_reschedule_failure_defers_to_next_cycle() {
    let grid = FakeGrid::new();
    grid.push_reschedule(Scripted::Transport);
    let template = default_template();
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let mut job = make_parametric_job(1, 1, &[
        (1, GridStatus::Failed, 0),
        (2, GridStatus::Done, 0),
    ]);
    reconciler.monitor_parametric_job(&mut job).await.unwrap();

    // No attempt spent, no id added to the poll set; both sub-jobs are
    // terminal so no status call happens at all this cycle.
    assert_eq!(job.grid_jobs[0].reschedules, 0);
    assert_eq!(job.grid_jobs[0].status, GridStatus::Failed);
    assert!(grid.calls_of(|c| matches!(c, GridCall::GetStatus(_))).is_empty());
    // Aggregation still runs over the unchanged statuses.
    assert_eq!(job.status, LocalStatus::Failed);
    assert_eq!(job.num_failed, 1);
    assert_eq!(job.num_completed, 1);
}

#[tokio::test]
async fn test_monitor_poll_transport_failure_leaves_state_untouched() {
    let grid = FakeGrid::new();
    grid.push_status(Scripted::Transport);
    let template = default_template();
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let mut job = make_parametric_job(1, 1, &[
        (1, GridStatus::Running, 0),
        (2, GridStatus::Queued, 0),
    ]);
    job.status = LocalStatus::Running;
    job.reschedule = true;
    job.num_running = 1;
    job.num_submitted = 1;

    reconciler.monitor_parametric_job(&mut job).await.unwrap();

    // The flag is forced off; everything else is exactly as before the call.
    assert!(!job.reschedule);
    assert_eq!(job.status, LocalStatus::Running);
    assert_eq!(job.num_running, 1);
    assert_eq!(job.num_submitted, 1);
    assert_eq!(job.grid_jobs[0].status, GridStatus::Running);
    assert_eq!(job.grid_jobs[1].status, GridStatus::Queued);
}

#[tokio::test]
async fn test_monitor_poll_application_failure_leaves_state_untouched() {
    let grid = FakeGrid::new();
    grid.push_status(Scripted::Reply(GridEnvelope::failure("service busy")));
    let template = default_template();
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let mut job = make_parametric_job(1, 1, &[(1, GridStatus::Running, 0)]);
    job.status = LocalStatus::Running;
    job.reschedule = true;

    reconciler.monitor_parametric_job(&mut job).await.unwrap();

    assert!(!job.reschedule);
    assert_eq!(job.status, LocalStatus::Running);
    assert_eq!(job.grid_jobs[0].status, GridStatus::Running);
}

#[tokio::test]
async fn test_monitor_unknown_status_string_falls_back_to_unknown() {
    let grid = FakeGrid::new();
    grid.push_status(status_reply(&[(1, "Sparkling")]));
    let template = default_template();
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let mut job = make_parametric_job(1, 1, &[(1, GridStatus::Running, 0)]);
    reconciler.monitor_parametric_job(&mut job).await.unwrap();

    assert_eq!(job.grid_jobs[0].status, GridStatus::Unknown);
    assert_eq!(job.status, LocalStatus::Unknown);
}

#[tokio::test]
async fn test_monitor_omitted_ids_keep_prior_status() {
    let grid = FakeGrid::new();
    // The backend resolves only one of the two polled ids.
    grid.push_status(status_reply(&[(1, "Done")]));
    let template = default_template();
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let mut job = make_parametric_job(1, 1, &[
        (1, GridStatus::Running, 0),
        (2, GridStatus::Waiting, 0),
    ]);
    reconciler.monitor_parametric_job(&mut job).await.unwrap();

    assert_eq!(job.grid_jobs[0].status, GridStatus::Done);
    assert_eq!(job.grid_jobs[1].status, GridStatus::Waiting);
    // completed < submitted in the precedence order, so the waiting job wins.
    assert_eq!(job.status, LocalStatus::Submitted);
    assert_eq!(job.num_completed, 1);
    assert_eq!(job.num_submitted, 1);
}

// ============== request level ==============

#[tokio::test]
async fn test_monitor_request_without_jobs_is_unknown() {
    let grid = FakeGrid::new();
    let template = default_template();
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let mut request = make_request(1, LocalStatus::Running, Vec::new());
    reconciler.monitor_request(&mut request).await;
    assert_eq!(request.status, LocalStatus::Unknown);
}

#[tokio::test]
async fn test_monitor_request_aggregates_max_over_jobs() {
    let grid = FakeGrid::new();
    // First job polls its running sub-job; second job is all failed with no
    // done sibling, so it makes no grid calls at all.
    grid.push_status(status_reply(&[(1, "Running")]));
    let template = default_template();
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let mut request = make_request(
        1,
        LocalStatus::Submitted,
        vec![
            make_parametric_job(1, 1, &[(1, GridStatus::Running, 0)]),
            make_parametric_job(1, 2, &[(2, GridStatus::Failed, 3)]),
        ],
    );
    reconciler.monitor_request(&mut request).await;

    assert_eq!(request.parametric_jobs[0].status, LocalStatus::Running);
    assert_eq!(request.parametric_jobs[1].status, LocalStatus::Failed);
    assert_eq!(request.status, LocalStatus::Running);
}

#[tokio::test]
async fn test_submit_request_isolates_captured_job_failures() {
    let grid = FakeGrid::new();
    // First parametric job fails at the backend, second succeeds; the
    // failure is captured per-job and does not stop the sibling.
    grid.push_submit(Scripted::Reply(GridEnvelope::failure("bad definition")));
    grid.push_submit(Scripted::Reply(GridEnvelope::success(vec![21])));
    let template = default_template();
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let mut request = make_request(
        1,
        LocalStatus::Submitting,
        vec![make_parametric_job(1, 1, &[]), make_parametric_job(1, 2, &[])],
    );
    reconciler.submit_request(&mut request).await;

    assert_eq!(request.parametric_jobs[0].status, LocalStatus::Failed);
    assert_eq!(request.parametric_jobs[1].grid_jobs.len(), 1);
    // The request itself is not failed; the next monitor pass aggregates.
    assert_eq!(request.status, LocalStatus::Submitting);
}

#[tokio::test]
async fn test_submit_request_aborts_on_staging_error() {
    let grid = FakeGrid::new();
    let template = BrokenTemplate;
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let mut request = make_request(
        1,
        LocalStatus::Submitting,
        vec![make_parametric_job(1, 1, &[]), make_parametric_job(1, 2, &[])],
    );
    reconciler.submit_request(&mut request).await;

    // An error escaping a job's submit fails the whole request and stops the
    // iteration before the second job is touched.
    assert_eq!(request.status, LocalStatus::Failed);
    assert!(grid.calls().is_empty());
}

// ============== removal ==============

#[tokio::test]
async fn test_remove_request_cleans_up_every_grid_job() {
    let grid = FakeGrid::new();
    // Kill of the first batch fails at the transport level; removal carries
    // on regardless.
    grid.push_kill(Scripted::Transport);
    let template = default_template();
    let reconciler = Reconciler::new(&grid, &template, MAX_RESCHEDULES);

    let request = make_request(
        1,
        LocalStatus::Removing,
        vec![
            make_parametric_job(1, 1, &[
                (1, GridStatus::Running, 0),
                (2, GridStatus::Done, 0),
                (3, GridStatus::Failed, 0),
            ]),
            make_parametric_job(1, 2, &[
                (4, GridStatus::Queued, 0),
                (5, GridStatus::Waiting, 0),
                (6, GridStatus::Stalled, 0),
            ]),
        ],
    );
    reconciler.remove_request(&request).await;

    let kills = grid.calls_of(|c| matches!(c, GridCall::Kill(_)));
    assert_eq!(
        kills,
        vec![GridCall::Kill(vec![1, 2, 3]), GridCall::Kill(vec![4, 5, 6])]
    );
    // The failed kill skips its delete; the second batch is fully tidied.
    let deletes = grid.calls_of(|c| matches!(c, GridCall::Delete(_)));
    assert_eq!(deletes, vec![GridCall::Delete(vec![4, 5, 6])]);
}
