//! Shared helpers for the integration tests: a scripted fake grid backend,
//! a temp-file-backed store, and model builders.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use prodsys::grid::{GridEnvelope, GridInterface, GridJobDefinition};
use prodsys::models::{GridJobModel, GridStatus, LocalStatus, ParametricJobModel, RequestModel};
use prodsys::store::Store;

/// One recorded call against the fake grid, with the ids it was given.
#[derive(Debug, Clone, PartialEq)]
pub enum GridCall {
    Submit(String),
    GetStatus(Vec<i64>),
    Kill(Vec<i64>),
    Delete(Vec<i64>),
    Reschedule(Vec<i64>),
    Ping,
}

/// A scripted reply: either a transport failure or an envelope.
pub enum Scripted<T> {
    Transport,
    Reply(GridEnvelope<T>),
}

impl<T> Scripted<T> {
    fn take(self) -> Result<GridEnvelope<T>> {
        match self {
            Scripted::Transport => Err(anyhow::anyhow!("connection refused")),
            Scripted::Reply(envelope) => Ok(envelope),
        }
    }
}

/// In-process grid backend with scripted responses and recorded calls.
///
/// Responses are consumed FIFO per operation; an operation with an empty
/// queue succeeds with an empty value.
#[derive(Default)]
pub struct FakeGrid {
    calls: Mutex<Vec<GridCall>>,
    submit_replies: Mutex<VecDeque<Scripted<Vec<i64>>>>,
    status_replies: Mutex<VecDeque<Scripted<HashMap<i64, String>>>>,
    reschedule_replies: Mutex<VecDeque<Scripted<BTreeSet<i64>>>>,
    kill_replies: Mutex<VecDeque<Scripted<()>>>,
    delete_replies: Mutex<VecDeque<Scripted<()>>>,
}

impl FakeGrid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_submit(&self, reply: Scripted<Vec<i64>>) {
        self.submit_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_status(&self, reply: Scripted<HashMap<i64, String>>) {
        self.status_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_reschedule(&self, reply: Scripted<BTreeSet<i64>>) {
        self.reschedule_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_kill(&self, reply: Scripted<()>) {
        self.kill_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_delete(&self, reply: Scripted<()>) {
        self.delete_replies.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> Vec<GridCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls of one kind, in order.
    pub fn calls_of(&self, matches: fn(&GridCall) -> bool) -> Vec<GridCall> {
        self.calls().into_iter().filter(matches).collect()
    }
}

fn pop_or_default<T>(queue: &Mutex<VecDeque<Scripted<T>>>, empty: T) -> Result<GridEnvelope<T>> {
    match queue.lock().unwrap().pop_front() {
        Some(reply) => reply.take(),
        None => Ok(GridEnvelope::success(empty)),
    }
}

#[async_trait]
impl GridInterface for FakeGrid {
    async fn submit(&self, definition: &GridJobDefinition) -> Result<GridEnvelope<Vec<i64>>> {
        self.calls
            .lock()
            .unwrap()
            .push(GridCall::Submit(definition.name.clone()));
        pop_or_default(&self.submit_replies, Vec::new())
    }

    async fn get_status(&self, ids: &BTreeSet<i64>) -> Result<GridEnvelope<HashMap<i64, String>>> {
        self.calls
            .lock()
            .unwrap()
            .push(GridCall::GetStatus(ids.iter().copied().collect()));
        pop_or_default(&self.status_replies, HashMap::new())
    }

    async fn kill(&self, ids: &[i64]) -> Result<GridEnvelope<()>> {
        self.calls.lock().unwrap().push(GridCall::Kill(ids.to_vec()));
        pop_or_default(&self.kill_replies, ())
    }

    async fn delete(&self, ids: &[i64]) -> Result<GridEnvelope<()>> {
        self.calls
            .lock()
            .unwrap()
            .push(GridCall::Delete(ids.to_vec()));
        pop_or_default(&self.delete_replies, ())
    }

    async fn reschedule(&self, ids: &BTreeSet<i64>) -> Result<GridEnvelope<BTreeSet<i64>>> {
        self.calls
            .lock()
            .unwrap()
            .push(GridCall::Reschedule(ids.iter().copied().collect()));
        pop_or_default(&self.reschedule_replies, BTreeSet::new())
    }

    async fn ping(&self) -> Result<bool> {
        self.calls.lock().unwrap().push(GridCall::Ping);
        Ok(true)
    }
}

/// A store backed by a SQLite file in a temp directory; the directory lives
/// as long as this value.
pub struct TestDb {
    _dir: TempDir,
    pub store: Store,
}

pub async fn test_store() -> TestDb {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let url = format!("sqlite:{}", dir.path().join("prodsys-test.db").display());
    let store = Store::connect(&url).await.expect("Failed to open test store");
    TestDb { _dir: dir, store }
}

/// Build a parametric job owning one grid job per `(id, status, reschedules)`
/// triple.
pub fn make_parametric_job(
    request_id: i64,
    id: i64,
    grid_jobs: &[(i64, GridStatus, i32)],
) -> ParametricJobModel {
    let mut job = ParametricJobModel::new(request_id, id, 1);
    job.grid_jobs = grid_jobs
        .iter()
        .map(|&(grid_id, status, reschedules)| {
            let mut grid_job = GridJobModel::new(grid_id, request_id, id, 1);
            grid_job.status = status;
            grid_job.reschedules = reschedules;
            grid_job
        })
        .collect();
    job.num_jobs = job.grid_jobs.len() as i64;
    job
}

/// Build a request in the given status owning the given parametric jobs.
pub fn make_request(id: i64, status: LocalStatus, jobs: Vec<ParametricJobModel>) -> RequestModel {
    let mut request = RequestModel::new(1, Some("test request".to_string()));
    request.id = id;
    request.status = status;
    request.parametric_jobs = jobs;
    request
}
