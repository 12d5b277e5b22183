//! Job manager: registry of live jobs and their per-node tasks
//!
//! The maps are shared by every transaction of the process and are safe for
//! concurrent insert, remove and lookup without outside locking.

use crate::error::{DagError, Result};
use crate::fin::{Fin, FinError, FinKind};
use crate::job::Job;
use crate::operator::Message;
use crate::task::{Task, TaskRun};
use crate::tuple::Tuple;
use dashmap::DashMap;
use futures::Stream;
use futures::StreamExt;
use meridian_common::{JobId, NodeId, TaskId, Timestamp, TxnId};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Options for draining a job
#[derive(Debug, Clone, Copy, Default)]
pub struct IteratorParams {
    /// Unregister the job once its final finish signal has been read
    pub remove_on_finish: bool,
}

pub struct JobManager {
    jobs: DashMap<JobId, Arc<Job>>,
    /// node -> task id -> task
    tasks: DashMap<NodeId, DashMap<TaskId, Arc<Task>>>,
    next_job_id: AtomicU64,
    ids: Arc<AtomicU64>,
}

impl JobManager {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            tasks: DashMap::new(),
            next_job_id: AtomicU64::new(1),
            ids: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create an empty job; tasks are added by the caller, then the job is
    /// registered with [`JobManager::submit`].
    pub fn create_job(&self, start_ts: Timestamp, seq_id: u64, txn_id: TxnId) -> Job {
        let id = JobId::new(self.next_job_id.fetch_add(1, Ordering::SeqCst));
        Job::new(id, start_ts, seq_id, txn_id, self.ids.clone())
    }

    /// Register a fully built job and its tasks
    pub fn submit(&self, job: Job) -> Arc<Job> {
        let job = Arc::new(job);
        for task in job.tasks() {
            self.tasks
                .entry(task.location())
                .or_default()
                .insert(task.id(), task.clone());
        }
        self.jobs.insert(job.id(), job.clone());
        debug!(job = %job.id(), txn_id = %job.txn_id(), tasks = job.tasks().len(), "job submitted");
        job
    }

    pub fn job(&self, id: JobId) -> Option<Arc<Job>> {
        self.jobs.get(&id).map(|entry| entry.value().clone())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Tasks currently registered on a node
    pub fn tasks_on(&self, node: NodeId) -> Vec<Arc<Task>> {
        self.tasks
            .get(&node)
            .map(|tasks| tasks.iter().map(|entry| entry.value().clone()).collect())
            .unwrap_or_default()
    }

    /// Run the job and stream the rows reaching its root vertex.
    ///
    /// Results can be drained once; a second iterator on the same job fails.
    pub async fn create_iterator(
        self: &Arc<Self>,
        job: &Arc<Job>,
        params: IteratorParams,
    ) -> Result<JobIterator> {
        let results = job.take_results()?;
        // Tasks that never initialized report through the root's finish signal
        self.start(job).await?;
        Ok(JobIterator {
            job_id: job.id(),
            results,
            buffered: VecDeque::new(),
            done: false,
            manager: params.remove_on_finish.then(|| self.clone()),
        })
    }

    /// Run a job that has no consumer; the returned handle joins its tasks.
    pub async fn execute(&self, job: &Arc<Job>) -> Result<JobRun> {
        let (runs, failed) = self.start(job).await?;
        Ok(JobRun {
            job_id: job.id(),
            runs,
            failed,
        })
    }

    /// Unregister a job and its tasks
    pub fn remove_job(&self, id: JobId) -> Option<Arc<Job>> {
        let (_, job) = self.jobs.remove(&id)?;
        for task in job.tasks() {
            if let Some(tasks) = self.tasks.get(&task.location()) {
                tasks.remove(&task.id());
            }
        }
        self.tasks.retain(|_, tasks| !tasks.is_empty());
        debug!(job = %id, "job removed");
        Some(job)
    }

    /// Cancel every task of a job
    pub fn cancel(&self, id: JobId) -> Result<()> {
        let job = self.job(id).ok_or(DagError::JobNotFound(id))?;
        for task in job.tasks() {
            task.cancel();
        }
        debug!(job = %id, "job cancelled");
        Ok(())
    }

    /// Run every task of the job. Returns the started runs and the finish
    /// signals of tasks that failed before starting.
    async fn start(&self, job: &Arc<Job>) -> Result<(Vec<TaskRun>, Vec<FinError>)> {
        let mut runs = Vec::with_capacity(job.tasks().len());
        let mut failed = Vec::new();
        for task in job.tasks() {
            if let Err(err) = task.init().await {
                // The run below reports it through the task's finish signal
                warn!(job = %job.id(), task = %task.id(), error = %err, "task init failed");
            }
            match task.run().await {
                Ok(run) => runs.push(run),
                Err(DagError::NotInitialized(task_id)) => {
                    debug!(job = %job.id(), task = %task_id, "uninitialized task failed fast");
                    failed.push(FinError::new(
                        FinKind::Other,
                        format!("task {task_id} was never initialized"),
                    ));
                }
                Err(err) => return Err(err),
            }
        }
        Ok((runs, failed))
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle on a job run without a root consumer
pub struct JobRun {
    job_id: JobId,
    runs: Vec<TaskRun>,
    /// Tasks that failed before any worker started
    failed: Vec<FinError>,
}

impl JobRun {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wait for every started task; returns the first error finish signal,
    /// tasks that never started first.
    pub async fn join(self) -> std::result::Result<(), FinError> {
        let outcomes = futures::future::join_all(self.runs.into_iter().map(TaskRun::join)).await;
        match self.failed.into_iter().chain(outcomes.into_iter().flatten()).next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Lazy, single-pass stream of the rows reaching a job's root vertex.
///
/// Ends after the root's finish signal; an error finish signal is yielded as
/// the last item.
pub struct JobIterator {
    job_id: JobId,
    results: mpsc::UnboundedReceiver<Message>,
    buffered: VecDeque<Tuple>,
    done: bool,
    manager: Option<Arc<JobManager>>,
}

impl JobIterator {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Drain every remaining row
    pub async fn collect_rows(mut self) -> std::result::Result<Vec<Tuple>, FinError> {
        let mut rows = Vec::new();
        while let Some(item) = self.next().await {
            rows.push(item?);
        }
        Ok(rows)
    }

    fn finish(&mut self) {
        self.done = true;
        if let Some(manager) = self.manager.take() {
            manager.remove_job(self.job_id);
        }
    }
}

impl Stream for JobIterator {
    type Item = std::result::Result<Tuple, FinError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(tuple) = this.buffered.pop_front() {
                return Poll::Ready(Some(Ok(tuple)));
            }
            if this.done {
                return Poll::Ready(None);
            }
            match this.results.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Message::Data(batch))) => this.buffered.extend(batch),
                Poll::Ready(Some(Message::Fin(Fin::Ok))) => this.finish(),
                Poll::Ready(Some(Message::Fin(Fin::Err(err)))) => {
                    this.finish();
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.finish();
                    return Poll::Ready(Some(Err(FinError::new(
                        FinKind::Other,
                        format!("job {} result channel closed", this.job_id),
                    ))));
                }
            }
        }
    }
}
