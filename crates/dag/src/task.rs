//! Task: the slice of a job that runs on one node
//!
//! A task owns a graph of vertices. `run` spawns one worker per source vertex
//! and returns at once; completion is observed through the [`TaskRun`] join
//! handle, which waits on a countdown barrier over those workers.

use crate::error::{DagError, Result};
use crate::fin::{FinError, FinKind};
use crate::latch::CountDownLatch;
use crate::operator::{Exchange, Operator};
use crate::vertex::Vertex;
use meridian_common::{JobId, NodeId, TaskId, Timestamp, VertexId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span};

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Built, operators not initialized yet
    Born,
    /// Initialized and idle
    Ready,
    Running,
    /// Last run ended with an error finish signal
    Stopped,
    /// Cancelled; rejects runs until reset
    Cancel,
}

/// State shared by every vertex of a task while it runs
#[derive(Debug)]
pub struct TaskContext {
    job_id: JobId,
    task_id: TaskId,
    location: NodeId,
    start_ts: Timestamp,
    cancelled: AtomicBool,
    first_error: Mutex<Option<FinError>>,
}

impl TaskContext {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn location(&self) -> NodeId {
        self.location
    }

    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    /// Checked by source workers between batches
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// First error finish signal raised in the current run
    pub fn first_error(&self) -> Option<FinError> {
        self.first_error.lock().clone()
    }

    pub(crate) fn record_error(&self, err: &FinError) {
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some(err.clone());
        }
    }
}

/// Counts the worker down even if it unwinds
struct LatchGuard(Arc<CountDownLatch>);

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.0.count_down();
    }
}

pub struct Task {
    id: TaskId,
    location: NodeId,
    vertices: Vec<Arc<Vertex>>,
    source_run_list: Vec<Arc<Vertex>>,
    ctx: Arc<TaskContext>,
    status: Mutex<TaskStatus>,
    initialized: AtomicBool,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn job_id(&self) -> JobId {
        self.ctx.job_id
    }

    pub fn location(&self) -> NodeId {
        self.location
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock()
    }

    pub fn vertices(&self) -> &[Arc<Vertex>] {
        &self.vertices
    }

    pub fn source_run_list(&self) -> &[Arc<Vertex>] {
        &self.source_run_list
    }

    /// Initialize every operator; the task becomes `Ready` on success.
    pub async fn init(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        for vertex in &self.vertices {
            vertex
                .init(&self.ctx)
                .await
                .map_err(|source| DagError::InitFailed {
                    task: self.id,
                    source,
                })?;
        }
        self.initialized.store(true, Ordering::SeqCst);

        let mut status = self.status.lock();
        if *status == TaskStatus::Born {
            *status = TaskStatus::Ready;
        }
        Ok(())
    }

    /// Start one worker per source vertex.
    ///
    /// A second call while running is rejected. A task that was never
    /// initialized starts nothing: it sends an error finish signal from its
    /// first source so the consumers downstream still terminate.
    pub async fn run(self: &Arc<Self>) -> Result<TaskRun> {
        let previous = {
            let mut status = self.status.lock();
            let previous = *status;
            if matches!(previous, TaskStatus::Ready | TaskStatus::Stopped) {
                *status = TaskStatus::Running;
            }
            previous
        };

        match previous {
            TaskStatus::Running => return Err(DagError::AlreadyRunning(self.id)),
            TaskStatus::Cancel => return Err(DagError::Cancelled(self.id)),
            TaskStatus::Born => {
                if let Some(first) = self.source_run_list.first() {
                    let err = FinError::new(
                        FinKind::Other,
                        format!("task {} was never initialized", self.id),
                    );
                    first.fail(&self.ctx, err).await;
                }
                return Err(DagError::NotInitialized(self.id));
            }
            TaskStatus::Ready | TaskStatus::Stopped => {}
        }

        for vertex in &self.vertices {
            vertex.reset();
        }
        *self.ctx.first_error.lock() = None;

        let latch = Arc::new(CountDownLatch::new(self.source_run_list.len()));
        for source in &self.source_run_list {
            let source = source.clone();
            let ctx = self.ctx.clone();
            let guard = LatchGuard(latch.clone());
            let span = info_span!("source", task = %self.id, vertex = %source.id(), kind = source.kind());
            tokio::spawn(
                async move {
                    let _guard = guard;
                    source.run_source(&ctx).await;
                }
                .instrument(span),
            );
        }

        let task = self.clone();
        let monitor = tokio::spawn(async move {
            latch.wait().await;
            let error = task.ctx.first_error();
            task.end_run(error.is_some());
            error
        });

        debug!(task = %self.id, sources = self.source_run_list.len(), "task started");
        Ok(TaskRun {
            task: self.clone(),
            monitor,
        })
    }

    /// Mark the task cancelled; running sources stop at their next batch.
    pub fn cancel(&self) {
        self.ctx.cancelled.store(true, Ordering::SeqCst);
        *self.status.lock() = TaskStatus::Cancel;
        debug!(task = %self.id, "task cancelled");
    }

    /// Clear a cancellation so the task can run again.
    pub fn reset(&self) -> Result<()> {
        let mut status = self.status.lock();
        if *status == TaskStatus::Running {
            return Err(DagError::AlreadyRunning(self.id));
        }
        self.ctx.cancelled.store(false, Ordering::SeqCst);
        *status = if self.initialized.load(Ordering::SeqCst) {
            TaskStatus::Ready
        } else {
            TaskStatus::Born
        };
        Ok(())
    }

    fn end_run(&self, failed: bool) {
        let mut status = self.status.lock();
        if *status == TaskStatus::Running {
            *status = if failed {
                TaskStatus::Stopped
            } else {
                TaskStatus::Ready
            };
        }
        debug!(task = %self.id, failed, "task run ended");
    }

    fn acknowledge_stop(&self) {
        let mut status = self.status.lock();
        if *status == TaskStatus::Stopped {
            *status = TaskStatus::Ready;
        }
    }
}

/// Join handle of one task run
pub struct TaskRun {
    task: Arc<Task>,
    monitor: JoinHandle<Option<FinError>>,
}

impl TaskRun {
    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    /// Wait for every source worker; returns the first error finish signal.
    ///
    /// A stopped task returns to `Ready` once its failure has been joined.
    pub async fn join(self) -> Option<FinError> {
        let error = match self.monitor.await {
            Ok(error) => error,
            Err(err) => Some(FinError::new(
                FinKind::Other,
                format!("task {} monitor failed: {}", self.task.id, err),
            )),
        };
        self.task.acknowledge_stop();
        error
    }
}

struct PendingVertex {
    id: VertexId,
    op: Arc<dyn Operator>,
    outputs: Vec<usize>,
}

/// Assembles the vertex graph of one task.
pub struct TaskBuilder {
    id: TaskId,
    job_id: JobId,
    location: NodeId,
    start_ts: Timestamp,
    ids: Arc<AtomicU64>,
    vertices: Vec<PendingVertex>,
    index: HashMap<VertexId, usize>,
}

impl TaskBuilder {
    pub(crate) fn new(
        id: TaskId,
        job_id: JobId,
        location: NodeId,
        start_ts: Timestamp,
        ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            id,
            job_id,
            location,
            start_ts,
            ids,
            vertices: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn location(&self) -> NodeId {
        self.location
    }

    pub fn add_vertex(&mut self, op: impl Operator + 'static) -> VertexId {
        self.add_shared(Arc::new(op))
    }

    fn add_shared(&mut self, op: Arc<dyn Operator>) -> VertexId {
        let id = VertexId::new(self.ids.fetch_add(1, Ordering::SeqCst));
        self.index.insert(id, self.vertices.len());
        self.vertices.push(PendingVertex {
            id,
            op,
            outputs: Vec::new(),
        });
        id
    }

    /// Add an edge `from -> to`
    pub fn connect(&mut self, from: VertexId, to: VertexId) -> Result<()> {
        let from_index = self.position(from)?;
        let to_index = self.position(to)?;
        if from_index == to_index {
            return Err(DagError::InvalidGraph(format!("self edge on {}", from)));
        }
        self.vertices[from_index].outputs.push(to_index);
        Ok(())
    }

    /// Add a source receiving from other tasks through the returned exchange
    pub fn add_receive(&mut self) -> (VertexId, Exchange) {
        let (exchange, receive) = Exchange::channel();
        (self.add_vertex(receive), exchange)
    }

    /// Add a vertex forwarding everything it receives into `exchange`
    pub fn add_send(&mut self, exchange: &Exchange) -> VertexId {
        self.add_vertex(exchange.register_sender())
    }

    fn position(&self, id: VertexId) -> Result<usize> {
        self.index
            .get(&id)
            .copied()
            .ok_or_else(|| DagError::InvalidGraph(format!("unknown vertex {} in task {}", id, self.id)))
    }

    /// Validate the graph and wire the vertices.
    pub(crate) fn build(self) -> Result<Task> {
        let count = self.vertices.len();
        let mut in_degree = vec![0usize; count];
        for vertex in &self.vertices {
            for &output in &vertex.outputs {
                in_degree[output] += 1;
            }
        }

        for (i, vertex) in self.vertices.iter().enumerate() {
            let source = vertex.op.is_source();
            if source && in_degree[i] > 0 {
                return Err(DagError::InvalidGraph(format!(
                    "source {} ({}) has inbound edges",
                    vertex.id,
                    vertex.op.name()
                )));
            }
            if !source && in_degree[i] == 0 {
                return Err(DagError::InvalidGraph(format!(
                    "vertex {} ({}) has no inbound edges",
                    vertex.id,
                    vertex.op.name()
                )));
            }
        }

        // Kahn's algorithm: topological order, or a cycle
        let mut remaining = in_degree.clone();
        let mut queue: VecDeque<usize> = (0..count).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(count);
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &output in &self.vertices[i].outputs {
                remaining[output] -= 1;
                if remaining[output] == 0 {
                    queue.push_back(output);
                }
            }
        }
        if order.len() != count {
            return Err(DagError::InvalidGraph(format!("task {} graph has a cycle", self.id)));
        }
        if order.is_empty() {
            return Err(DagError::InvalidGraph(format!("task {} has no vertices", self.id)));
        }

        // Downstream vertices first so every edge target already exists
        let mut built: Vec<Option<Arc<Vertex>>> = vec![None; count];
        for &i in order.iter().rev() {
            let pending = &self.vertices[i];
            let outputs = pending
                .outputs
                .iter()
                .filter_map(|&o| built[o].clone())
                .collect();
            built[i] = Some(Arc::new(Vertex::new(
                pending.id,
                pending.op.clone(),
                outputs,
                in_degree[i],
            )));
        }
        let vertices: Vec<Arc<Vertex>> = built.into_iter().flatten().collect();
        let source_run_list = vertices.iter().filter(|v| v.is_source()).cloned().collect();

        Ok(Task {
            id: self.id,
            location: self.location,
            vertices,
            source_run_list,
            ctx: Arc::new(TaskContext {
                job_id: self.job_id,
                task_id: self.id,
                location: self.location,
                start_ts: self.start_ts,
                cancelled: AtomicBool::new(false),
                first_error: Mutex::new(None),
            }),
            status: Mutex::new(TaskStatus::Born),
            initialized: AtomicBool::new(false),
        })
    }
}
