//! Job: the tasks of one distributed operation

use crate::error::{DagError, Result};
use crate::operator::{Message, Root};
use crate::task::{Task, TaskBuilder};
use meridian_common::{JobId, NodeId, TaskId, Timestamp, TxnId, VertexId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::sync::mpsc;

pub struct Job {
    id: JobId,
    start_ts: Timestamp,
    seq_id: u64,
    txn_id: TxnId,
    tasks: Vec<Arc<Task>>,
    has_root: bool,
    results: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    ids: Arc<AtomicU64>,
}

impl Job {
    pub(crate) fn new(id: JobId, start_ts: Timestamp, seq_id: u64, txn_id: TxnId, ids: Arc<AtomicU64>) -> Self {
        Self {
            id,
            start_ts,
            seq_id,
            txn_id,
            tasks: Vec::new(),
            has_root: false,
            results: Mutex::new(None),
            ids,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    pub fn seq_id(&self) -> u64 {
        self.seq_id
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    pub fn has_root(&self) -> bool {
        self.has_root
    }

    /// Start building a task placed on `location`
    pub fn create_task(&self, location: NodeId) -> TaskBuilder {
        let id = TaskId::new(self.next_id());
        TaskBuilder::new(id, self.id, location, self.start_ts, self.ids.clone())
    }

    /// Add the job's single root vertex to `task`
    pub fn add_root(&mut self, task: &mut TaskBuilder) -> Result<VertexId> {
        if self.has_root() {
            return Err(DagError::InvalidGraph(format!("job {} already has a root", self.id)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.has_root = true;
        *self.results.lock() = Some(rx);
        Ok(task.add_vertex(Root::new(tx)))
    }

    /// Validate and attach a finished task
    pub fn add_task(&mut self, task: TaskBuilder) -> Result<TaskId> {
        let task = task.build()?;
        let id = task.id();
        self.tasks.push(Arc::new(task));
        Ok(id)
    }

    pub(crate) fn take_results(&self) -> Result<mpsc::UnboundedReceiver<Message>> {
        if !self.has_root() {
            return Err(DagError::NoRoot(self.id));
        }
        self.results
            .lock()
            .take()
            .ok_or(DagError::IteratorTaken(self.id))
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }
}
