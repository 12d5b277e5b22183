//! Compile a protocol phase into a job
//!
//! Partitions are grouped by the node hosting their leader and every node
//! gets one task: a scan source per partition feeding the phase operator.
//! When the caller wants results, the coordinator's own task sums the
//! counts of every node, remote ones arriving through an exchange, into the
//! job's root.

use crate::error::Result;
use meridian_common::{NodeId, Timestamp, TxnId, TxnPartData, VertexId};
use meridian_dag::{Job, JobManager, Operator, Sum, TaskBuilder, Tuple, Values};
use meridian_store::MetaService;
use std::collections::BTreeMap;
use tracing::debug;

/// Where and for whom a job is rendered
pub(crate) struct RenderContext<'a> {
    pub jobs: &'a JobManager,
    pub meta: &'a dyn MetaService,
    /// Node of the coordinator; hosts the root
    pub home: NodeId,
    pub start_ts: Timestamp,
    pub seq_id: u64,
    pub txn_id: TxnId,
    pub batch_size: usize,
}

impl RenderContext<'_> {
    /// Build a job running `make_op` over `rows`, with a root summing the
    /// handled rows when `with_root` is set.
    pub fn render<O, F>(
        &self,
        rows: BTreeMap<TxnPartData, Vec<Tuple>>,
        with_root: bool,
        make_op: F,
    ) -> Result<Job>
    where
        O: Operator + 'static,
        F: Fn() -> O,
    {
        let mut job = self.jobs.create_job(self.start_ts, self.seq_id, self.txn_id);

        let mut by_node: BTreeMap<NodeId, Vec<(TxnPartData, Vec<Tuple>)>> = BTreeMap::new();
        for (part, rows) in rows {
            let node = self
                .meta
                .partition(part)
                .map(|desc| desc.leader)
                .unwrap_or(self.home);
            by_node.entry(node).or_default().push((part, rows));
        }
        debug!(txn_id = %self.txn_id, nodes = by_node.len(), with_root, "rendering job");

        if !with_root {
            for (node, parts) in by_node {
                let mut task = job.create_task(node);
                self.add_phase(&mut task, parts, &make_op)?;
                job.add_task(task)?;
            }
            return Ok(job);
        }

        let mut root_task = job.create_task(self.home);
        let sum = root_task.add_vertex(Sum::new());
        let root = job.add_root(&mut root_task)?;
        root_task.connect(sum, root)?;

        let mut exchange = None;
        if by_node.keys().any(|node| *node != self.home) {
            let (receive, remote) = root_task.add_receive();
            root_task.connect(receive, sum)?;
            exchange = Some(remote);
        }

        for (node, parts) in by_node {
            match &exchange {
                Some(exchange) if node != self.home => {
                    let mut task = job.create_task(node);
                    let phase = self.add_phase(&mut task, parts, &make_op)?;
                    let send = task.add_send(exchange);
                    task.connect(phase, send)?;
                    job.add_task(task)?;
                }
                _ => {
                    let phase = self.add_phase(&mut root_task, parts, &make_op)?;
                    root_task.connect(phase, sum)?;
                }
            }
        }
        job.add_task(root_task)?;
        Ok(job)
    }

    /// Scan sources for `parts` feeding one phase operator
    fn add_phase<O, F>(
        &self,
        task: &mut TaskBuilder,
        parts: Vec<(TxnPartData, Vec<Tuple>)>,
        make_op: &F,
    ) -> Result<VertexId>
    where
        O: Operator + 'static,
        F: Fn() -> O,
    {
        let phase = task.add_vertex(make_op());
        for (_, rows) in parts {
            let batches = rows
                .chunks(self.batch_size.max(1))
                .map(|chunk| chunk.to_vec())
                .collect();
            let scan = task.add_vertex(Values::new(batches));
            task.connect(scan, phase)?;
        }
        Ok(phase)
    }
}
