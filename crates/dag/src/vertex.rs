//! Vertex: one operator instance and its outbound edges
//!
//! Execution is push based. A source vertex is driven by its own worker and
//! pushes each batch through its edges; the receiving vertex processes the
//! batch inline and pushes its own output further down. Every vertex sends
//! exactly one finish signal per outbound edge.

use crate::fin::{Fin, FinError};
use crate::operator::Operator;
use crate::task::TaskContext;
use crate::tuple::Batch;
use futures::FutureExt;
use futures::future::BoxFuture;
use meridian_common::VertexId;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, warn};

pub struct Vertex {
    id: VertexId,
    op: Arc<dyn Operator>,
    outputs: Vec<Arc<Vertex>>,
    in_degree: usize,
    /// Upstream finish signals still expected in the current run
    pending: AtomicUsize,
    ended: AtomicBool,
}

impl Vertex {
    pub(crate) fn new(
        id: VertexId,
        op: Arc<dyn Operator>,
        outputs: Vec<Arc<Vertex>>,
        in_degree: usize,
    ) -> Self {
        Self {
            id,
            op,
            outputs,
            in_degree,
            pending: AtomicUsize::new(in_degree),
            ended: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> VertexId {
        self.id
    }

    pub fn kind(&self) -> &'static str {
        self.op.name()
    }

    pub fn is_source(&self) -> bool {
        self.op.is_source()
    }

    pub fn in_degree(&self) -> usize {
        self.in_degree
    }

    pub fn out_degree(&self) -> usize {
        self.outputs.len()
    }

    /// Whether this vertex already sent its finish signal in the current run
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub(crate) async fn init(&self, ctx: &TaskContext) -> Result<(), FinError> {
        self.op.init(ctx).await.map_err(|err| err.into_fin())
    }

    pub(crate) fn reset(&self) {
        self.pending.store(self.in_degree, Ordering::SeqCst);
        self.ended.store(false, Ordering::SeqCst);
        self.op.reset();
    }

    /// Drive a source until it is exhausted, fails or the task is cancelled.
    pub(crate) async fn run_source(&self, ctx: &TaskContext) {
        loop {
            if ctx.is_cancelled() {
                let err = FinError::cancelled(format!("task {} cancelled", ctx.task_id()));
                self.end(ctx, Fin::Err(err)).await;
                return;
            }
            match self.op.next_batch(ctx).await {
                Ok(Some(batch)) => {
                    if !batch.is_empty() {
                        self.emit(ctx, batch).await;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    self.end(ctx, Fin::Err(err.into_fin())).await;
                    return;
                }
            }
        }
        self.complete(ctx).await;
    }

    /// Send an error finish signal without running the operator.
    pub(crate) async fn fail(&self, ctx: &TaskContext, err: FinError) {
        self.end(ctx, Fin::Err(err)).await;
    }

    fn receive<'a>(&'a self, ctx: &'a TaskContext, batch: Batch) -> BoxFuture<'a, ()> {
        async move {
            if self.is_ended() {
                return;
            }
            match self.op.push(ctx, batch).await {
                Ok(out) => {
                    if !out.is_empty() {
                        self.emit(ctx, out).await;
                    }
                }
                Err(err) => self.end(ctx, Fin::Err(err.into_fin())).await,
            }
        }
        .boxed()
    }

    fn receive_fin<'a>(&'a self, ctx: &'a TaskContext, fin: Fin) -> BoxFuture<'a, ()> {
        async move {
            match fin {
                Fin::Err(err) => {
                    if !self.ended.swap(true, Ordering::SeqCst) {
                        debug!(vertex = %self.id, fin = %err.kind, "forwarding upstream failure");
                        self.propagate(ctx, Fin::Err(err)).await;
                    }
                }
                Fin::Ok => {
                    if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                        self.complete(ctx).await;
                    }
                }
            }
        }
        .boxed()
    }

    async fn complete(&self, ctx: &TaskContext) {
        if self.is_ended() {
            return;
        }
        match self.op.finish(ctx).await {
            Ok(out) => {
                if !out.is_empty() {
                    self.emit(ctx, out).await;
                }
                self.end(ctx, Fin::Ok).await;
            }
            Err(err) => self.end(ctx, Fin::Err(err.into_fin())).await,
        }
    }

    async fn emit(&self, ctx: &TaskContext, batch: Batch) {
        if let Some((last, rest)) = self.outputs.split_last() {
            for output in rest {
                output.receive(ctx, batch.clone()).await;
            }
            last.receive(ctx, batch).await;
        }
    }

    async fn end(&self, ctx: &TaskContext, fin: Fin) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        match &fin {
            Fin::Ok => debug!(task = %ctx.task_id(), vertex = %self.id, kind = self.kind(), "vertex finished"),
            Fin::Err(err) => {
                warn!(
                    task = %ctx.task_id(),
                    vertex = %self.id,
                    kind = self.kind(),
                    fin = %err.kind,
                    "vertex finished with error: {}",
                    err.message
                );
                ctx.record_error(err);
            }
        }
        self.propagate(ctx, fin).await;
    }

    async fn propagate(&self, ctx: &TaskContext, fin: Fin) {
        self.op.on_fin(ctx, &fin).await;
        for output in &self.outputs {
            output.receive_fin(ctx, fin.clone()).await;
        }
    }
}
