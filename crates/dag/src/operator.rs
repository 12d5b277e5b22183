//! Operator contract and the built-in plumbing operators
//!
//! Operators are shared between the worker of every source feeding them, so
//! all callbacks take `&self` and keep their state behind interior
//! mutability.

use crate::fin::{Fin, FinError, FinKind, OperatorResult};
use crate::task::TaskContext;
use crate::tuple::{Batch, Tuple};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::debug;

/// Message carried by an exchange between tasks or to the job consumer
#[derive(Debug, Clone)]
pub enum Message {
    Data(Batch),
    Fin(Fin),
}

/// Behaviour of one vertex.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Operator kind, used in logs and graph validation errors
    fn name(&self) -> &'static str;

    /// Sources have no inbound edges and are driven by their own worker
    fn is_source(&self) -> bool {
        false
    }

    /// One-time setup before the first run
    async fn init(&self, _ctx: &TaskContext) -> OperatorResult<()> {
        Ok(())
    }

    /// Forget per-run state; called before every run
    fn reset(&self) {}

    /// Sources only: next batch to push, `None` once exhausted
    async fn next_batch(&self, _ctx: &TaskContext) -> OperatorResult<Option<Batch>> {
        Ok(None)
    }

    /// Process one batch from upstream, returning rows to push downstream
    async fn push(&self, _ctx: &TaskContext, batch: Batch) -> OperatorResult<Batch> {
        Ok(batch)
    }

    /// Every upstream finished cleanly; flush remaining rows
    async fn finish(&self, _ctx: &TaskContext) -> OperatorResult<Batch> {
        Ok(Vec::new())
    }

    /// Observe the finish signal this vertex sends downstream
    async fn on_fin(&self, _ctx: &TaskContext, _fin: &Fin) {}
}

/// Sending half of an exchange; every sender vertex wired to it is one
/// expected finish signal on the receiving side.
#[derive(Debug, Clone)]
pub struct Exchange {
    tx: mpsc::UnboundedSender<Message>,
    senders: Arc<AtomicUsize>,
}

impl Exchange {
    pub(crate) fn channel() -> (Self, ExchangeReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let senders = Arc::new(AtomicUsize::new(0));
        let exchange = Self {
            tx,
            senders: senders.clone(),
        };
        let receive = ExchangeReceiver {
            rx: AsyncMutex::new(rx),
            senders,
            fins: AtomicUsize::new(0),
        };
        (exchange, receive)
    }

    pub(crate) fn register_sender(&self) -> ExchangeSender {
        self.senders.fetch_add(1, Ordering::SeqCst);
        ExchangeSender {
            tx: self.tx.clone(),
        }
    }
}

/// Forwards rows and the finish signal into an exchange
pub struct ExchangeSender {
    tx: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl Operator for ExchangeSender {
    fn name(&self) -> &'static str {
        "send"
    }

    async fn push(&self, _ctx: &TaskContext, batch: Batch) -> OperatorResult<Batch> {
        if self.tx.send(Message::Data(batch)).is_err() {
            debug!("exchange receiver dropped, discarding batch");
        }
        Ok(Vec::new())
    }

    async fn on_fin(&self, _ctx: &TaskContext, fin: &Fin) {
        let _ = self.tx.send(Message::Fin(fin.clone()));
    }
}

/// Source fed by the sender vertices of other tasks
pub struct ExchangeReceiver {
    rx: AsyncMutex<mpsc::UnboundedReceiver<Message>>,
    senders: Arc<AtomicUsize>,
    fins: AtomicUsize,
}

#[async_trait]
impl Operator for ExchangeReceiver {
    fn name(&self) -> &'static str {
        "receive"
    }

    fn is_source(&self) -> bool {
        true
    }

    fn reset(&self) {
        self.fins.store(0, Ordering::SeqCst);
    }

    async fn next_batch(&self, _ctx: &TaskContext) -> OperatorResult<Option<Batch>> {
        let expected = self.senders.load(Ordering::SeqCst);
        if self.fins.load(Ordering::SeqCst) >= expected {
            return Ok(None);
        }

        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Some(Message::Data(batch)) => return Ok(Some(batch)),
                Some(Message::Fin(Fin::Ok)) => {
                    if self.fins.fetch_add(1, Ordering::SeqCst) + 1 >= expected {
                        return Ok(None);
                    }
                }
                Some(Message::Fin(Fin::Err(err))) => return Err(err.into()),
                None => {
                    return Err(FinError::new(FinKind::Other, "exchange closed before finish").into());
                }
            }
        }
    }
}

/// Terminal vertex handing rows to the job consumer
pub struct Root {
    tx: mpsc::UnboundedSender<Message>,
}

impl Root {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Operator for Root {
    fn name(&self) -> &'static str {
        "root"
    }

    async fn push(&self, _ctx: &TaskContext, batch: Batch) -> OperatorResult<Batch> {
        let _ = self.tx.send(Message::Data(batch));
        Ok(Vec::new())
    }

    async fn on_fin(&self, _ctx: &TaskContext, fin: &Fin) {
        let _ = self.tx.send(Message::Fin(fin.clone()));
    }
}

/// Counts rows (or sums `Count` rows) and emits the total on finish
#[derive(Default)]
pub struct Sum {
    total: AtomicU64,
}

impl Sum {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Operator for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn reset(&self) {
        self.total.store(0, Ordering::SeqCst);
    }

    async fn push(&self, _ctx: &TaskContext, batch: Batch) -> OperatorResult<Batch> {
        let rows: u64 = batch
            .iter()
            .map(|tuple| match tuple {
                Tuple::Count(n) => *n,
                _ => 1,
            })
            .sum();
        self.total.fetch_add(rows, Ordering::SeqCst);
        Ok(Vec::new())
    }

    async fn finish(&self, _ctx: &TaskContext) -> OperatorResult<Batch> {
        Ok(vec![Tuple::Count(self.total.load(Ordering::SeqCst))])
    }
}

/// Source replaying fixed batches, one per call
pub struct Values {
    batches: Vec<Batch>,
    cursor: AtomicUsize,
}

impl Values {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self {
            batches,
            cursor: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Operator for Values {
    fn name(&self) -> &'static str {
        "values"
    }

    fn is_source(&self) -> bool {
        true
    }

    fn reset(&self) {
        self.cursor.store(0, Ordering::SeqCst);
    }

    async fn next_batch(&self, _ctx: &TaskContext) -> OperatorResult<Option<Batch>> {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        Ok(self.batches.get(index).cloned())
    }
}
