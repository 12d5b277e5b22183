//! Core coordinator implementation

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::registry::TxnRegistry;
use crate::transaction::Transaction;
use crate::tso::TimestampAuthority;
use crate::two_phase::TwoPhaseCommitExecutor;
use meridian_common::{IsolationLevel, NodeId, TransactionKind, TxnId};
use meridian_dag::JobManager;
use meridian_store::{MetaService, StoreService};
use std::sync::Arc;
use tracing::{info, warn};

/// State shared by the coordinator and every transaction it began
pub(crate) struct Shared {
    pub config: CoordinatorConfig,
    pub meta: Arc<dyn MetaService>,
    pub tso: TimestampAuthority,
    pub executor: Arc<TwoPhaseCommitExecutor>,
    pub jobs: Arc<JobManager>,
    pub registry: TxnRegistry,
    /// Node hosting the roots of this coordinator's jobs
    pub node: NodeId,
}

/// Distributed transaction coordinator
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    /// Create a coordinator over a storage service and its metadata
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn StoreService>,
        meta: Arc<dyn MetaService>,
    ) -> Result<Self> {
        config.validate()?;
        let executor = Arc::new(TwoPhaseCommitExecutor::new(
            store,
            meta.clone(),
            config.region_retry_limit,
        ));
        let shared = Shared {
            tso: TimestampAuthority::new(config.server_id),
            node: NodeId::new(config.server_id),
            meta,
            executor,
            jobs: Arc::new(JobManager::new()),
            registry: TxnRegistry::new(),
            config,
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Begin a new transaction and register it
    pub fn begin(&self, kind: TransactionKind, isolation: IsolationLevel) -> Arc<Transaction> {
        let start_ts = self.shared.tso.now();
        let id = self.shared.tso.next_txn_id(start_ts);
        let txn = Arc::new(Transaction::new(id, kind, isolation, self.shared.clone()));
        self.shared.registry.register(txn.clone());
        info!(txn_id = %id, start_ts = %start_ts, ?kind, ?isolation, "transaction started");
        txn
    }

    /// Live transaction by id
    pub fn lookup(&self, id: TxnId) -> Option<Arc<Transaction>> {
        self.shared.registry.get(&id)
    }

    /// Live transaction by the textual id form
    pub fn find(&self, id: &str) -> Result<Arc<Transaction>> {
        let parsed = TxnId::parse(id).map_err(CoordinatorError::TransactionNotFound)?;
        self.lookup(parsed)
            .ok_or_else(|| CoordinatorError::TransactionNotFound(id.to_string()))
    }

    pub fn active_transactions(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    pub fn timestamps(&self) -> &TimestampAuthority {
        &self.shared.tso
    }

    pub fn job_manager(&self) -> &Arc<JobManager> {
        &self.shared.jobs
    }

    /// Cancel and close every live transaction
    pub async fn stop(&self) {
        let live = self.shared.registry.snapshot();
        info!(transactions = live.len(), "stopping coordinator");
        for txn in live {
            txn.cancel();
            if let Err(err) = txn.close().await {
                warn!(txn_id = %txn.id(), error = %err, "failed to close transaction");
            }
        }
    }
}
