//! Push-based Job/Task/Vertex runtime
//!
//! A job is split into one task per participating node. Each task holds a
//! small acyclic graph of operator vertices; source vertices are driven by
//! their own worker and push batches downstream until exhausted, then send a
//! finish signal. Failures travel the same way, as classified error finish
//! signals, so the consumer at the job's root always learns how the job ended.

mod error;
mod fin;
mod job;
mod latch;
mod manager;
mod operator;
mod task;
mod tuple;
mod vertex;

pub use error::{DagError, Result};
pub use fin::{ClassifiedError, Fin, FinError, FinKind, OperatorError, OperatorResult};
pub use job::Job;
pub use latch::CountDownLatch;
pub use manager::{IteratorParams, JobIterator, JobManager, JobRun};
pub use operator::{Exchange, ExchangeReceiver, ExchangeSender, Message, Operator, Root, Sum, Values};
pub use task::{Task, TaskBuilder, TaskContext, TaskRun, TaskStatus};
pub use tuple::{Batch, Tuple};
pub use vertex::Vertex;
