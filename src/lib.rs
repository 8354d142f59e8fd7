//! Taskweave is a coordination and checkpointing engine for multi-agent task
//! execution. It combines optimistic per-task locking with version fencing,
//! conflict detection and resolution between parallel agents, layered durable
//! persistence (live state, append-only log, decision records, checkpoints),
//! and risk-adaptive checkpoint scheduling with storage retention.

pub mod checkpoint;
pub mod config;
pub mod coordination;
pub mod error;
pub mod lock;
pub mod persistence;

pub use checkpoint::{
    CheckpointOptimizer, CheckpointReason, CheckpointScheduler, RiskContext, RiskLevel,
};
pub use config::CoordConfig;
pub use coordination::{ParallelCoordinator, ResolutionStrategy};
pub use error::{CoordError, Result};
pub use lock::{LockEngine, LockMode, LockStatus};
pub use persistence::{PersistenceEngine, TaskState};
