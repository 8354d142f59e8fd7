pub mod optimizer;
pub mod scheduler;

pub use optimizer::{CheckpointOptimizer, StorageStats};
pub use scheduler::{
    CheckpointEvent, CheckpointReason, CheckpointScheduler, MonitoringStatus, RiskContext,
    RiskLevel, assess_risk, score_risk,
};
