pub mod conflict;
pub mod engine;

pub use conflict::{
    ConflictInfo, Operation, detect_collaborative_conflicts, detect_version_conflict,
    suggest_resolution,
};
pub use engine::{AcquireOutcome, Lock, LockEngine, LockMode, LockStats, LockStatus, ReleaseOutcome};
