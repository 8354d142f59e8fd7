pub mod coordinator;

pub use coordinator::{
    AgentConflict, AgentResult, AgentStatus, ConflictKind, MergedResult, ParallelCoordinator,
    ResolutionOutcome, ResolutionStrategy, ResolvedConflict,
};
