//! Background steward: durable jobs, executors and the scheduling manager

pub mod auto_merge;
pub mod breaker;
pub mod derivation;
pub mod executor;
pub mod manager;
pub mod payload;
pub mod policy_tuner;
pub mod types;

pub use auto_merge::AutoMergeExecutor;
pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use derivation::DerivationExecutor;
pub use executor::{Executor, NoopExecutor, Registry};
pub use manager::{Manager, StewardStatus};
pub use payload::{AutoMergePayload, DerivePayload, JobPayload};
pub use policy_tuner::{choose_policy_proposal, PolicyProposal, PolicyTuneExecutor, TunerInputs};
pub use types::{
    Derivation, DerivationStatus, Event, ExecutionResult, Job, JobStatus, LivePolicy,
    MetricsSummary, ModelMetrics, NewJob, PolicyChange, PolicyKey, PolicyValues,
    QueueHealthSummary, Run, RunFilters, RunStatus,
};
