//! Executor trait and the job-type registry

use super::payload::JobPayload;
use super::types::{ExecutionResult, Job, JOB_TYPE_NOOP};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Handles one job type
///
/// Returning `Ok` means the job is done, including "decided not to act";
/// returning `Err` hands the retry decision to the job repository.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: &Job, payload: &JobPayload) -> Result<ExecutionResult>;
}

/// Always succeeds; used for unknown or retired job types
#[derive(Debug, Default)]
pub struct NoopExecutor;

#[async_trait]
impl Executor for NoopExecutor {
    async fn execute(&self, job: &Job, _payload: &JobPayload) -> Result<ExecutionResult> {
        let mut result = ExecutionResult::new("noop").with_output(json!({"status": "noop_success"}));
        result
            .metadata
            .insert("job_type".to_string(), json!(job.job_type));
        Ok(result)
    }
}

/// Maps job-type strings to executors
pub struct Registry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let mut executors: HashMap<String, Arc<dyn Executor>> = HashMap::new();
        executors.insert(JOB_TYPE_NOOP.to_string(), Arc::new(NoopExecutor));
        Self { executors }
    }

    /// Register (or replace) the executor for `job_type`; empty types are ignored
    pub fn register(&mut self, job_type: &str, executor: Arc<dyn Executor>) {
        if job_type.is_empty() {
            return;
        }
        self.executors.insert(job_type.to_string(), executor);
    }

    /// The executor for `job_type`, or the no-op executor
    pub fn executor_for(&self, job_type: &str) -> Arc<dyn Executor> {
        if let Some(executor) = self.executors.get(job_type) {
            return Arc::clone(executor);
        }
        debug!("No executor for job type {:?}, using noop", job_type);
        self.executors
            .get(JOB_TYPE_NOOP)
            .cloned()
            .unwrap_or_else(|| Arc::new(NoopExecutor))
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steward::types::JobStatus;
    use chrono::Utc;
    use serde_json::Map;
    use uuid::Uuid;

    fn job(job_type: &str) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            project_id: None,
            source_memory_ids: vec![],
            trigger_reason: None,
            payload: Map::new(),
            status: JobStatus::Running,
            priority: 0,
            attempt_count: 0,
            max_attempts: 3,
            run_after: now,
            locked_by: None,
            locked_at: None,
            lease_expires_at: None,
            last_error: None,
            idempotency_key: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_unknown_job_type_falls_back_to_noop() {
        let registry = Registry::new();
        let job = job("retired_job_type");
        let result = registry
            .executor_for(&job.job_type)
            .execute(&job, &JobPayload::Other)
            .await
            .unwrap();
        assert_eq!(result.decision, "noop");
        assert_eq!(result.metadata["job_type"], "retired_job_type");
        assert_eq!(result.output["status"], "noop_success");
    }

    #[tokio::test]
    async fn test_registered_executor_wins() {
        let mut mock = MockExecutor::new();
        mock.expect_execute()
            .times(1)
            .returning(|_, _| Ok(ExecutionResult::new("custom")));

        let mut registry = Registry::new();
        registry.register("custom", Arc::new(mock));
        registry.register("", Arc::new(NoopExecutor));
        assert_eq!(registry.job_types(), vec!["custom", "noop"]);

        let job = job("custom");
        let result = registry
            .executor_for("custom")
            .execute(&job, &JobPayload::Other)
            .await
            .unwrap();
        assert_eq!(result.decision, "custom");
    }
}
