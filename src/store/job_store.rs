use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::error::PrismError;
use crate::state_machine::{Job, StateTransition};

/// Durable job records.
///
/// Lifecycle fields (`state`, `state_transitions`, milestone timestamps) only
/// change through [`JobStore::append_transition`]; [`JobStore::save`] writes
/// every other field.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: Job) -> Result<Job, PrismError>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>, PrismError>;

    async fn save(&self, job: &Job) -> Result<Job, PrismError>;

    /// Atomically validate and apply one transition.
    async fn append_transition(
        &self,
        job_id: &str,
        entry: StateTransition,
    ) -> Result<Job, PrismError>;

    async fn list(&self) -> Result<Vec<Job>, PrismError>;
}

pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<Job, PrismError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.job_id) {
            return Err(PrismError::Store(format!("job {} already exists", job.job_id)));
        }
        jobs.insert(job.job_id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, PrismError> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn save(&self, job: &Job) -> Result<Job, PrismError> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get_mut(&job.job_id)
            .ok_or_else(|| PrismError::JobNotFound(job.job_id.clone()))?;

        let mut next = job.clone();
        next.state = stored.state;
        next.state_transitions = std::mem::take(&mut stored.state_transitions);
        next.created_at = stored.created_at;
        next.submitted_at = stored.submitted_at;
        next.running_at = stored.running_at;
        next.succeeded_at = stored.succeeded_at;
        next.failed_at = stored.failed_at;
        next.updated_at = self.clock.now();

        *stored = next.clone();
        Ok(next)
    }

    async fn append_transition(
        &self,
        job_id: &str,
        entry: StateTransition,
    ) -> Result<Job, PrismError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| PrismError::JobNotFound(job_id.to_string()))?;
        job.apply_transition(entry)?;
        Ok(job.clone())
    }

    async fn list(&self) -> Result<Vec<Job>, PrismError> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}
