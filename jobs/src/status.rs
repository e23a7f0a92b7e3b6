use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub state: JobState,
    pub inserted: usize,
    pub error: Option<String>,
    pub attempts: u32,
}

impl JobStatus {
    fn pending(job_id: Uuid) -> Self {
        Self {
            job_id,
            state: JobState::Pending,
            inserted: 0,
            error: None,
            attempts: 0,
        }
    }
}

/// Result backend for job status polling. Submission marks a job pending;
/// the worker records attempts and the terminal outcome.
#[derive(Default)]
pub struct JobStatusStore {
    statuses: DashMap<Uuid, JobStatus>,
}

impl JobStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_pending(&self, job_id: Uuid) {
        self.statuses
            .entry(job_id)
            .or_insert_with(|| JobStatus::pending(job_id));
    }

    pub fn record_attempt(&self, job_id: Uuid) {
        let mut entry = self
            .statuses
            .entry(job_id)
            .or_insert_with(|| JobStatus::pending(job_id));
        entry.attempts += 1;
    }

    pub fn mark_success(&self, job_id: Uuid, inserted: usize) {
        let mut entry = self
            .statuses
            .entry(job_id)
            .or_insert_with(|| JobStatus::pending(job_id));
        entry.state = JobState::Success;
        entry.inserted = inserted;
        entry.error = None;
    }

    pub fn mark_failure(&self, job_id: Uuid, error: impl Into<String>) {
        let mut entry = self
            .statuses
            .entry(job_id)
            .or_insert_with(|| JobStatus::pending(job_id));
        entry.state = JobState::Failure;
        entry.error = Some(error.into());
    }

    pub fn get(&self, job_id: Uuid) -> Option<JobStatus> {
        self.statuses.get(&job_id).map(|status| status.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_pending_to_success() {
        let store = JobStatusStore::new();
        let job_id = Uuid::new_v4();

        store.mark_pending(job_id);
        assert_eq!(store.get(job_id).unwrap().state, JobState::Pending);

        store.record_attempt(job_id);
        store.mark_success(job_id, 7);

        let status = store.get(job_id).unwrap();
        assert_eq!(status.state, JobState::Success);
        assert_eq!(status.inserted, 7);
        assert_eq!(status.attempts, 1);
        assert!(status.error.is_none());
    }

    #[test]
    fn failure_records_error_message() {
        let store = JobStatusStore::new();
        let job_id = Uuid::new_v4();

        store.mark_pending(job_id);
        store.mark_failure(job_id, "document produced no indexable content");

        let status = store.get(job_id).unwrap();
        assert_eq!(status.state, JobState::Failure);
        assert!(status.error.is_some());
        assert_eq!(status.inserted, 0);
    }

    #[test]
    fn unknown_job_returns_none() {
        let store = JobStatusStore::new();
        assert!(store.get(Uuid::new_v4()).is_none());
    }
}
