use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use common::{JobId, JobState};

/// Live state and progress of one job.
#[derive(Debug)]
pub struct JobStatus {
    id: JobId,
    state: watch::Sender<JobState>,

    /// Partitions the job visits.
    total_partitions: AtomicU32,

    /// Partitions whose output has been fully shuffled.
    processed_partitions: AtomicU32,

    /// Partition and reduce attempts that had to be repeated.
    retries: AtomicU32,
}

impl JobStatus {
    pub fn new(id: JobId) -> Self {
        let (state, _) = watch::channel(JobState::Configuring);
        Self {
            id,
            state,
            total_partitions: AtomicU32::new(0),
            processed_partitions: AtomicU32::new(0),
            retries: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn get_state(&self) -> JobState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    /// Moves the job to `next`. A terminal state is never left.
    pub fn transition(&self, next: JobState) -> bool {
        let mut previous = next;
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            previous = *state;
            *state = next;
            true
        });
        if changed {
            info!("{}: {} -> {}", self.id, previous, next);
        }
        changed
    }

    pub fn set_total_partitions(&self, total: usize) {
        self.total_partitions.store(total as u32, Ordering::SeqCst);
    }

    pub fn partition_processed(&self) {
        self.processed_partitions.fetch_add(1, Ordering::SeqCst);
    }

    /// Forgets mapping progress when the map phase starts over.
    pub fn reset_progress(&self) {
        self.processed_partitions.store(0, Ordering::SeqCst);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get_retries(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }
}

/// A snapshot of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub source: String,
    pub state: JobState,
    pub total_partitions: u32,
    pub processed_partitions: u32,
    pub retries: u32,
}

#[derive(Debug)]
struct JobEntry {
    source: String,
    status: Arc<JobStatus>,
}

impl JobEntry {
    fn info(&self) -> JobInfo {
        let status = &self.status;
        JobInfo {
            id: status.id,
            source: self.source.clone(),
            state: status.get_state(),
            total_partitions: status.total_partitions.load(Ordering::SeqCst),
            processed_partitions: status.processed_partitions.load(Ordering::SeqCst),
            retries: status.get_retries(),
        }
    }
}

/// Every job submitted to an engine.
///
/// Jobs are kept after they finish in order to maintain history.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<JobId, JobEntry>,
    next_id: AtomicU64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new job and returns its status.
    pub fn register(&self, source: &str) -> Arc<JobStatus> {
        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let status = Arc::new(JobStatus::new(id));
        self.jobs.insert(
            id,
            JobEntry {
                source: source.to_string(),
                status: status.clone(),
            },
        );
        status
    }

    pub fn get(&self, id: JobId) -> Option<JobInfo> {
        self.jobs.get(&id).map(|entry| entry.info())
    }

    /// All jobs, oldest first.
    pub fn get_all_jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self.jobs.iter().map(|entry| entry.info()).collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    /// The number of jobs submitted, including finished ones.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs that have not reached a terminal state.
    pub fn number_of_jobs_pending(&self) -> usize {
        self.jobs
            .iter()
            .filter(|entry| !entry.status.get_state().is_terminal())
            .count()
    }

    /// Forgets finished jobs. Running jobs are kept.
    pub fn flush(&self) {
        self.jobs
            .retain(|_, entry| !entry.status.get_state().is_terminal());
    }
}
