//! The caller's view of a submitted job.

use std::fmt;
use std::sync::Arc;

use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use common::error::{JobError, JobFailure};
use common::{JobId, JobState};

use crate::jobs::JobStatus;

/// How a job ended.
#[derive(Debug, Clone)]
pub enum JobOutcome<T> {
    Completed(T),
    Failed(JobFailure),
    Cancelled,
}

impl<T> JobOutcome<T> {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Completed(_) => JobState::Completed,
            JobOutcome::Failed(_) => JobState::Failed,
            JobOutcome::Cancelled => JobState::Cancelled,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }

    pub fn into_result(self) -> Result<T, JobError> {
        match self {
            JobOutcome::Completed(value) => Ok(value),
            JobOutcome::Failed(failure) => Err(JobError::Failed(failure)),
            JobOutcome::Cancelled => Err(JobError::Cancelled),
        }
    }
}

/// Single-assignment slot for a job's outcome.
///
/// The first `resolve` wins; the job's status moves to the matching terminal
/// state before any waiter can observe the outcome.
pub(crate) struct ResultCell<T> {
    status: Arc<JobStatus>,
    slot: watch::Sender<Option<Arc<JobOutcome<T>>>>,
}

impl<T> ResultCell<T> {
    pub(crate) fn new(status: Arc<JobStatus>) -> Self {
        let (slot, _) = watch::channel(None);
        Self { status, slot }
    }

    pub(crate) fn resolve(&self, outcome: JobOutcome<T>) -> bool {
        let mut outcome = Some(outcome);
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            let Some(outcome) = outcome.take() else {
                return false;
            };
            self.status.transition(outcome.state());
            *slot = Some(Arc::new(outcome));
            true
        })
    }

    fn get(&self) -> Option<Arc<JobOutcome<T>>> {
        self.slot.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Arc<JobOutcome<T>>>> {
        self.slot.subscribe()
    }
}

/// A handle to a running job. Cloning it shares the same job.
pub struct JobHandle<T> {
    status: Arc<JobStatus>,
    cell: Arc<ResultCell<T>>,
    cancel: CancellationToken,
}

impl<T> Clone for JobHandle<T> {
    fn clone(&self) -> Self {
        Self {
            status: self.status.clone(),
            cell: self.cell.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.status.id())
            .field("state", &self.status.get_state())
            .finish()
    }
}

impl<T> JobHandle<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new(
        status: Arc<JobStatus>,
        cell: Arc<ResultCell<T>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            status,
            cell,
            cancel,
        }
    }

    pub fn id(&self) -> JobId {
        self.status.id()
    }

    pub fn state(&self) -> JobState {
        self.status.get_state()
    }

    /// A receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<JobState> {
        self.status.subscribe()
    }

    pub fn is_done(&self) -> bool {
        self.cell.get().is_some()
    }

    /// The outcome, if the job already ended.
    pub fn try_outcome(&self) -> Option<Arc<JobOutcome<T>>> {
        self.cell.get()
    }

    /// Waits for the job to end.
    pub async fn outcome(&self) -> Arc<JobOutcome<T>> {
        let mut slot = self.cell.subscribe();
        loop {
            let current = slot.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if slot.changed().await.is_err() {
                // The handle owns the sender, so the slot cannot close.
                return Arc::new(JobOutcome::Failed(JobFailure::Protocol(
                    "result cell closed".to_string(),
                )));
            }
        }
    }

    /// Waits for the job and returns its value.
    pub async fn get(&self) -> Result<T, JobError>
    where
        T: Clone,
    {
        let outcome = self.outcome().await;
        match outcome.as_ref() {
            JobOutcome::Completed(value) => Ok(value.clone()),
            JobOutcome::Failed(failure) => Err(JobError::Failed(failure.clone())),
            JobOutcome::Cancelled => Err(JobError::Cancelled),
        }
    }

    /// Runs `callback` once, when the job ends. Runs it right away if the
    /// job has already ended; otherwise on a tokio task.
    ///
    /// Waiting for an unfinished job needs a tokio runtime. Called outside
    /// one, the callback is dropped and the error returned.
    pub fn on_complete<F>(&self, callback: F) -> Result<(), TryCurrentError>
    where
        F: FnOnce(Arc<JobOutcome<T>>) + Send + 'static,
    {
        if let Some(outcome) = self.try_outcome() {
            callback(outcome);
            return Ok(());
        }
        let runtime = Handle::try_current()?;
        let handle = self.clone();
        runtime.spawn(async move {
            callback(handle.outcome().await);
        });
        Ok(())
    }

    /// Cancels the job. Returns `false` if it had already ended.
    pub fn cancel(&self) -> bool {
        let cancelled = self.cell.resolve(JobOutcome::Cancelled);
        if cancelled {
            info!("{} cancelled by caller", self.id());
        }
        self.cancel.cancel();
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    fn handle() -> JobHandle<u32> {
        let status = Arc::new(JobStatus::new(JobId(1)));
        let cell = Arc::new(ResultCell::new(status.clone()));
        JobHandle::new(status, cell, CancellationToken::new())
    }

    #[tokio::test]
    async fn resolves_exactly_once() {
        let handle = handle();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.get().await });

        assert!(handle.cell.resolve(JobOutcome::Completed(7)));
        assert!(!handle.cell.resolve(JobOutcome::Cancelled));

        assert_eq!(task.await.unwrap().unwrap(), 7);
        assert_eq!(handle.get().await.unwrap(), 7);
        assert_eq!(handle.state(), JobState::Completed);
    }

    #[tokio::test]
    async fn cancelled_jobs_stay_cancelled() {
        let handle = handle();

        assert!(handle.cancel());
        assert!(!handle.cell.resolve(JobOutcome::Completed(1)));
        assert!(!handle.cancel());

        assert!(handle.get().await.unwrap_err().is_cancelled());
        assert_eq!(handle.state(), JobState::Cancelled);
        assert!(handle.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn callbacks_fire_once_before_and_after() {
        let handle = handle();
        let calls = Arc::new(AtomicU32::new(0));

        let early = calls.clone();
        handle.on_complete(move |outcome| {
            assert!(outcome.is_completed());
            early.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        handle.cell.resolve(JobOutcome::Completed(3));

        let late = calls.clone();
        handle.on_complete(move |_| {
            late.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::timeout(Duration::from_secs(1), async {
            while calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn waiting_outside_a_runtime_is_an_error() {
        let handle = handle();
        let calls = Arc::new(AtomicU32::new(0));

        let pending = calls.clone();
        assert!(handle
            .on_complete(move |_| {
                pending.fetch_add(1, Ordering::SeqCst);
            })
            .is_err());

        handle.cell.resolve(JobOutcome::Completed(5));
        let done = calls.clone();
        handle
            .on_complete(move |_| {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
