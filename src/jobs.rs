//! Jobs - one-shot completions and async host job progress

use futures::channel::oneshot;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Completion was dropped before it resolved")]
    Dropped,
}

/// Resolving half of a one-shot completion. Only the first resolution counts.
#[derive(Debug)]
pub struct OneShot<T> {
    sender: Option<oneshot::Sender<T>>,
}

/// Waiting half of a one-shot completion.
#[derive(Debug)]
pub struct Completion<T> {
    receiver: oneshot::Receiver<T>,
}

pub fn one_shot<T>() -> (OneShot<T>, Completion<T>) {
    let (sender, receiver) = oneshot::channel();
    (
        OneShot {
            sender: Some(sender),
        },
        Completion { receiver },
    )
}

impl<T> OneShot<T> {
    /// Resolve with `value`. Returns false when already resolved or when
    /// nobody is waiting any more.
    pub fn resolve(&mut self, value: T) -> bool {
        match self.sender.take() {
            Some(sender) => sender.send(value).is_ok(),
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.sender.is_none()
    }
}

impl<T> Completion<T> {
    /// The value, if it has arrived.
    pub fn try_take(&mut self) -> Option<T> {
        self.receiver.try_recv().ok().flatten()
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, JobError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|r| r.map_err(|_| JobError::Dropped))
    }
}

/// Final state reported by the host for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Succeeded,
    Failed,
    Incomplete,
    Unknown,
}

impl JobState {
    fn failure_description(self) -> Option<&'static str> {
        match self {
            JobState::Succeeded => None,
            JobState::Failed => Some("Job failed."),
            JobState::Incomplete => {
                Some("Job finished, but not all parts of an assembly were imported successfully.")
            }
            JobState::Unknown => Some("Job finished with an unknown state."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub file: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed { failures: Vec<JobFailure> },
    Aborted { failures: Vec<JobFailure> },
}

/// `(candidate, tracked)`: does job `candidate` belong to the tracked import?
pub type SubJobPredicate = Box<dyn Fn(u64, u64) -> bool>;
pub type AbortCallback = Box<dyn FnMut(Option<u64>)>;

/// Tracks progress of one host job spanning `total` files.
///
/// Callbacks for other jobs are ignored unless the sub-job predicate claims
/// them. Completion resolves once, after the last file or on abort.
pub struct JobProgress {
    job_id: Option<u64>,
    total: usize,
    completed: usize,
    progress: f64,
    current_file: Option<String>,
    status: Option<String>,
    belongs_to: Option<SubJobPredicate>,
    abort_callback: Option<AbortCallback>,
    failures: Vec<JobFailure>,
    done: OneShot<JobOutcome>,
}

impl JobProgress {
    pub fn new(total: usize) -> (Self, Completion<JobOutcome>) {
        let (done, completion) = one_shot();
        let progress = Self {
            job_id: None,
            total: total.max(1),
            completed: 0,
            progress: 0.0,
            current_file: None,
            status: None,
            belongs_to: None,
            abort_callback: None,
            failures: vec![],
            done,
        };
        (progress, completion)
    }

    pub fn job_id(&self) -> Option<u64> {
        self.job_id
    }

    pub fn set_job_id(&mut self, job_id: u64) {
        self.job_id = Some(job_id);
    }

    pub fn with_sub_jobs(mut self, predicate: SubJobPredicate) -> Self {
        self.belongs_to = Some(predicate);
        self
    }

    pub fn set_abort_callback(&mut self, callback: Option<AbortCallback>) {
        self.abort_callback = callback;
    }

    pub fn can_abort(&self) -> bool {
        self.abort_callback.is_some()
    }

    /// Overall progress in percent.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn current_file(&self) -> Option<&str> {
        self.current_file.as_deref()
    }

    pub fn is_complete(&self) -> bool {
        self.done.is_resolved()
    }

    pub fn is_job_valid(&self, job_id: u64) -> bool {
        let Some(tracked) = self.job_id else {
            return false;
        };
        tracked == job_id || self.belongs_to.as_ref().map_or(false, |f| f(job_id, tracked))
    }

    /// Progress callback; `progress` is the current file's share in percent.
    pub fn update(
        &mut self,
        job_id: u64,
        file: Option<&str>,
        progress: Option<i64>,
        status: Option<&str>,
    ) -> bool {
        if self.is_complete() || !self.is_job_valid(job_id) {
            return false;
        }
        let job_progress = progress.unwrap_or(0).clamp(0, 100) as f64;
        let done_share = 100.0 * self.completed as f64 / self.total as f64;
        self.progress = job_progress / self.total as f64 + done_share;

        if let Some(file) = file {
            self.current_file = Some(
                Path::new(file)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.to_string()),
            );
        }
        self.status = Some(status.unwrap_or("Please wait...").to_string());
        true
    }

    /// Completion callback. Ignored once the job is complete.
    pub fn finish(&mut self, job_id: u64, file: Option<&str>, state: JobState) -> bool {
        if self.is_complete() || !self.is_job_valid(job_id) {
            return false;
        }
        match state.failure_description() {
            Some(description) => self.failed(job_id, file, description),
            None => {
                self.job_completed();
                true
            }
        }
    }

    pub fn failed(&mut self, job_id: u64, file: Option<&str>, description: &str) -> bool {
        if self.is_complete() || !self.is_job_valid(job_id) {
            return false;
        }
        warn!(job_id, file, description, "host job failed");
        self.failures.push(JobFailure {
            file: file.map(str::to_string),
            description: description.to_string(),
        });
        self.job_completed();
        true
    }

    /// Abort through the callback, then force completion.
    pub fn abort(&mut self) {
        if let Some(callback) = self.abort_callback.as_mut() {
            callback(self.job_id);
        }
        debug!(job_id = self.job_id, "job aborted");
        let failures = std::mem::take(&mut self.failures);
        self.done.resolve(JobOutcome::Aborted { failures });
    }

    fn job_completed(&mut self) {
        self.completed += 1;
        if self.completed < self.total {
            return;
        }
        self.progress = 100.0;
        let failures = std::mem::take(&mut self.failures);
        self.done.resolve(JobOutcome::Completed { failures });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_one_shot_resolves_once() {
        let (mut tx, rx) = one_shot();
        assert!(tx.resolve(1));
        assert!(!tx.resolve(2));
        assert_eq!(futures::executor::block_on(rx), Ok(1));
    }

    #[test]
    fn test_dropped_resolver_reports_error() {
        let (tx, rx) = one_shot::<u32>();
        drop(tx);
        assert_eq!(futures::executor::block_on(rx), Err(JobError::Dropped));
    }

    #[test]
    fn test_foreign_job_ids_are_ignored() {
        let (mut job, mut done) = JobProgress::new(1);
        job.set_job_id(7);
        assert!(!job.update(8, None, Some(50), None));
        assert!(!job.finish(8, None, JobState::Succeeded));
        assert!(done.try_take().is_none());
        assert!(job.finish(7, None, JobState::Succeeded));
        assert_eq!(done.try_take(), Some(JobOutcome::Completed { failures: vec![] }));
    }

    #[test]
    fn test_sub_jobs_count_for_the_import() {
        let (job, _done) = JobProgress::new(1);
        let mut job = job.with_sub_jobs(Box::new(|candidate, tracked| candidate == tracked + 100));
        job.set_job_id(1);
        assert!(job.update(101, Some("/cad/part.stp"), Some(10), None));
        assert_eq!(job.current_file(), Some("part.stp"));
    }

    #[test]
    fn test_multi_file_progress() {
        let (mut job, _done) = JobProgress::new(4);
        job.set_job_id(1);
        job.finish(1, None, JobState::Succeeded);
        job.update(1, None, Some(50), None);
        assert!((job.progress() - 37.5).abs() < 1e-9);
    }

    #[test]
    fn test_incomplete_state_is_a_failure() {
        let (mut job, mut done) = JobProgress::new(1);
        job.set_job_id(3);
        job.finish(3, Some("a.fbx"), JobState::Incomplete);
        match done.try_take() {
            Some(JobOutcome::Completed { failures }) => assert_eq!(failures.len(), 1),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_late_callbacks_are_ignored() {
        let (mut job, mut done) = JobProgress::new(1);
        job.set_job_id(5);
        assert!(job.finish(5, Some("a.fbx"), JobState::Succeeded));
        assert_eq!(done.try_take(), Some(JobOutcome::Completed { failures: vec![] }));

        assert!(!job.update(5, Some("b.fbx"), Some(80), None));
        assert!(!job.finish(5, None, JobState::Succeeded));
        assert!(!job.failed(5, None, "late failure"));
        assert_eq!(job.progress(), 100.0);
        assert_eq!(job.current_file(), None);
    }

    #[test]
    fn test_callbacks_after_abort_are_ignored() {
        let (mut job, _done) = JobProgress::new(2);
        job.set_job_id(2);
        job.update(2, None, Some(40), None);
        job.abort();
        assert!(!job.update(2, None, Some(90), None));
        assert!(job.progress() <= 100.0);
    }

    #[test]
    fn test_abort_calls_back_and_completes() {
        let called = Rc::new(Cell::new(None));
        let seen = called.clone();
        let (mut job, mut done) = JobProgress::new(3);
        job.set_job_id(9);
        job.set_abort_callback(Some(Box::new(move |id| seen.set(id))));
        job.abort();
        assert_eq!(called.get(), Some(9));
        assert!(job.is_complete());
        assert_eq!(done.try_take(), Some(JobOutcome::Aborted { failures: vec![] }));
    }
}
