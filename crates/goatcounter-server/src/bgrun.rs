//! Named background tasks with bounded parallelism.
//!
//! Tasks are registered once with [`Runner::new_task`] and started with
//! [`Runner::run_task`]; one-off work can go through [`Runner::run`]. Every
//! job gets a child of the runner's cancellation token, which is cancelled
//! when [`Runner::wait_for`] times out.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
pub type TaskFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<anyhow::Result<()>> + Send + Sync>;

pub const DEFAULT_HISTORY: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunnerError {
    #[error("{0}: too many jobs running")]
    TooManyJobs(String),

    #[error("{0}: no such task")]
    UnknownTask(String),

    #[error("deadline exceeded waiting for {0:?}")]
    DeadlineExceeded(String),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Job {
    pub id: u64,
    pub task: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

struct Task {
    max_parallel: usize,
    run: TaskFn,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    running: HashMap<u64, Job>,
    history: VecDeque<Job>,
    next_id: u64,
}

pub struct Runner {
    inner: Mutex<Inner>,
    cancel: CancellationToken,
    finished: Notify,
    history_size: usize,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl Runner {
    pub fn new(history_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            cancel: CancellationToken::new(),
            finished: Notify::new(),
            history_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn new_task<F, Fut>(&self, name: &str, max_parallel: usize, f: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let run: TaskFn = Arc::new(move |token| Box::pin(f(token)));
        self.lock().tasks.insert(
            name.to_string(),
            Task {
                max_parallel: max_parallel.max(1),
                run,
            },
        );
    }

    /// Start a registered task.
    pub fn run_task(self: &Arc<Self>, name: &str) -> Result<u64, RunnerError> {
        let run = self
            .lock()
            .tasks
            .get(name)
            .map(|t| Arc::clone(&t.run))
            .ok_or_else(|| RunnerError::UnknownTask(name.to_string()))?;
        self.run(name, move |token| run(token))
    }

    /// Start `f` as a job of `name`. Names that were never registered allow
    /// one job at a time.
    pub fn run<F, Fut>(self: &Arc<Self>, name: &str, f: F) -> Result<u64, RunnerError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = {
            let mut inner = self.lock();
            let max = inner.tasks.get(name).map_or(1, |t| t.max_parallel);
            let n = inner.running.values().filter(|j| j.task == name).count();
            if n >= max {
                return Err(RunnerError::TooManyJobs(name.to_string()));
            }
            inner.next_id += 1;
            let id = inner.next_id;
            inner.running.insert(
                id,
                Job {
                    id,
                    task: name.to_string(),
                    started_at: Utc::now(),
                    finished_at: None,
                    error: None,
                },
            );
            id
        };

        let handle = tokio::spawn(f(self.cancel.child_token()));
        let runner = Arc::clone(self);
        let task = name.to_string();
        tokio::spawn(async move {
            let err = match handle.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => {
                    error!(task = %task, job = id, error = %e, "background task failed");
                    Some(e.to_string())
                }
                Err(e) if e.is_panic() => {
                    error!(task = %task, job = id, "background task panicked");
                    Some("panic".to_string())
                }
                Err(e) => Some(e.to_string()),
            };
            runner.finish(id, err);
        });
        Ok(id)
    }

    fn finish(&self, id: u64, err: Option<String>) {
        {
            let mut inner = self.lock();
            if let Some(mut job) = inner.running.remove(&id) {
                job.finished_at = Some(Utc::now());
                job.error = err;
                inner.history.push_back(job);
                while inner.history.len() > self.history_size {
                    inner.history.pop_front();
                }
            }
        }
        self.finished.notify_waiters();
    }

    pub fn running(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock().running.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    /// The last `size` finished jobs, oldest first.
    pub fn history(&self, size: usize) -> Vec<Job> {
        let inner = self.lock();
        let skip = inner.history.len().saturating_sub(size);
        inner.history.iter().skip(skip).cloned().collect()
    }

    fn is_running(&self, name: &str) -> bool {
        self.lock()
            .running
            .values()
            .any(|j| name.is_empty() || j.task == name)
    }

    /// Block until every job of `name` has finished; an empty name waits for
    /// all jobs.
    pub async fn wait(&self, name: &str) {
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_running(name) {
                return;
            }
            notified.await;
        }
    }

    /// [`Runner::wait`] with a deadline. On timeout every job's token is
    /// cancelled.
    pub async fn wait_for(&self, timeout: Duration, name: &str) -> Result<(), RunnerError> {
        match tokio::time::timeout(timeout, self.wait(name)).await {
            Ok(()) => Ok(()),
            Err(_) => {
                let running = self.running().len();
                info!(running, "cancelling background jobs");
                self.cancel.cancel();
                Err(RunnerError::DeadlineExceeded(name.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn bounded_parallelism() {
        let runner = Arc::new(Runner::default());
        let (tx, rx) = oneshot::channel::<()>();
        let rx = Arc::new(tokio::sync::Mutex::new(Some(rx)));
        runner.new_task("export", 1, move |_| {
            let rx = Arc::clone(&rx);
            async move {
                if let Some(rx) = rx.lock().await.take() {
                    let _ = rx.await;
                }
                Ok(())
            }
        });

        runner.run_task("export").unwrap();
        assert_eq!(
            runner.run_task("export"),
            Err(RunnerError::TooManyJobs("export".into()))
        );
        assert_eq!(runner.running().len(), 1);

        tx.send(()).unwrap();
        runner.wait("export").await;
        assert!(runner.running().is_empty());
        assert_eq!(runner.history(10).len(), 1);

        assert_eq!(
            runner.run_task("nope"),
            Err(RunnerError::UnknownTask("nope".into()))
        );
    }

    #[tokio::test]
    async fn errors_and_panics_are_recorded() {
        let runner = Arc::new(Runner::default());
        runner
            .run("fail", |_| async { Err(anyhow::anyhow!("boom")) })
            .unwrap();
        runner
            .run("panic", |_| async {
                if true {
                    panic!("oh no");
                }
                Ok(())
            })
            .unwrap();
        runner.wait("").await;

        let hist = runner.history(10);
        assert_eq!(hist.len(), 2);
        let fail = hist.iter().find(|j| j.task == "fail").unwrap();
        assert_eq!(fail.error.as_deref(), Some("boom"));
        let panic = hist.iter().find(|j| j.task == "panic").unwrap();
        assert_eq!(panic.error.as_deref(), Some("panic"));
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let runner = Arc::new(Runner::new(3));
        for _ in 0..5 {
            runner.run("quick", |_| async { Ok(()) }).unwrap();
            runner.wait("quick").await;
        }
        let hist = runner.history(10);
        assert_eq!(hist.len(), 3);
        assert_eq!(hist[0].id, 3);
    }

    #[tokio::test]
    async fn wait_for_cancels_on_timeout() {
        let runner = Arc::new(Runner::default());
        runner
            .run("slow", |token| async move {
                token.cancelled().await;
                Ok(())
            })
            .unwrap();

        let res = runner.wait_for(Duration::from_millis(50), "slow").await;
        assert_eq!(res, Err(RunnerError::DeadlineExceeded("slow".into())));

        // The job saw the cancellation and finished.
        runner.wait("slow").await;
        assert!(runner.running().is_empty());
    }
}
