//! The single background worker for flush and compaction.
//!
//! One consumer thread drains a bounded job queue, so at most one flush or
//! compaction runs at a time and submission order is execution order.
//! Callers create a [`Task`] handle and hand it to [`Worker::submit`]
//! together with the job; the worker resolves the task when the job runs.
//! Creating the task first lets a caller publish it (e.g. under a lock)
//! before the job is enqueued, and any number of threads can block on the
//! same task, each receiving the job's result.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Sender};

use crate::error::{Error, Result};

/// Queue depth. Back-pressure on flushes is enforced at the state level;
/// this only bounds memory if callers submit faster than jobs drain.
const QUEUE_CAPACITY: usize = 8;

struct Job {
    name: &'static str,
    run: Box<dyn FnOnce() -> Result<()> + Send>,
    task: Task,
}

/// Completion handle for a submitted job. Cloning shares the handle; every
/// clone observes the same result.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    result: Mutex<Option<Result<()>>>,
    done: Condvar,
}

impl Task {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TaskInner {
                result: Mutex::new(None),
                done: Condvar::new(),
            }),
        }
    }

    /// An already-completed task, for paths that have nothing to wait on.
    pub fn completed() -> Self {
        let task = Self::new();
        task.complete(Ok(()));
        task
    }

    pub(crate) fn complete(&self, result: Result<()>) {
        let mut guard = self.inner.result.lock().unwrap();
        *guard = Some(result);
        self.inner.done.notify_all();
    }

    /// Blocks until the job has run and returns its result.
    pub fn wait(&self) -> Result<()> {
        let mut guard = self.inner.result.lock().unwrap();
        while guard.is_none() {
            guard = self.inner.done.wait(guard).unwrap();
        }
        guard.clone().unwrap()
    }
}

/// The background executor: a named thread consuming a bounded job queue.
pub struct Worker {
    tx: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(thread_name: &str) -> Self {
        let (tx, rx) = bounded::<Job>(QUEUE_CAPACITY);
        let handle = std::thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                for job in rx {
                    tracing::debug!(task = job.name, "running background task");
                    let run = job.run;
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(run))
                        .unwrap_or_else(|_| {
                            Err(Error::InvalidState("background task panicked".to_string()))
                        });
                    if let Err(e) = &result {
                        tracing::error!(task = job.name, error = %e, "background task failed");
                    }
                    job.task.complete(result);
                }
            })
            .expect("failed to spawn background worker");

        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueues a job that resolves the given task when it runs. On error
    /// the task is untouched; the caller decides whether to complete it.
    pub fn submit<F>(&self, name: &'static str, task: Task, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let tx = self.tx.lock()?;
        let tx = tx.as_ref().ok_or(Error::Closed)?;
        tx.send(Job {
            name,
            run: Box::new(job),
            task,
        })
        .map_err(|_| Error::Closed)?;
        Ok(())
    }

    /// Closes the queue, drains queued jobs, and joins the thread.
    /// Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        drop(self.tx.lock()?.take());
        if let Some(handle) = self.handle.lock()?.take() {
            handle
                .join()
                .map_err(|_| Error::InvalidState("background worker panicked".to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_submit_and_wait() {
        let worker = Worker::new("test-worker");
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        let task = Task::new();
        worker
            .submit("increment", task.clone(), move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        task.wait().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_jobs_run_in_submission_order() {
        let worker = Worker::new("test-worker");
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..10 {
            let order = Arc::clone(&order);
            let task = Task::new();
            worker
                .submit("ordered", task.clone(), move || {
                    order.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();
            tasks.push(task);
        }
        for task in tasks {
            task.wait().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_error_propagates_to_waiter() {
        let worker = Worker::new("test-worker");
        let task = Task::new();
        worker
            .submit("failing", task.clone(), || {
                Err(Error::IO("disk on fire".to_string()))
            })
            .unwrap();
        assert_eq!(task.wait(), Err(Error::IO("disk on fire".to_string())));
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_multiple_waiters_get_the_result() {
        let worker = Worker::new("test-worker");
        let task = Task::new();
        worker
            .submit("slow", task.clone(), || {
                std::thread::sleep(Duration::from_millis(20));
                Ok(())
            })
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let task = task.clone();
            handles.push(std::thread::spawn(move || task.wait()));
        }
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_drains_queued_jobs() {
        let worker = Worker::new("test-worker");
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let c = Arc::clone(&counter);
            worker
                .submit("drain", Task::new(), move || {
                    std::thread::sleep(Duration::from_millis(5));
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }

        worker.shutdown().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let worker = Worker::new("test-worker");
        worker.shutdown().unwrap();
        assert!(matches!(
            worker.submit("late", Task::new(), || Ok(())),
            Err(Error::Closed)
        ));
        // shutdown is idempotent
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_panicking_job_reports_invalid_state() {
        let worker = Worker::new("test-worker");
        let task = Task::new();
        worker
            .submit("panicking", task.clone(), || panic!("boom"))
            .unwrap();
        assert!(matches!(task.wait(), Err(Error::InvalidState(_))));

        // the worker survives and keeps processing
        let task = Task::new();
        worker.submit("after", task.clone(), || Ok(())).unwrap();
        task.wait().unwrap();
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_completed_task() {
        Task::completed().wait().unwrap();
    }
}
