//! Deferred evaluation of slot regions on a shared worker pool.
//!
//! A [`Request`] wraps a computation that has not run yet. Submitting it
//! hands the computation to the [`Scheduler`]; waiting on it either blocks
//! until a worker has finished it or, if no worker has picked it up yet,
//! runs it on the waiting thread. A waiter therefore never parks a worker
//! behind work that is still queued, so nested waits always make progress.

use roiflow_core::{Error, Result};
use std::any::Any;
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Scheduler configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SchedulerConfig {
    /// Worker threads; `None` uses the available parallelism.
    pub num_threads: Option<usize>,
    /// Prefix of worker thread names.
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_threads: None,
            thread_name_prefix: "roiflow-worker".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Sets the worker count, clamped to at least one thread.
    #[must_use]
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads.max(1));
        self
    }

    /// Sets the worker count with validation.
    ///
    /// # Errors
    /// Returns an error if `num_threads` is zero.
    pub fn try_with_num_threads(mut self, num_threads: usize) -> Result<Self> {
        if num_threads == 0 {
            return Err(Error::Config(
                "scheduler requires at least one worker thread".to_string(),
            ));
        }
        self.num_threads = Some(num_threads);
        Ok(self)
    }

    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Worker count after resolving the automatic setting.
    #[must_use]
    pub fn effective_num_threads(&self) -> usize {
        self.num_threads
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, NonZeroUsize::get))
    }
}

/// Worker pool executing submitted requests.
///
/// Each graph is bound to one scheduler for its lifetime; there is no
/// process-wide pool.
#[derive(Debug)]
pub struct Scheduler {
    pool: rayon::ThreadPool,
    num_threads: usize,
}

impl Scheduler {
    /// Starts the worker pool.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the threads cannot be spawned.
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        let num_threads = config.effective_num_threads();
        let prefix = config.thread_name_prefix.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("failed to start worker pool: {e}")))?;
        log::debug!("scheduler started with {num_threads} worker threads");
        Ok(Self { pool, num_threads })
    }

    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        self.pool.spawn(job);
    }
}

type Job<T> = Box<dyn FnOnce() -> Result<T> + Send>;
type FinishedCallback<T> = Box<dyn FnOnce(&Result<T>) + Send>;

enum Stage<T> {
    Pending(Job<T>),
    Running,
    Finished(Result<T>),
}

struct State<T> {
    stage: Stage<T>,
    callbacks: Vec<FinishedCallback<T>>,
}

struct Shared<T> {
    label: String,
    submitted: AtomicBool,
    state: Mutex<State<T>>,
    finished: Condvar,
}

impl<T: Clone + Send + 'static> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs the job if nobody has claimed it yet.
    fn run(&self) {
        let job = {
            let mut state = self.lock();
            match std::mem::replace(&mut state.stage, Stage::Running) {
                Stage::Pending(job) => job,
                other => {
                    state.stage = other;
                    return;
                }
            }
        };

        log::trace!("running request '{}'", self.label);
        let result = match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(result) => result,
            Err(payload) => Err(Error::compute(&self.label, panic_message(&*payload))),
        };
        if let Err(e) = &result {
            log::debug!("request '{}' failed: {e}", self.label);
        }

        let callbacks = {
            let mut state = self.lock();
            state.stage = Stage::Finished(result.clone());
            self.finished.notify_all();
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback(&result);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

/// Handle to a deferred computation.
///
/// Clones share the same computation and result. A request that is never
/// submitted nor waited on is dropped without running.
pub struct Request<T> {
    shared: Arc<Shared<T>>,
    scheduler: Option<Arc<Scheduler>>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Request<T> {
    /// Wraps `job` for execution on `scheduler`.
    pub fn new(
        scheduler: Arc<Scheduler>,
        job: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> Self {
        Self::labeled(scheduler, "request", job)
    }

    /// Like [`Request::new`], naming the request in logs and panic reports.
    pub fn labeled(
        scheduler: Arc<Scheduler>,
        label: impl Into<String>,
        job: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                label: label.into(),
                submitted: AtomicBool::new(false),
                state: Mutex::new(State {
                    stage: Stage::Pending(Box::new(job)),
                    callbacks: Vec::new(),
                }),
                finished: Condvar::new(),
            }),
            scheduler: Some(scheduler),
        }
    }

    /// A request that has already finished with `result`.
    pub fn finished(result: Result<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                label: "finished".to_string(),
                submitted: AtomicBool::new(true),
                state: Mutex::new(State {
                    stage: Stage::Finished(result),
                    callbacks: Vec::new(),
                }),
                finished: Condvar::new(),
            }),
            scheduler: None,
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Queues the computation on the worker pool. Submitting twice is a
    /// no-op.
    pub fn submit(&self) -> &Self {
        if self.shared.submitted.swap(true, Ordering::AcqRel) {
            return self;
        }
        if let Some(scheduler) = &self.scheduler {
            let shared = Arc::clone(&self.shared);
            scheduler.spawn(move || shared.run());
        }
        self
    }

    /// Returns true once a result is available.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self.shared.lock().stage, Stage::Finished(_))
    }

    /// Blocks until the result is available and returns it.
    ///
    /// If the computation has not started, it runs on the calling thread.
    ///
    /// # Errors
    /// Returns the computation's error. A panic inside the computation is
    /// reported as [`Error::Compute`].
    pub fn wait(&self) -> Result<T> {
        self.shared.run();
        let mut state = self.shared.lock();
        loop {
            if let Stage::Finished(result) = &state.stage {
                return result.clone();
            }
            state = self
                .shared
                .finished
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Registers `callback` to receive the result. Runs immediately on the
    /// calling thread if the request has already finished.
    pub fn notify_finished(&self, callback: impl FnOnce(&Result<T>) + Send + 'static) {
        let result = {
            let mut state = self.shared.lock();
            match &state.stage {
                Stage::Finished(result) => result.clone(),
                _ => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&result);
    }
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("label", &self.shared.label)
            .field("submitted", &self.shared.submitted.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Submits every request, then waits for all of them in order.
///
/// # Errors
/// Returns the first error encountered, after all requests have settled.
pub fn wait_all<T: Clone + Send + 'static>(requests: &[Request<T>]) -> Result<Vec<T>> {
    for request in requests {
        request.submit();
    }
    let results: Vec<Result<T>> = requests.iter().map(Request::wait).collect();
    results.into_iter().collect()
}
