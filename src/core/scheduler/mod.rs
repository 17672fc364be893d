// src/core/scheduler/mod.rs

//! Fixed-size worker pool for tree insertion and splitting.
//!
//! Tasks run to completion on one worker and may submit further tasks through
//! the [`Spawner`] they receive. The queue is bounded; when it is full a
//! submitted task runs inline on the submitting thread instead, so recursive
//! fan-out can never deadlock the pool.

use crate::core::common::MdBoxError;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::warn;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

const QUEUE_SLOTS_PER_WORKER: usize = 64;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task panicked: {0}")]
    Panicked(String),
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),
}

impl From<SchedulerError> for MdBoxError {
    fn from(err: SchedulerError) -> Self {
        Self::Task(err.to_string())
    }
}

type Job = Box<dyn FnOnce(&Spawner) -> Result<(), MdBoxError> + Send + 'static>;

enum Message {
    Run(Job),
    Shutdown,
}

/// Scheduler statistics
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Tasks run on the submitting thread because the queue was full.
    pub inline_tasks: u64,
    pub total_execution_time: Duration,
    pub average_execution_time: Duration,
    pub uptime: Duration,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<usize>,
    idle: Condvar,
    first_error: Mutex<Option<MdBoxError>>,
    stats: Mutex<SchedulerStats>,
}

// Bookkeeping stays usable after a panic; task panics are caught before they reach it.
fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Handle for submitting tasks; cheap to clone and handed to every running task.
#[derive(Clone)]
pub struct Spawner {
    sender: Sender<Message>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Spawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spawner").field("queued", &self.sender.len()).finish()
    }
}

impl Spawner {
    /// Queues `job`, or runs it right here if the queue is full.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce(&Spawner) -> Result<(), MdBoxError> + Send + 'static,
    {
        *relock(&self.shared.pending) += 1;
        relock(&self.shared.stats).total_tasks += 1;
        if let Err(err) = self.sender.try_send(Message::Run(Box::new(job))) {
            if let Message::Run(job) = err.into_inner() {
                relock(&self.shared.stats).inline_tasks += 1;
                self.run(job);
            }
        }
    }

    fn run(&self, job: Job) {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| job(self)));
        let elapsed = started.elapsed();

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                warn!("Scheduler task panicked: {}", msg);
                Some(SchedulerError::Panicked(msg).into())
            }
        };
        {
            let mut stats = relock(&self.shared.stats);
            stats.total_execution_time += elapsed;
            if failure.is_some() {
                stats.failed_tasks += 1;
            } else {
                stats.completed_tasks += 1;
            }
        }
        if let Some(e) = failure {
            let mut first = relock(&self.shared.first_error);
            if first.is_none() {
                *first = Some(e);
            }
        }

        let mut pending = relock(&self.shared.pending);
        *pending -= 1;
        if *pending == 0 {
            self.shared.idle.notify_all();
        }
    }
}

/// A fixed pool of worker threads fed by a bounded queue.
pub struct ThreadScheduler {
    spawner: Spawner,
    workers: Vec<JoinHandle<()>>,
    start_time: Instant,
}

impl std::fmt::Debug for ThreadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadScheduler").field("num_threads", &self.workers.len()).finish()
    }
}

impl ThreadScheduler {
    /// Starts `num_threads` workers; 0 means one per physical core.
    ///
    /// # Errors
    /// `Task` if a worker thread cannot be spawned.
    pub fn new(num_threads: usize) -> Result<Self, MdBoxError> {
        let n = if num_threads == 0 { num_cpus::get_physical().max(1) } else { num_threads };
        Self::with_queue_capacity(n, n * QUEUE_SLOTS_PER_WORKER)
    }

    /// Like [`ThreadScheduler::new`] with an explicit queue bound.
    ///
    /// # Errors
    /// `Task` if a worker thread cannot be spawned.
    pub fn with_queue_capacity(num_threads: usize, capacity: usize) -> Result<Self, MdBoxError> {
        let num_threads = num_threads.max(1);
        let (sender, receiver) = bounded(capacity);
        let spawner = Spawner { sender, shared: Arc::new(Shared::default()) };

        let mut scheduler = Self { spawner, workers: Vec::with_capacity(num_threads), start_time: Instant::now() };
        for i in 0..num_threads {
            let receiver: Receiver<Message> = receiver.clone();
            let spawner = scheduler.spawner.clone();
            let handle = thread::Builder::new()
                .name(format!("mdbox-worker-{}", i))
                .spawn(move || {
                    while let Ok(Message::Run(job)) = receiver.recv() {
                        spawner.run(job);
                    }
                })
                .map_err(|e| SchedulerError::Spawn(e.to_string()))?;
            scheduler.workers.push(handle);
        }
        Ok(scheduler)
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    pub fn spawner(&self) -> Spawner {
        self.spawner.clone()
    }

    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce(&Spawner) -> Result<(), MdBoxError> + Send + 'static,
    {
        self.spawner.submit(job);
    }

    /// Blocks until every submitted task, including tasks they submitted, has finished.
    /// Must not be called from inside a task.
    ///
    /// # Errors
    /// The first error or panic raised by any task since the last join.
    pub fn join_all(&self) -> Result<(), MdBoxError> {
        let shared = &self.spawner.shared;
        let mut pending = relock(&shared.pending);
        while *pending > 0 {
            pending = shared.idle.wait(pending).unwrap_or_else(PoisonError::into_inner);
        }
        drop(pending);
        match relock(&shared.first_error).take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = relock(&self.spawner.shared.stats).clone();
        stats.uptime = self.start_time.elapsed();
        let finished = stats.completed_tasks + stats.failed_tasks;
        if finished > 0 {
            stats.average_execution_time = stats.total_execution_time / finished as u32;
        }
        stats
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        for _ in 0..self.workers.len() {
            let _ = self.spawner.sender.send(Message::Shutdown);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
