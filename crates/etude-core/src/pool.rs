// src/pool.rs
use crate::error::{EtudeError, EtudeResult};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    pub pin_workers: bool,
    /// Thread names are `{name}-{i}`.
    pub name: String,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            queue_capacity: 10_000,
            pin_workers: false,
            name: "etude-worker".to_string(),
        }
    }
}

struct QueueState<T> {
    jobs: VecDeque<T>,
    shutdown: bool,
}

struct Shared<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        // Jobs run outside the lock, so a poisoned queue is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded FIFO of jobs consumed by a fixed set of worker threads.
pub struct Dispatcher<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> Dispatcher<T> {
    /// Spawn the workers. Each one runs `handler` on every job it takes.
    pub fn start<F>(options: &PoolOptions, handler: F) -> EtudeResult<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                jobs: VecDeque::with_capacity(options.queue_capacity.min(1024)),
                shutdown: false,
            }),
            available: Condvar::new(),
            capacity: options.queue_capacity,
        });
        let handler = Arc::new(handler);
        let core_ids = if options.pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut dispatcher = Self {
            shared,
            workers: Vec::with_capacity(options.workers),
        };

        for i in 0..options.workers {
            let name = format!("{}-{}", options.name, i);
            let core_id = (!core_ids.is_empty()).then(|| core_ids[i % core_ids.len()]);
            let shared = dispatcher.shared.clone();
            let handler = handler.clone();

            let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
                if let Some(id) = core_id {
                    if core_affinity::set_for_current(id) {
                        debug!(worker = i, cpu = id.id, "worker pinned");
                    } else {
                        warn!(worker = i, cpu = id.id, "failed to pin worker");
                    }
                }
                worker_loop(&shared, &*handler);
            });

            match spawned {
                Ok(handle) => dispatcher.workers.push(handle),
                Err(source) => {
                    dispatcher.shutdown();
                    return Err(EtudeError::WorkerSpawn { name, source });
                }
            }
        }

        Ok(dispatcher)
    }

    /// Enqueue a job. A full queue (or one that is shutting down) hands the
    /// job back.
    pub fn submit(&self, job: T) -> Result<(), T> {
        let mut state = self.shared.lock();
        if state.shutdown || state.jobs.len() >= self.shared.capacity {
            return Err(job);
        }
        state.jobs.push_back(job);
        drop(state);
        self.shared.available.notify_one();
        Ok(())
    }

    pub fn queued(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Let the workers finish the queued jobs, then join them.
    pub fn shutdown(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.available.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl<T: Send + 'static> Drop for Dispatcher<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<T>(shared: &Shared<T>, handler: &dyn Fn(T)) {
    loop {
        let job = {
            let mut state = shared.lock();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                if state.shutdown {
                    return;
                }
                state = shared
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        handler(job);
    }
}
