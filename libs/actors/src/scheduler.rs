//! Cooperative Scheduler
//!
//! A fixed pool of worker threads sharing one ready queue of event-based
//! actors. A worker pops an actor, runs at most `quantum` messages and then
//! puts it back (quantum exhausted), parks it (mailbox drained) or retires it
//! (terminated). The per-actor schedule token guarantees an actor sits in the
//! queue at most once and never runs on two workers at the same time.

use crate::actor::{ActorRef, ActorState, ResumeResult, DEAD, IDLE, QUEUED, RUNNING};
use crate::system::SystemMetrics;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

enum Job {
    Run(ActorRef),
    Shutdown,
}

/// Worker pool for event-based actors
pub struct Scheduler {
    sender: Sender<Job>,
    /// Kept to drain jobs left behind at shutdown
    receiver: Receiver<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    quantum: usize,
}

impl Scheduler {
    /// Spawn `worker_count` workers
    pub fn start(
        name: &str,
        worker_count: usize,
        quantum: usize,
        metrics: Arc<SystemMetrics>,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = unbounded();
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker = Worker {
                index,
                quantum,
                sender: sender.clone(),
                receiver: receiver.clone(),
                metrics: Arc::clone(&metrics),
            };
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{}", name, index))
                .spawn(move || worker.run())?;
            workers.push(handle);
        }
        info!(workers = worker_count, quantum, "Scheduler started");
        Ok(Self {
            sender,
            receiver,
            workers: Mutex::new(workers),
            worker_count,
            quantum,
        })
    }

    /// Put an actor holding the `Queued` token on the ready queue
    pub(crate) fn schedule(&self, actor: ActorRef) {
        if self.sender.send(Job::Run(actor)).is_err() {
            warn!("Scheduler stopped; dropping ready actor");
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn quantum(&self) -> usize {
        self.quantum
    }

    /// Actors waiting for a worker
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    /// Stop all workers after the jobs already queued
    ///
    /// Safe to call from a worker thread; that worker is not joined.
    pub fn shutdown(&self) {
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        for _ in 0..workers.len() {
            let _ = self.sender.send(Job::Shutdown);
        }
        let current = thread::current().id();
        let mut on_worker = false;
        for handle in workers {
            if handle.thread().id() == current {
                on_worker = true;
                continue;
            }
            if handle.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
        // The calling worker still needs its shutdown job
        let abandoned = if on_worker {
            0
        } else {
            self.receiver.try_iter().count()
        };
        debug!(abandoned, "Scheduler stopped");
    }
}

struct Worker {
    index: usize,
    quantum: usize,
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    metrics: Arc<SystemMetrics>,
}

impl Worker {
    fn run(self) {
        debug!(worker = self.index, "Worker started");
        while let Ok(job) = self.receiver.recv() {
            match job {
                Job::Run(actor) => self.run_actor(actor),
                Job::Shutdown => break,
            }
        }
        debug!(worker = self.index, "Worker stopped");
    }

    fn run_actor(&self, actor: ActorRef) {
        if actor.schedule_state() != QUEUED {
            return;
        }
        actor.set_schedule_state(RUNNING);

        let started = Instant::now();
        let result = actor.resume(self.quantum);
        self.metrics.record_quantum(started.elapsed());

        match result {
            ResumeResult::Yielded => {
                actor.set_state(ActorState::Suspended);
                actor.set_schedule_state(QUEUED);
                let _ = self.sender.send(Job::Run(actor));
            }
            ResumeResult::AwaitingMessage => {
                actor.set_schedule_state(IDLE);
                // A sender may have enqueued after the last dequeue but seen
                // the token as Running
                if !actor.mailbox().is_empty() && actor.try_claim() {
                    let _ = self.sender.send(Job::Run(actor));
                }
            }
            ResumeResult::Terminated => actor.set_schedule_state(DEAD),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
