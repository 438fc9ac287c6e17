//! Rate-limited training queue: one consumer task, bounded backlog, minimum spacing between steps

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::agent::LearningAgent;
use super::history::StateHistories;
use super::policy::QFunction;
use super::replay_buffer::ReplayBuffer;
use crate::infra::Role;

/// One requested training step
pub struct TrainJob<Q> {
    pub agent: Arc<LearningAgent<Q>>,
    pub buffer: Arc<Mutex<ReplayBuffer>>,
    /// Histories as they were when the job was queued
    pub histories: StateHistories,
}

#[derive(Debug, Default)]
pub struct QueueCounters {
    pub submitted: AtomicU64,
    pub dropped: AtomicU64,
    pub completed: AtomicU64,
    /// Jobs that ran but produced no loss
    pub skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub submitted: u64,
    pub dropped: u64,
    pub completed: u64,
    pub skipped: u64,
}

pub struct TrainingQueue<Q> {
    sender: mpsc::Sender<TrainJob<Q>>,
    stop: watch::Sender<bool>,
    losses: mpsc::UnboundedReceiver<(Role, f32)>,
    counters: Arc<QueueCounters>,
    worker: JoinHandle<()>,
}

impl<Q: QFunction> TrainingQueue<Q> {
    /// Spawn the consumer task; must be called inside a tokio runtime
    pub fn new(capacity: usize, min_spacing: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (stop, stop_rx) = watch::channel(false);
        let (loss_tx, losses) = mpsc::unbounded_channel();
        let counters = Arc::new(QueueCounters::default());

        let worker = tokio::spawn(run_worker(
            receiver,
            stop_rx,
            loss_tx,
            counters.clone(),
            min_spacing,
        ));

        Self {
            sender,
            stop,
            losses,
            counters,
            worker,
        }
    }

    /// Queue a training step; dropped when the backlog is full
    pub fn submit(&self, job: TrainJob<Q>) -> bool {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(role = %job.agent.role(), "Training queue full, dropping job");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Training queue closed");
                false
            }
        }
    }

    /// Losses reported since the last call
    pub fn drain_losses(&mut self) -> Vec<(Role, f32)> {
        let mut losses = Vec::new();
        while let Ok(entry) = self.losses.try_recv() {
            losses.push(entry);
        }
        losses
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker; queued jobs that have not started are discarded
    pub async fn shutdown(self) -> QueueStats {
        let _ = self.stop.send(true);
        drop(self.sender);
        if let Err(e) = self.worker.await {
            tracing::error!("Training worker failed: {}", e);
        }
        let stats = QueueStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        };
        tracing::debug!(?stats, "Training queue stopped");
        stats
    }
}

async fn run_worker<Q: QFunction>(
    mut receiver: mpsc::Receiver<TrainJob<Q>>,
    mut stop: watch::Receiver<bool>,
    losses: mpsc::UnboundedSender<(Role, f32)>,
    counters: Arc<QueueCounters>,
    min_spacing: Duration,
) {
    let mut last_run: Option<Instant> = None;

    loop {
        let job = tokio::select! {
            biased;
            _ = stop.changed() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        if let Some(last) = last_run {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = tokio::time::sleep_until(last + min_spacing) => {}
            }
        }
        last_run = Some(Instant::now());

        let role = job.agent.role();
        match job.agent.train(&job.buffer, &job.histories).await {
            Some(loss) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                let _ = losses.send((role, loss));
            }
            None => {
                counters.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    let pending = receiver.len();
    if pending > 0 {
        tracing::debug!(pending, "Discarding queued training jobs");
    }
}
