//! Training loop: drives episodes, stores transitions and schedules Double-DQN updates

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use super::action_space::{ActionSpace, ActionValue, MovementCommand};
use super::agent::{AgentConfig, LearningAgent};
use super::checkpoint::{CheckpointError, CheckpointManager};
use super::env::{EnvConfig, HideSeekEnv};
use super::history::StateHistories;
use super::metrics::{EpisodeMetrics, EvaluationMetrics, MetricsHistory, TrainingMetrics};
use super::policy::{BurnQFunction, NetworkConfig, QFunction};
use super::queue::{QueueStats, TrainJob, TrainingQueue};
use super::replay_buffer::{BufferConfig, ReplayBuffer, Transition};
use crate::infra::{DefaultObserver, EpisodeObserver, PerRole, Role};

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Episode number at which training stops
    pub total_episodes: usize,
    /// Global steps between training requests
    pub train_every: usize,
    /// Global steps between hard target syncs
    pub target_sync_every: usize,
    /// Minimum wall-clock gap between two gradient steps
    pub min_train_spacing_ms: u64,
    pub queue_capacity: usize,
    /// Checkpoint save frequency (episodes)
    pub checkpoint_every: usize,
    pub checkpoint_dir: String,
    /// Episodes between rolling console summaries
    pub log_frequency: usize,
    pub metrics_window: usize,
    pub demo_episodes: usize,
    /// Continue from this checkpoint directory, or the latest one when set to "latest"
    pub resume_from: Option<String>,
    pub action_space: ActionSpace,
    pub network: NetworkConfig,
    pub buffer: BufferConfig,
    pub seeker: AgentConfig,
    pub hider: AgentConfig,
    pub env: EnvConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            total_episodes: 1000,
            train_every: 4,
            target_sync_every: 1000,
            min_train_spacing_ms: 50,
            queue_capacity: 4,
            checkpoint_every: 50,
            checkpoint_dir: "checkpoints".to_string(),
            log_frequency: 10,
            metrics_window: 100,
            demo_episodes: 5,
            resume_from: None,
            action_space: ActionSpace::default(),
            network: NetworkConfig::default(),
            buffer: BufferConfig::default(),
            seeker: AgentConfig::seeker(),
            hider: AgentConfig::hider(),
            env: EnvConfig::default(),
        }
    }
}

impl TrainConfig {
    /// Approximator input width: one encoded state per history slot
    pub fn input_size(&self, state_size: usize) -> usize {
        self.env.history_len * state_size
    }
}

/// Per-role agents backed by the Burn MLP
pub fn burn_agents<B: AutodiffBackend>(
    config: &TrainConfig,
    state_size: usize,
    device: &B::Device,
) -> PerRole<Arc<LearningAgent<BurnQFunction<B>>>> {
    let input_size = config.input_size(state_size);
    let output_size = config.action_space.output_size();
    let build = |role: Role, agent_config: &AgentConfig| {
        let model = BurnQFunction::<B>::new(
            device.clone(),
            input_size,
            output_size,
            &config.network,
            agent_config.learning_rate,
            agent_config.seed,
        );
        Arc::new(LearningAgent::new(
            role,
            agent_config.clone(),
            config.action_space,
            model,
        ))
    };
    PerRole::new(
        build(Role::Seeker, &config.seeker),
        build(Role::Hider, &config.hider),
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Running totals of one episode
#[derive(Default)]
struct EpisodeTally {
    decisions: usize,
    rewards: PerRole<f32>,
    histogram: PerRole<BTreeMap<usize, u64>>,
    losses: PerRole<Vec<f32>>,
}

fn mean(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f32>() / values.len() as f32)
    }
}

/// Owns the environment, both learners and their replay buffers for a session
pub struct Trainer<Q> {
    config: TrainConfig,
    env: HideSeekEnv,
    agents: PerRole<Arc<LearningAgent<Q>>>,
    buffers: PerRole<Arc<Mutex<ReplayBuffer>>>,
    histories: StateHistories,
    queue: TrainingQueue<Q>,
    metrics: TrainingMetrics,
    history: MetricsHistory,
    checkpoints: CheckpointManager,
    observer: Box<dyn EpisodeObserver>,
    global_step: usize,
    next_episode: usize,
}

impl<Q: QFunction> Trainer<Q> {
    /// Must be called inside a tokio runtime; spawns the training queue worker
    pub fn new(config: TrainConfig, env: HideSeekEnv, agents: PerRole<Arc<LearningAgent<Q>>>) -> Self {
        let state_size = env.state_size();
        let histories = StateHistories::new(env.config().history_len, state_size);

        for (role, agent) in agents.iter() {
            if agent.action_space() != config.action_space {
                tracing::warn!(%role, "Agent action space differs from the configured one");
            }
        }

        let buffer_for = |offset: u64| {
            Arc::new(Mutex::new(ReplayBuffer::new(&BufferConfig {
                state_size: Some(state_size),
                seed: config.buffer.seed.map(|seed| seed.wrapping_add(offset)),
                ..config.buffer.clone()
            })))
        };
        let buffers = PerRole::new(buffer_for(0), buffer_for(1));

        let queue = TrainingQueue::new(
            config.queue_capacity,
            Duration::from_millis(config.min_train_spacing_ms),
        );
        let metrics = TrainingMetrics::new(config.metrics_window);
        let checkpoints = CheckpointManager::new(&config.checkpoint_dir);

        Self {
            config,
            env,
            agents,
            buffers,
            histories,
            queue,
            metrics,
            history: MetricsHistory::default(),
            checkpoints,
            observer: Box::new(DefaultObserver),
            global_step: 0,
            next_episode: 0,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn EpisodeObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn env(&self) -> &HideSeekEnv {
        &self.env
    }

    pub fn agents(&self) -> &PerRole<Arc<LearningAgent<Q>>> {
        &self.agents
    }

    pub fn buffers(&self) -> &PerRole<Arc<Mutex<ReplayBuffer>>> {
        &self.buffers
    }

    pub fn history(&self) -> &MetricsHistory {
        &self.history
    }

    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn next_episode(&self) -> usize {
        self.next_episode
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Restore models, exploration rates and metrics history.
    ///
    /// With no directory the most recent periodic checkpoint is used.
    pub fn resume(&mut self, dir: Option<&Path>) -> Result<usize, CheckpointError> {
        let dir = match dir {
            Some(dir) => dir.to_path_buf(),
            None => self
                .checkpoints
                .latest()
                .ok_or_else(|| CheckpointError::NotFound(self.checkpoints.root().to_path_buf()))?,
        };
        let document = self.checkpoints.load(&dir, &self.agents)?;
        self.history = document.history;
        self.next_episode = document.episode + 1;
        tracing::info!("Continuing training at episode {}", self.next_episode);
        Ok(self.next_episode)
    }

    /// Train until `total_episodes` is reached. Aborted episodes are skipped, never fatal.
    pub async fn run(&mut self) {
        tracing::info!(
            "Starting training at episode {} of {}",
            self.next_episode,
            self.config.total_episodes
        );

        while self.next_episode < self.config.total_episodes {
            let episode = self.next_episode;
            self.next_episode += 1;

            if self.run_episode(episode).await.is_none() {
                continue;
            }

            let log_frequency = self.config.log_frequency;
            if log_frequency > 0 && self.metrics.episodes % log_frequency == 0 {
                self.metrics.log_to_console();
            }

            let checkpoint_every = self.config.checkpoint_every;
            if checkpoint_every > 0 && (episode + 1) % checkpoint_every == 0 {
                self.checkpoint(episode);
            }
        }

        tracing::info!("Training complete!");
    }

    /// One learning episode; `None` when it never reached the seeking phase
    pub async fn run_episode(&mut self, episode: usize) -> Option<EpisodeMetrics> {
        let metrics = self.play_episode(episode, true).await?;
        self.metrics.record_episode(&metrics);
        self.history.push(metrics.clone());
        Some(metrics)
    }

    /// Greedy playback without exploration, storage or training
    pub async fn run_demo(&mut self, episodes: usize) -> EvaluationMetrics {
        let mut evaluation = EvaluationMetrics::new();
        for episode in 0..episodes {
            if let Some(metrics) = self.play_episode(episode, false).await {
                evaluation.record_episode(&metrics);
            }
        }
        evaluation.print_summary();
        evaluation
    }

    /// Periodic checkpoint; failures are logged and training continues
    pub fn checkpoint(&mut self, episode: usize) -> Option<PathBuf> {
        match self.checkpoints.save(episode, &self.agents, &self.history) {
            Ok(path) => {
                self.observer.on_checkpoint(episode, &path);
                Some(path)
            }
            Err(e) => {
                tracing::error!("Checkpoint for episode {} failed: {}", episode, e);
                None
            }
        }
    }

    /// Stop the training queue without checkpointing
    pub async fn shutdown(self) -> QueueStats {
        self.queue.shutdown().await
    }

    /// Stop the training queue and write the final checkpoint
    pub async fn finish(self) -> Result<PathBuf, CheckpointError> {
        let stats = self.queue.shutdown().await;
        tracing::info!(
            "Training queue: {} submitted, {} completed, {} skipped, {} dropped",
            stats.submitted,
            stats.completed,
            stats.skipped,
            stats.dropped
        );
        let episode = self.next_episode.saturating_sub(1);
        self.checkpoints
            .save_final(episode, &self.agents, &self.history)
    }

    async fn play_episode(&mut self, episode: usize, learn: bool) -> Option<EpisodeMetrics> {
        self.observer.on_episode_start(episode);
        let Some(observations) = self.env.reset(episode).await else {
            self.observer.on_episode_aborted(episode);
            return None;
        };

        self.histories
            .reset(observations.iter().map(|o| o.id.as_str()));
        let mut latest: BTreeMap<String, (Role, Vec<f32>)> = observations
            .into_iter()
            .map(|o| (o.id, (o.role, o.observation)))
            .collect();
        let mut cached: BTreeMap<String, ActionValue> = BTreeMap::new();
        let mut tally = EpisodeTally::default();
        let interval = self.env.config().decision_interval.max(1);

        loop {
            if self.env.steps() % interval == 0 {
                tally.decisions += 1;
                cached.clear();
                for (id, (role, state)) in &latest {
                    self.histories.push(id, state.clone());
                    let Some(history) = self.histories.get(id) else {
                        continue;
                    };
                    let sequence = history.flattened();
                    let agent = self.agents.get(*role);
                    let action = if learn {
                        agent.select_action(&sequence)
                    } else {
                        agent.select_greedy(&sequence)
                    };
                    *tally
                        .histogram
                        .get_mut(*role)
                        .entry(action.key())
                        .or_default() += 1;
                    cached.insert(id.clone(), action);
                }
            }

            let commands: HashMap<String, MovementCommand> = cached
                .iter()
                .map(|(id, action)| (id.clone(), action.to_command()))
                .collect();
            let result = self.env.step(&commands);
            self.global_step += 1;

            for step in result.agents {
                *tally.rewards.get_mut(step.role) += step.reward;

                if learn && let Some(action) = cached.get(&step.id) {
                    lock(self.buffers.get(step.role)).add(Transition {
                        state: step.state,
                        action: *action,
                        reward: step.reward,
                        next_state: step.next_state.clone(),
                        done: step.done,
                        agent_id: step.id.clone(),
                    });
                }

                if step.done {
                    latest.remove(&step.id);
                    cached.remove(&step.id);
                } else {
                    latest.insert(step.id, (step.role, step.next_state));
                }
            }

            if learn {
                self.schedule_training();
                for (role, loss) in self.queue.drain_losses() {
                    tally.losses.get_mut(role).push(loss);
                }
            }

            tokio::task::yield_now().await;
            if result.done {
                break;
            }
        }

        if learn {
            for (_, agent) in self.agents.iter() {
                agent.decay_epsilon();
            }
        }

        let metrics = self.episode_metrics(episode, tally);
        self.observer.on_episode_end(&metrics);
        Some(metrics)
    }

    fn schedule_training(&mut self) {
        if self.global_step % self.config.train_every.max(1) == 0 {
            for (role, agent) in self.agents.iter() {
                self.queue.submit(TrainJob {
                    agent: agent.clone(),
                    buffer: self.buffers.get(role).clone(),
                    histories: self.histories.clone(),
                });
            }
        }

        if self.global_step % self.config.target_sync_every.max(1) == 0 {
            for (_, agent) in self.agents.iter() {
                agent.update_target_model();
            }
        }
    }

    fn episode_metrics(&self, episode: usize, tally: EpisodeTally) -> EpisodeMetrics {
        let trackers = self.env.trackers();
        let distance_traveled = trackers.values().map(|t| t.distance_traveled).sum();
        let unique_cells: usize = trackers.values().map(|t| t.unique_cells()).sum();
        let attempted: u32 = trackers.values().map(|t| t.jumps_attempted).sum();
        let succeeded: u32 = trackers.values().map(|t| t.jumps_succeeded).sum();
        let status = self.env.status();

        EpisodeMetrics {
            episode,
            steps: self.env.steps(),
            terminal: self.env.terminal(),
            total_reward: tally.rewards.seeker + tally.rewards.hider,
            role_rewards: tally.rewards,
            distance_traveled,
            unique_cells,
            exploration_score: unique_cells as f32 / tally.decisions.max(1) as f32,
            action_histogram: tally.histogram,
            jump_success_ratio: if attempted > 0 {
                succeeded as f32 / attempted as f32
            } else {
                0.0
            },
            final_epsilon: PerRole::new(self.agents.seeker.epsilon(), self.agents.hider.epsilon()),
            buffer_utilization: PerRole::new(
                lock(&self.buffers.seeker).stats().utilization,
                lock(&self.buffers.hider).stats().utilization,
            ),
            mean_loss: PerRole::new(mean(&tally.losses.seeker), mean(&tally.losses.hider)),
            train_steps: tally.losses.seeker.len() + tally.losses.hider.len(),
            hiders_found: status.resolved_count,
            total_hiders: status.total_targets,
        }
    }
}
