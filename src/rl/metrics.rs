//! Episode metrics, rolling training statistics and demo evaluation summaries

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::infra::{PerRole, Role, TerminalReason};

/// Moving average calculator
#[derive(Debug, Clone)]
pub struct MovingAverage {
    values: VecDeque<f32>,
    window_size: usize,
    sum: f32,
}

impl MovingAverage {
    pub fn new(window_size: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            sum: 0.0,
        }
    }

    pub fn push(&mut self, value: f32) {
        if !value.is_finite() {
            return;
        }
        if self.values.len() >= self.window_size {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
            }
        }
        self.values.push_back(value);
        self.sum += value;
    }

    pub fn average(&self) -> f32 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f32
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Everything recorded about one finished episode
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMetrics {
    pub episode: usize,
    pub steps: usize,
    pub terminal: Option<TerminalReason>,
    pub total_reward: f32,
    pub role_rewards: PerRole<f32>,
    pub distance_traveled: f32,
    pub unique_cells: usize,
    /// Unique cells per decision step
    pub exploration_score: f32,
    /// Action key -> count, per role
    pub action_histogram: PerRole<BTreeMap<usize, u64>>,
    pub jump_success_ratio: f32,
    pub final_epsilon: PerRole<f32>,
    /// Percentage of each role's replay capacity in use
    pub buffer_utilization: PerRole<f32>,
    /// Mean training loss over the episode, when any training step completed
    pub mean_loss: PerRole<Option<f32>>,
    pub train_steps: usize,
    pub hiders_found: usize,
    pub total_hiders: usize,
}

impl EpisodeMetrics {
    pub fn seeker_won(&self) -> bool {
        self.terminal == Some(TerminalReason::AllFound)
    }
}

/// Rolling training statistics, logged every few episodes
#[derive(Debug)]
pub struct TrainingMetrics {
    pub episode_rewards: MovingAverage,
    pub seeker_rewards: MovingAverage,
    pub hider_rewards: MovingAverage,
    pub episode_lengths: MovingAverage,
    pub seeker_loss: MovingAverage,
    pub hider_loss: MovingAverage,
    /// Fraction of episodes that ended with every hider found
    pub seeker_win_rate: MovingAverage,
    pub exploration: MovingAverage,
    pub episodes: usize,
    pub total_timesteps: usize,
    last_epsilon: PerRole<f32>,
    start_time: Instant,
}

impl TrainingMetrics {
    pub fn new(window_size: usize) -> Self {
        Self {
            episode_rewards: MovingAverage::new(window_size),
            seeker_rewards: MovingAverage::new(window_size),
            hider_rewards: MovingAverage::new(window_size),
            episode_lengths: MovingAverage::new(window_size),
            seeker_loss: MovingAverage::new(window_size),
            hider_loss: MovingAverage::new(window_size),
            seeker_win_rate: MovingAverage::new(window_size),
            exploration: MovingAverage::new(window_size),
            episodes: 0,
            total_timesteps: 0,
            last_epsilon: PerRole::default(),
            start_time: Instant::now(),
        }
    }

    pub fn record_episode(&mut self, episode: &EpisodeMetrics) {
        self.episodes += 1;
        self.total_timesteps += episode.steps;
        self.episode_rewards.push(episode.total_reward);
        self.seeker_rewards.push(episode.role_rewards.seeker);
        self.hider_rewards.push(episode.role_rewards.hider);
        self.episode_lengths.push(episode.steps as f32);
        self.seeker_win_rate
            .push(if episode.seeker_won() { 1.0 } else { 0.0 });
        self.exploration.push(episode.exploration_score);
        if let Some(loss) = episode.mean_loss.seeker {
            self.seeker_loss.push(loss);
        }
        if let Some(loss) = episode.mean_loss.hider {
            self.hider_loss.push(loss);
        }
        self.last_epsilon = episode.final_epsilon.clone();
    }

    pub fn training_duration_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn timesteps_per_second(&self) -> f64 {
        let duration = self.training_duration_secs();
        if duration > 0.0 {
            self.total_timesteps as f64 / duration
        } else {
            0.0
        }
    }

    /// Log current metrics to console
    pub fn log_to_console(&self) {
        tracing::info!(
            "Episode {} | Timesteps {} | SPS {:.1}",
            self.episodes,
            self.total_timesteps,
            self.timesteps_per_second()
        );
        tracing::info!(
            "  Reward: total={:.2}, seeker={:.2}, hider={:.2}, length={:.1}",
            self.episode_rewards.average(),
            self.seeker_rewards.average(),
            self.hider_rewards.average(),
            self.episode_lengths.average()
        );
        tracing::info!(
            "  Seeker wins={:.1}%, exploration={:.3}",
            self.seeker_win_rate.average() * 100.0,
            self.exploration.average()
        );
        tracing::info!(
            "  Losses: seeker={:.4}, hider={:.4} | epsilon: seeker={:.3}, hider={:.3}",
            self.seeker_loss.average(),
            self.hider_loss.average(),
            self.last_epsilon.seeker,
            self.last_epsilon.hider
        );
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Full per-episode history, persisted next to model checkpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsHistory {
    pub episodes: Vec<EpisodeMetrics>,
}

impl MetricsHistory {
    pub fn push(&mut self, metrics: EpisodeMetrics) {
        self.episodes.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }

    /// Number of the last recorded episode, used when continuing a run
    pub fn last_episode(&self) -> Option<usize> {
        self.episodes.last().map(|m| m.episode)
    }
}

/// Summary of greedy playback episodes
#[derive(Debug, Clone, Default)]
pub struct EvaluationMetrics {
    pub num_episodes: usize,
    pub total_steps: usize,
    pub role_rewards: PerRole<f32>,
    pub seeker_wins: usize,
    pub outcomes: BTreeMap<String, usize>,
}

impl EvaluationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_episode(&mut self, episode: &EpisodeMetrics) {
        self.num_episodes += 1;
        self.total_steps += episode.steps;
        for role in Role::ALL {
            *self.role_rewards.get_mut(role) += *episode.role_rewards.get(role);
        }
        if episode.seeker_won() {
            self.seeker_wins += 1;
        }
        let outcome = episode
            .terminal
            .map(|t| t.to_string())
            .unwrap_or_else(|| "aborted".to_string());
        *self.outcomes.entry(outcome).or_default() += 1;
    }

    pub fn avg_reward(&self, role: Role) -> f32 {
        if self.num_episodes > 0 {
            *self.role_rewards.get(role) / self.num_episodes as f32
        } else {
            0.0
        }
    }

    pub fn avg_steps(&self) -> f32 {
        if self.num_episodes > 0 {
            self.total_steps as f32 / self.num_episodes as f32
        } else {
            0.0
        }
    }

    pub fn seeker_win_rate(&self) -> f32 {
        if self.num_episodes > 0 {
            self.seeker_wins as f32 / self.num_episodes as f32
        } else {
            0.0
        }
    }

    pub fn print_summary(&self) {
        tracing::info!("=== Demo Summary ===");
        tracing::info!("Episodes: {}", self.num_episodes);
        tracing::info!("Avg Steps: {:.1}", self.avg_steps());
        tracing::info!(
            "Avg Reward: seeker={:.2}, hider={:.2}",
            self.avg_reward(Role::Seeker),
            self.avg_reward(Role::Hider)
        );
        tracing::info!("Seeker Win Rate: {:.1}%", self.seeker_win_rate() * 100.0);
        for (outcome, count) in &self.outcomes {
            tracing::info!("  {}: {}", outcome, count);
        }
    }
}
