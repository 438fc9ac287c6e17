use std::path::Path;

use tracing::{debug, info, warn};

use super::episode_observer::EpisodeObserver;
use crate::rl::metrics::EpisodeMetrics;

pub struct DefaultObserver;

impl EpisodeObserver for DefaultObserver {
    fn on_episode_start(&mut self, episode: usize) {
        debug!("Episode {} starting", episode);
    }

    fn on_episode_end(&mut self, metrics: &EpisodeMetrics) {
        let outcome = metrics
            .terminal
            .map(|t| t.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        info!(
            "Episode {} finished ({}) | steps={} | reward: seeker={:.2}, hider={:.2} | found {}/{}",
            metrics.episode,
            outcome,
            metrics.steps,
            metrics.role_rewards.seeker,
            metrics.role_rewards.hider,
            metrics.hiders_found,
            metrics.total_hiders
        );
        debug!(
            "- distance={:.1}, cells={}, exploration={:.3}, jumps={:.2}, train steps={}",
            metrics.distance_traveled,
            metrics.unique_cells,
            metrics.exploration_score,
            metrics.jump_success_ratio,
            metrics.train_steps
        );
    }

    fn on_episode_aborted(&mut self, episode: usize) {
        warn!("Episode {} aborted before the seeking phase", episode);
    }

    fn on_checkpoint(&mut self, episode: usize, path: &Path) {
        info!("Checkpoint for episode {} at {}", episode, path.display());
    }
}
