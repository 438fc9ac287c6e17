use std::path::Path;

use crate::rl::metrics::EpisodeMetrics;

/// Trait for observing episode lifecycle events during a training or demo session
pub trait EpisodeObserver: Send {
    /// Called before the environment is reset
    fn on_episode_start(&mut self, _episode: usize) {}

    /// Called when an episode reached a terminal state
    fn on_episode_end(&mut self, metrics: &EpisodeMetrics);

    /// Called when an episode never reached the seeking phase; it produces no metrics
    fn on_episode_aborted(&mut self, episode: usize);

    /// Called after a checkpoint has been written
    fn on_checkpoint(&mut self, _episode: usize, _path: &Path) {}
}
