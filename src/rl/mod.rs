//! Reinforcement learning for hide-and-seek using per-role Double-DQN learners
//!
//! This module provides the learning side of the game:
//! - Experience replay per role, with uniform or reward-weighted sampling
//! - A fixed-width state encoder and rolling per-agent state windows
//! - Epsilon-greedy agents over a flat or multi-head action space
//! - Burn MLP approximator with a target network refreshed by hard sync
//!
//! # Architecture
//!
//! ```text
//! World (vision, movement, session, terrain)
//!     │
//!     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  HideSeekEnv                                                │
//! │  - Reset → WaitForActivePhase → Stepping → Terminal         │
//! │  - StateEncoder observations, RewardShaper rewards          │
//! └─────────────────────────────────────────────────────────────┘
//!     │
//!     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Trainer                                                    │
//! │  - Decision cadence, StateHistories, ReplayBuffer per role  │
//! │  - TrainingQueue: bounded, single consumer, rate limited    │
//! │  - CheckpointManager                                        │
//! └─────────────────────────────────────────────────────────────┘
//!     │
//!     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  LearningAgent (seeker, hider)                              │
//! │  - select_action: epsilon-greedy with exploration bonus     │
//! │  - train: Double-DQN labels, QFunction::fit                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod action_space;
pub mod agent;
pub mod checkpoint;
pub mod encoder;
pub mod env;
pub mod history;
pub mod metrics;
pub mod policy;
pub mod queue;
pub mod replay_buffer;
pub mod reward;
pub mod train;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use action_space::{ActionSpace, ActionValue, MovementCommand, MultiHeadAction};
pub use agent::{AgentConfig, AgentStats, LearningAgent};
pub use checkpoint::{CheckpointDocument, CheckpointError, CheckpointManager};
pub use encoder::{EncoderConfig, StateEncoder};
pub use env::{AgentObservation, AgentStep, EnvConfig, EpisodePhase, HideSeekEnv, SeedMode, StepResult};
pub use history::{StateHistories, StateHistory};
pub use metrics::{EpisodeMetrics, EvaluationMetrics, MetricsHistory, TrainingMetrics};
pub use policy::{BurnQFunction, ModelError, Net, NetworkConfig, QFunction, QNetwork};
pub use queue::{QueueStats, TrainJob, TrainingQueue};
pub use replay_buffer::{BufferConfig, BufferStats, ReplayBuffer, Transition};
pub use reward::{EpisodeTracker, Exposure, RewardConfig, RewardShaper};
pub use train::{TrainConfig, Trainer, burn_agents};
