pub mod config;
pub mod infra;
pub mod rl;
pub mod sim;

// Re-export commonly used types for convenience
pub use config::{ConfigError, Mode, Settings};
pub use infra::{AgentState, PerRole, Role, World};
pub use rl::{HideSeekEnv, LearningAgent, ReplayBuffer, StateEncoder, Trainer};
