//! Session settings: JSON file, then environment overrides, then validation

use std::env;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::rl::action_space::{ActionSpace, FLAT_ACTIONS};
use crate::rl::agent::AgentConfig;
use crate::rl::env::SeedMode;
use crate::rl::train::TrainConfig;
use crate::sim::ArenaConfig;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: serde_json::Error },
    /// Environment variable present but unparsable
    Override { key: String, value: String },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(formatter, "Cannot read {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(formatter, "Cannot parse {}: {}", path.display(), source)
            }
            ConfigError::Override { key, value } => {
                write!(formatter, "Invalid value '{}' for {}", value, key)
            }
            ConfigError::Invalid(msg) => write!(formatter, "Invalid configuration: {}", msg),
        }
    }
}

impl Error for ConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Learn in the sandbox arena
    Train,
    /// Greedy playback from a checkpoint
    Demo,
    /// Serve the reset/step protocol over WebSocket
    Serve,
}

impl Mode {
    fn parse(value: &str) -> Option<Mode> {
        match value.to_ascii_lowercase().as_str() {
            "train" => Some(Mode::Train),
            "demo" => Some(Mode::Demo),
            "serve" => Some(Mode::Serve),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mode: Mode,
    pub bridge_addr: String,
    pub arena: ArenaConfig,
    pub train: TrainConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: Mode::Train,
            bridge_addr: "127.0.0.1:8765".to_string(),
            arena: ArenaConfig::default(),
            train: TrainConfig::default(),
        }
    }
}

impl Settings {
    /// Defaults, overlaid by the JSON file named in `HIDESEEK_CONFIG` and the `HIDESEEK_*`
    /// environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = match env::var("HIDESEEK_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        settings.apply_overrides(|key| env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Apply `HIDESEEK_*` overrides looked up through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("HIDESEEK_EPISODES") {
            self.train.total_episodes = parse_override("HIDESEEK_EPISODES", &value)?;
        }
        if let Some(value) = lookup("HIDESEEK_SEED") {
            let seed: u64 = parse_override("HIDESEEK_SEED", &value)?;
            self.arena.seed = Some(seed);
            self.train.env.seed_mode = SeedMode::Fixed(seed);
            self.train.buffer.seed = Some(seed);
            self.train.seeker.seed = Some(seed);
            self.train.hider.seed = Some(seed.wrapping_add(1));
        }
        if let Some(value) = lookup("HIDESEEK_CHECKPOINT_DIR") {
            self.train.checkpoint_dir = value;
        }
        if let Some(value) = lookup("HIDESEEK_BRIDGE_ADDR") {
            self.bridge_addr = value;
        }
        if let Some(value) = lookup("HIDESEEK_MODE") {
            self.mode = Mode::parse(&value).ok_or_else(|| ConfigError::Override {
                key: "HIDESEEK_MODE".to_string(),
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("HIDESEEK_RESUME") {
            self.train.resume_from = Some(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let train = &self.train;
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if train.buffer.capacity == 0 {
            return invalid("buffer capacity must be positive".into());
        }
        if train.queue_capacity == 0 {
            return invalid("queue capacity must be positive".into());
        }
        if train.train_every == 0 || train.target_sync_every == 0 {
            return invalid("training cadences must be positive".into());
        }

        let env = &train.env;
        if env.decision_interval == 0 || env.history_len == 0 || env.max_steps == 0 {
            return invalid("decision interval, history length and step cap must be positive".into());
        }
        if env.dt.is_nan() || env.dt <= 0.0 {
            return invalid(format!("dt must be positive, got {}", env.dt));
        }
        if env.reward.clip_min >= env.reward.clip_max {
            return invalid(format!(
                "reward clip range [{}, {}] is empty",
                env.reward.clip_min, env.reward.clip_max
            ));
        }

        for (name, agent) in [("seeker", &train.seeker), ("hider", &train.hider)] {
            validate_agent(name, agent, train.buffer.capacity)?;
        }

        validate_action_space(train.action_space)
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Override {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn validate_agent(name: &str, agent: &AgentConfig, capacity: usize) -> Result<(), ConfigError> {
    if agent.batch_size == 0 || agent.batch_size > capacity {
        return Err(ConfigError::Invalid(format!(
            "{} batch size {} must be in 1..={}",
            name, agent.batch_size, capacity
        )));
    }
    let epsilon_ok = (0.0..=1.0).contains(&agent.epsilon_min)
        && (0.0..=1.0).contains(&agent.epsilon)
        && agent.epsilon_min <= agent.epsilon
        && agent.epsilon_decay > 0.0
        && agent.epsilon_decay <= 1.0;
    if !epsilon_ok {
        return Err(ConfigError::Invalid(format!(
            "{} epsilon settings out of range (epsilon {}, min {}, decay {})",
            name, agent.epsilon, agent.epsilon_min, agent.epsilon_decay
        )));
    }
    if !(0.0..=1.0).contains(&agent.gamma) {
        return Err(ConfigError::Invalid(format!("{} gamma {} not in [0, 1]", name, agent.gamma)));
    }
    if agent.reward_clip_min >= agent.reward_clip_max {
        return Err(ConfigError::Invalid(format!("{} label clip range is empty", name)));
    }
    if agent.learning_rate.is_nan() || agent.learning_rate <= 0.0 {
        return Err(ConfigError::Invalid(format!("{} learning rate must be positive", name)));
    }
    Ok(())
}

/// Heads must tile the approximator output exactly
fn validate_action_space(space: ActionSpace) -> Result<(), ConfigError> {
    if let ActionSpace::Flat { actions } = space
        && !(1..=FLAT_ACTIONS).contains(&actions)
    {
        return Err(ConfigError::Invalid(format!(
            "flat action count {} must be in 1..={}",
            actions, FLAT_ACTIONS
        )));
    }

    let mut next = 0;
    for range in space.head_ranges() {
        if range.start != next || range.is_empty() {
            return Err(ConfigError::Invalid("action heads do not partition the output".into()));
        }
        next = range.end;
    }
    if next != space.output_size() {
        return Err(ConfigError::Invalid(format!(
            "action heads cover {} outputs, approximator has {}",
            next,
            space.output_size()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.mode, Mode::Train);
    }

    #[test]
    fn test_partial_json() {
        let settings = Settings::from_json(
            r#"{"mode": "demo", "train": {"total_episodes": 7, "env": {"max_steps": 99}}}"#,
        )
        .unwrap();
        assert_eq!(settings.mode, Mode::Demo);
        assert_eq!(settings.train.total_episodes, 7);
        assert_eq!(settings.train.env.max_steps, 99);
        assert_eq!(settings.train.env.decision_interval, 4);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let mut settings = Settings::default();
        settings
            .apply_overrides(lookup(&[
                ("HIDESEEK_EPISODES", "12"),
                ("HIDESEEK_SEED", "42"),
                ("HIDESEEK_CHECKPOINT_DIR", "/tmp/ckpt"),
                ("HIDESEEK_MODE", "Serve"),
            ]))
            .unwrap();
        assert_eq!(settings.train.total_episodes, 12);
        assert_eq!(settings.arena.seed, Some(42));
        assert_eq!(settings.train.env.seed_mode, SeedMode::Fixed(42));
        assert_eq!(settings.train.checkpoint_dir, "/tmp/ckpt");
        assert_eq!(settings.mode, Mode::Serve);

        let err = settings
            .apply_overrides(lookup(&[("HIDESEEK_EPISODES", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Override { .. }));
    }

    #[test]
    fn test_validation_failures() {
        let mut settings = Settings::default();
        settings.train.seeker.batch_size = settings.train.buffer.capacity + 1;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.train.hider.epsilon_min = 0.5;
        settings.train.hider.epsilon = 0.1;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.train.env.reward.clip_min = 1.0;
        settings.train.env.reward.clip_max = 1.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.train.train_every = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.train.action_space = ActionSpace::Flat { actions: 0 };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = Settings::from_file(Path::new("/nonexistent/hideseek.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
