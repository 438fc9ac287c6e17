//! Periodic checkpoints: per-role model parameters plus a JSON metrics document

use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description};

use super::agent::LearningAgent;
use super::metrics::MetricsHistory;
use super::policy::{ModelError, QFunction};
use crate::infra::{PerRole, Role};

const METRICS_FILE: &str = "metrics.json";

#[derive(Debug)]
pub enum CheckpointError {
    Io(std::io::Error),
    Model { role: Role, source: ModelError },
    Document(serde_json::Error),
    NotFound(PathBuf),
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CheckpointError::Io(e) => write!(formatter, "Checkpoint I/O error: {}", e),
            CheckpointError::Model { role, source } => {
                write!(formatter, "Checkpoint model error for {}: {}", role, source)
            }
            CheckpointError::Document(e) => write!(formatter, "Checkpoint document error: {}", e),
            CheckpointError::NotFound(path) => {
                write!(formatter, "No checkpoint at {}", path.display())
            }
        }
    }
}

impl Error for CheckpointError {}

impl From<std::io::Error> for CheckpointError {
    fn from(e: std::io::Error) -> Self {
        CheckpointError::Io(e)
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(e: serde_json::Error) -> Self {
        CheckpointError::Document(e)
    }
}

/// Metrics document stored next to the model files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointDocument {
    pub episode: usize,
    pub saved_at: String,
    pub epsilon: PerRole<f32>,
    pub history: MetricsHistory,
}

pub struct CheckpointManager {
    root: PathBuf,
}

impl CheckpointManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn episode_dir(&self, episode: usize) -> PathBuf {
        self.root.join(format!("episode_{:06}", episode))
    }

    /// Write both models and the metrics document into `dir`
    pub fn save_to<Q: QFunction>(
        &self,
        dir: &Path,
        episode: usize,
        agents: &PerRole<Arc<LearningAgent<Q>>>,
        history: &MetricsHistory,
    ) -> Result<(), CheckpointError> {
        fs::create_dir_all(dir)?;

        for (role, agent) in agents.iter() {
            agent
                .save_model(&dir.join(role.as_str()))
                .map_err(|source| CheckpointError::Model { role, source })?;
        }

        let document = CheckpointDocument {
            episode,
            saved_at: timestamp(),
            epsilon: PerRole::new(agents.seeker.epsilon(), agents.hider.epsilon()),
            history: history.clone(),
        };
        fs::write(dir.join(METRICS_FILE), serde_json::to_string_pretty(&document)?)?;

        tracing::info!("Saved checkpoint to {}", dir.display());
        Ok(())
    }

    pub fn save<Q: QFunction>(
        &self,
        episode: usize,
        agents: &PerRole<Arc<LearningAgent<Q>>>,
        history: &MetricsHistory,
    ) -> Result<PathBuf, CheckpointError> {
        let dir = self.episode_dir(episode);
        self.save_to(&dir, episode, agents, history)?;
        Ok(dir)
    }

    pub fn save_final<Q: QFunction>(
        &self,
        episode: usize,
        agents: &PerRole<Arc<LearningAgent<Q>>>,
        history: &MetricsHistory,
    ) -> Result<PathBuf, CheckpointError> {
        let dir = self.root.join("final");
        self.save_to(&dir, episode, agents, history)?;
        Ok(dir)
    }

    /// Most recent `episode_*` directory, if any
    pub fn latest(&self) -> Option<PathBuf> {
        let entries = fs::read_dir(&self.root).ok()?;
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let episode = name.strip_prefix("episode_")?.parse::<usize>().ok()?;
                Some((episode, entry.path()))
            })
            .max_by_key(|(episode, _)| *episode)
            .map(|(_, path)| path)
    }

    /// Restore both models and their exploration rates from `dir`
    pub fn load<Q: QFunction>(
        &self,
        dir: &Path,
        agents: &PerRole<Arc<LearningAgent<Q>>>,
    ) -> Result<CheckpointDocument, CheckpointError> {
        let document_path = dir.join(METRICS_FILE);
        if !document_path.exists() {
            return Err(CheckpointError::NotFound(dir.to_path_buf()));
        }
        let document: CheckpointDocument =
            serde_json::from_str(&fs::read_to_string(document_path)?)?;

        for (role, agent) in agents.iter() {
            agent
                .load_model(&dir.join(role.as_str()))
                .map_err(|source| CheckpointError::Model { role, source })?;
            agent.set_epsilon(*document.epsilon.get(role));
        }

        tracing::info!(
            "Loaded checkpoint from {} (episode {})",
            dir.display(),
            document.episode
        );
        Ok(document)
    }
}

fn timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
        .ok()
        .and_then(|format| now.format(&format).ok())
        .unwrap_or_default()
}
