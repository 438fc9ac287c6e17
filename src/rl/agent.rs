//! Per-role learning agent: epsilon-greedy action selection and Double-DQN training steps

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::action_space::{ActionSpace, ActionValue, MOVEMENT_ACTIONS, MultiHeadAction};
use super::history::StateHistories;
use super::metrics::MovingAverage;
use super::policy::{ModelError, Net, QFunction};
use super::replay_buffer::{ReplayBuffer, Transition};
use crate::infra::Role;

/// Tunables of one role's learner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub epsilon: f32,
    /// Multiplicative decay applied once per episode
    pub epsilon_decay: f32,
    pub epsilon_min: f32,
    pub gamma: f32,
    pub learning_rate: f64,
    pub reward_clip_min: f32,
    pub reward_clip_max: f32,
    pub batch_size: usize,
    /// Sample by reward magnitude instead of uniformly
    pub prioritized: bool,
    pub priority_alpha: f32,
    /// Residual exploration probability kept once epsilon bottoms out
    pub exploration_bonus: f32,
    pub exploration_bonus_decay: f32,
    pub exploration_bonus_min: f32,
    /// Training steps before the exploration bonus starts decaying
    pub bonus_warmup_steps: u64,
    /// Chance that a flat exploratory action is drawn from the least used ones
    pub least_used_probability: f32,
    /// Usage counts within this many of the minimum count are "least used"
    pub least_used_tolerance: u64,
    /// Flat actions favoured while exploring
    pub preferred_actions: Vec<usize>,
    pub preferred_probability: f32,
    /// Maximum identical consecutive exploratory actions
    pub repeat_limit: usize,
    pub recent_window: usize,
    /// Half-width of the uniform noise added to greedy outputs
    pub exploit_noise: f32,
    /// Training steps between diagnostic log lines
    pub log_every: u64,
    pub seed: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            epsilon: 1.0,
            epsilon_decay: 0.995,
            epsilon_min: 0.05,
            gamma: 0.99,
            learning_rate: 5e-4,
            reward_clip_min: -10.0,
            reward_clip_max: 10.0,
            batch_size: 64,
            prioritized: false,
            priority_alpha: 0.6,
            exploration_bonus: 0.1,
            exploration_bonus_decay: 0.999,
            exploration_bonus_min: 0.02,
            bonus_warmup_steps: 500,
            least_used_probability: 0.3,
            least_used_tolerance: 2,
            preferred_actions: Vec::new(),
            preferred_probability: 0.0,
            repeat_limit: 3,
            recent_window: 10,
            exploit_noise: 1e-3,
            log_every: 100,
            seed: None,
        }
    }
}

impl AgentConfig {
    /// Seekers explore longer and favour movement while exploring
    pub fn seeker() -> Self {
        Self {
            epsilon_decay: 0.998,
            learning_rate: 5e-4,
            preferred_actions: MOVEMENT_ACTIONS.to_vec(),
            preferred_probability: 0.4,
            ..Self::default()
        }
    }

    pub fn hider() -> Self {
        Self {
            epsilon_decay: 0.995,
            learning_rate: 3e-4,
            exploration_bonus: 0.05,
            ..Self::default()
        }
    }
}

/// Training diagnostics of one agent
#[derive(Debug, Clone)]
pub struct AgentStats {
    pub train_steps: u64,
    pub samples_drawn: u64,
    pub samples_used: u64,
    pub last_loss: Option<f32>,
    pub loss: MovingAverage,
}

impl Default for AgentStats {
    fn default() -> Self {
        Self {
            train_steps: 0,
            samples_drawn: 0,
            samples_used: 0,
            last_loss: None,
            loss: MovingAverage::new(100),
        }
    }
}

impl AgentStats {
    /// Fraction of sampled transitions that survived label filtering
    pub fn sample_yield(&self) -> f32 {
        if self.samples_drawn == 0 {
            0.0
        } else {
            self.samples_used as f32 / self.samples_drawn as f32
        }
    }
}

struct Exploration {
    epsilon: f32,
    bonus: f32,
    rng: StdRng,
    usage: Vec<u64>,
    recent: VecDeque<usize>,
}

/// Clears the reentrancy flag when the training step ends, however it ends
struct TrainingGuard<'a>(&'a AtomicBool);

impl Drop for TrainingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LearningAgent<Q> {
    role: Role,
    config: AgentConfig,
    space: ActionSpace,
    model: Arc<Mutex<Option<Q>>>,
    exploration: Mutex<Exploration>,
    training: AtomicBool,
    stats: Mutex<AgentStats>,
}

impl<Q: QFunction> LearningAgent<Q> {
    pub fn new(role: Role, config: AgentConfig, space: ActionSpace, model: Q) -> Self {
        let agent = Self::without_model(role, config, space);
        agent.attach_model(model);
        agent
    }

    /// Agent that explores only until a model is attached
    pub fn without_model(role: Role, config: AgentConfig, space: ActionSpace) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let exploration = Exploration {
            epsilon: config.epsilon,
            bonus: config.exploration_bonus,
            rng,
            usage: vec![0; space.num_keys()],
            recent: VecDeque::with_capacity(config.recent_window),
        };

        Self {
            role,
            config,
            space,
            model: Arc::new(Mutex::new(None)),
            exploration: Mutex::new(exploration),
            training: AtomicBool::new(false),
            stats: Mutex::new(AgentStats::default()),
        }
    }

    pub fn attach_model(&self, model: Q) {
        *lock(&self.model) = Some(model);
    }

    pub fn has_model(&self) -> bool {
        lock(&self.model).is_some()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn action_space(&self) -> ActionSpace {
        self.space
    }

    pub fn epsilon(&self) -> f32 {
        lock(&self.exploration).epsilon
    }

    pub fn set_epsilon(&self, epsilon: f32) {
        lock(&self.exploration).epsilon = epsilon.clamp(0.0, 1.0);
    }

    pub fn exploration_bonus(&self) -> f32 {
        lock(&self.exploration).bonus
    }

    pub fn usage(&self) -> Vec<u64> {
        lock(&self.exploration).usage.clone()
    }

    pub fn stats(&self) -> AgentStats {
        lock(&self.stats).clone()
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Acquire)
    }

    /// Epsilon-greedy choice over the flattened state window
    pub fn select_action(&self, sequence: &[f32]) -> ActionValue {
        let mut exploration = lock(&self.exploration);
        let explore_probability = exploration
            .epsilon
            .max(exploration.bonus * (1.0 - exploration.epsilon));

        let action = if exploration.rng.random::<f32>() < explore_probability {
            self.explore(&mut exploration)
        } else {
            let noise = self.config.exploit_noise;
            match self.exploit(sequence, noise, &mut exploration.rng) {
                Some(action) => action,
                None => self.explore(&mut exploration),
            }
        };

        let key = action.key();
        if let Some(count) = exploration.usage.get_mut(key) {
            *count += 1;
        }
        exploration.recent.push_back(key);
        while exploration.recent.len() > self.config.recent_window.max(1) {
            exploration.recent.pop_front();
        }
        action
    }

    /// Noise-free greedy action; idle when no model is usable
    pub fn select_greedy(&self, sequence: &[f32]) -> ActionValue {
        let mut exploration = lock(&self.exploration);
        self.exploit(sequence, 0.0, &mut exploration.rng)
            .unwrap_or_else(|| self.idle_action())
    }

    fn idle_action(&self) -> ActionValue {
        match self.space {
            ActionSpace::Flat { .. } => ActionValue::Flat(0),
            ActionSpace::MultiHead => ActionValue::MultiHead(MultiHeadAction::default()),
        }
    }

    fn exploit(&self, sequence: &[f32], noise: f32, rng: &mut StdRng) -> Option<ActionValue> {
        let mut values = match self.q_values(Net::Online, sequence)? {
            Ok(values) => values,
            Err(e) => {
                tracing::warn!(role = %self.role, "Inference failed: {}", e);
                return None;
            }
        };
        if values.len() != self.space.output_size() {
            tracing::warn!(
                role = %self.role,
                "Model output has {} values, action space needs {}",
                values.len(),
                self.space.output_size()
            );
            return None;
        }
        if noise > 0.0 {
            for v in values.iter_mut() {
                *v += rng.random_range(-noise..=noise);
            }
        }
        Some(self.space.greedy(&values))
    }

    fn explore(&self, exploration: &mut Exploration) -> ActionValue {
        let actions = match self.space {
            ActionSpace::Flat { actions } => actions,
            ActionSpace::MultiHead => return self.space.random(&mut exploration.rng),
        };

        let mut candidates: Vec<usize> =
            if exploration.rng.random::<f32>() < self.config.least_used_probability {
                let min = exploration.usage.iter().copied().min().unwrap_or(0);
                (0..actions)
                    .filter(|&a| exploration.usage[a] <= min + self.config.least_used_tolerance)
                    .collect()
            } else if !self.config.preferred_actions.is_empty()
                && exploration.rng.random::<f32>() < self.config.preferred_probability
            {
                self.config
                    .preferred_actions
                    .iter()
                    .copied()
                    .filter(|&a| a < actions)
                    .collect()
            } else {
                (0..actions).collect()
            };
        if candidates.is_empty() {
            candidates = (0..actions).collect();
        }

        // Drop an action that already ran `repeat_limit` times in a row
        let limit = self.config.repeat_limit;
        if limit > 0 && exploration.recent.len() >= limit {
            let mut tail = exploration.recent.iter().rev().take(limit);
            if let Some(&last) = tail.next() {
                if tail.all(|&a| a == last) && candidates.len() > 1 {
                    candidates.retain(|&a| a != last);
                }
            }
        }

        let pick = candidates[exploration.rng.random_range(0..candidates.len())];
        ActionValue::Flat(pick)
    }

    /// Per-episode epsilon decay; the exploration bonus decays once warm-up is over
    pub fn decay_epsilon(&self) {
        let train_steps = lock(&self.stats).train_steps;
        let mut exploration = lock(&self.exploration);
        exploration.epsilon =
            (exploration.epsilon * self.config.epsilon_decay).max(self.config.epsilon_min);
        if train_steps >= self.config.bonus_warmup_steps {
            exploration.bonus = (exploration.bonus * self.config.exploration_bonus_decay)
                .max(self.config.exploration_bonus_min);
        }
    }

    /// Raw approximator output; `None` when no model is attached
    pub fn q_values(&self, net: Net, sequence: &[f32]) -> Option<Result<Vec<f32>, ModelError>> {
        lock(&self.model).as_ref().map(|q| q.predict(net, sequence))
    }

    /// One Double-DQN gradient step on a batch from `buffer`.
    ///
    /// Returns `None` when the batch is short, another step is in flight, no sample
    /// survives filtering, or the approximator fails.
    pub async fn train(
        &self,
        buffer: &Mutex<ReplayBuffer>,
        histories: &StateHistories,
    ) -> Option<f32> {
        if self
            .training
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!(role = %self.role, "training already in flight");
            return None;
        }
        let _guard = TrainingGuard(&self.training);

        let batch_size = self.config.batch_size;
        let batch = {
            let mut buffer = lock(buffer);
            if !buffer.can_sample(batch_size) {
                return None;
            }
            if self.config.prioritized {
                buffer.sample_prioritized(batch_size, self.config.priority_alpha)
            } else {
                buffer.sample(batch_size)
            }
        };
        let drawn = batch.len();

        let samples: Vec<Sample> = batch
            .into_iter()
            .filter_map(|transition| {
                let history = histories.get(&transition.agent_id)?;
                Some(Sample {
                    current: history.flattened(),
                    next: history.flattened_with(&transition.next_state),
                    transition,
                })
            })
            .collect();
        if samples.is_empty() {
            tracing::debug!(role = %self.role, "no state history for any sampled agent");
            return None;
        }

        let model = self.model.clone();
        let targets = TargetParams {
            space: self.space,
            gamma: self.config.gamma,
            clip_min: self.config.reward_clip_min,
            clip_max: self.config.reward_clip_max,
        };
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = lock(&model);
            let q = guard.as_mut().ok_or(ModelError::Missing)?;
            fit_double_dqn(q, &samples, &targets)
        })
        .await;

        let (loss, used) = match result {
            Ok(Ok(Some(outcome))) => outcome,
            Ok(Ok(None)) => {
                tracing::debug!(role = %self.role, "every sample filtered out");
                lock(&self.stats).samples_drawn += drawn as u64;
                return None;
            }
            Ok(Err(e)) => {
                tracing::warn!(role = %self.role, "Training step failed: {}", e);
                lock(&self.stats).samples_drawn += drawn as u64;
                return None;
            }
            Err(e) => {
                tracing::error!(role = %self.role, "Training task panicked: {}", e);
                return None;
            }
        };

        let mut stats = lock(&self.stats);
        stats.train_steps += 1;
        stats.samples_drawn += drawn as u64;
        stats.samples_used += used as u64;
        stats.last_loss = Some(loss);
        stats.loss.push(loss);
        if self.config.log_every > 0 && stats.train_steps % self.config.log_every == 0 {
            tracing::info!(
                role = %self.role,
                "train step {} | loss={:.4} (avg {:.4}) | epsilon={:.3} | yield={:.2}",
                stats.train_steps,
                loss,
                stats.loss.average(),
                self.epsilon(),
                stats.sample_yield()
            );
        }
        Some(loss)
    }

    /// Hard copy of the online parameters into the target approximator
    pub fn update_target_model(&self) {
        match lock(&self.model).as_mut() {
            Some(q) => {
                q.sync_target();
                tracing::debug!(role = %self.role, "Target model synced");
            }
            None => tracing::warn!(role = %self.role, "No online model to sync from"),
        }
    }

    pub fn save_model(&self, path: &Path) -> Result<(), ModelError> {
        lock(&self.model)
            .as_ref()
            .ok_or(ModelError::Missing)?
            .save(path)
    }

    pub fn load_model(&self, path: &Path) -> Result<(), ModelError> {
        lock(&self.model)
            .as_mut()
            .ok_or(ModelError::Missing)?
            .load(path)
    }
}

struct Sample {
    transition: Transition,
    current: Vec<f32>,
    next: Vec<f32>,
}

struct TargetParams {
    space: ActionSpace,
    gamma: f32,
    clip_min: f32,
    clip_max: f32,
}

fn all_finite(values: &[f32]) -> bool {
    values.iter().all(|v| v.is_finite())
}

/// Builds Double-DQN labels and runs one fit; `Ok(None)` when nothing survives filtering
fn fit_double_dqn<Q: QFunction>(
    q: &mut Q,
    samples: &[Sample],
    params: &TargetParams,
) -> Result<Option<(f32, usize)>, ModelError> {
    let current_inputs: Vec<Vec<f32>> = samples.iter().map(|s| s.current.clone()).collect();
    let next_inputs: Vec<Vec<f32>> = samples.iter().map(|s| s.next.clone()).collect();

    let current_q = q.predict_batch(Net::Online, &current_inputs)?;
    let next_online = q.predict_batch(Net::Online, &next_inputs)?;
    let next_target = q.predict_batch(Net::Target, &next_inputs)?;

    let mut inputs = Vec::with_capacity(samples.len());
    let mut labels = Vec::with_capacity(samples.len());
    for (i, sample) in samples.iter().enumerate() {
        let current = &current_q[i];
        if !all_finite(current) {
            continue;
        }
        let Some(taken) = params.space.output_indices(&sample.transition.action) else {
            continue;
        };

        let reward = sample
            .transition
            .reward
            .clamp(params.clip_min, params.clip_max);

        let head_targets: Vec<f32> = if sample.transition.done {
            vec![reward; taken.len()]
        } else {
            // Select with the online network, evaluate with the target network
            let chosen = params.space.best_indices(&next_online[i]);
            let values: Vec<f32> = chosen
                .iter()
                .map(|&idx| next_target[i].get(idx).copied().unwrap_or(f32::NAN))
                .collect();
            if all_finite(&next_online[i]) && all_finite(&values) {
                values.iter().map(|v| reward + params.gamma * v).collect()
            } else {
                vec![reward; taken.len()]
            }
        };

        let mut label = current.clone();
        for (&idx, &target) in taken.iter().zip(head_targets.iter()) {
            if let Some(slot) = label.get_mut(idx) {
                *slot = target;
            }
        }
        if !all_finite(&label) {
            continue;
        }

        inputs.push(current_inputs[i].clone());
        labels.push(label);
    }

    if labels.is_empty() {
        return Ok(None);
    }
    let loss = q.fit(&inputs, &labels)?;
    if !loss.is_finite() {
        return Err(ModelError::Tensor(format!("non-finite loss {}", loss)));
    }
    Ok(Some((loss, labels.len())))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::rl::replay_buffer::BufferConfig;
    use crate::rl::testing::StubQ;

    const STATE: usize = 2;
    const WINDOW: usize = 2;

    fn config() -> AgentConfig {
        AgentConfig {
            batch_size: 2,
            exploit_noise: 0.0,
            seed: Some(11),
            ..AgentConfig::default()
        }
    }

    fn greedy_config() -> AgentConfig {
        AgentConfig {
            epsilon: 0.0,
            exploration_bonus: 0.0,
            ..config()
        }
    }

    fn transition(agent: &str, action: ActionValue, reward: f32, done: bool) -> Transition {
        Transition {
            state: vec![0.1, 0.2],
            action,
            reward,
            next_state: vec![0.3, 0.4],
            done,
            agent_id: agent.to_string(),
        }
    }

    fn buffer_with(transitions: Vec<Transition>) -> Mutex<ReplayBuffer> {
        let mut buffer = ReplayBuffer::new(&BufferConfig {
            capacity: 16,
            state_size: Some(STATE),
            seed: Some(3),
        });
        for t in transitions {
            assert!(buffer.add(t));
        }
        Mutex::new(buffer)
    }

    fn histories() -> StateHistories {
        let mut histories = StateHistories::new(WINDOW, STATE);
        histories.reset(["seeker_0"]);
        histories.push("seeker_0", vec![1.0, 1.0]);
        histories
    }

    #[test]
    fn test_multi_head_exploration_within_cardinalities() {
        let agent: LearningAgent<StubQ> =
            LearningAgent::without_model(Role::Seeker, config(), ActionSpace::MultiHead);
        assert_eq!(agent.epsilon(), 1.0);
        for _ in 0..500 {
            match agent.select_action(&[0.0; STATE * WINDOW]) {
                ActionValue::MultiHead(action) => {
                    assert!(action.is_valid(), "{:?}", action);
                }
                other => panic!("unexpected action {:?}", other),
            }
        }
        assert_eq!(agent.usage().iter().sum::<u64>(), 500);
    }

    #[test]
    fn test_flat_exploration_avoids_repeats() {
        let agent: LearningAgent<StubQ> = LearningAgent::without_model(
            Role::Hider,
            AgentConfig {
                least_used_probability: 0.0,
                repeat_limit: 1,
                ..config()
            },
            ActionSpace::Flat { actions: 2 },
        );
        let mut last = None;
        for _ in 0..50 {
            let action = agent.select_action(&[]);
            assert_ne!(Some(action), last);
            last = Some(action);
        }
    }

    #[test]
    fn test_exploit_takes_argmax() {
        let q = StubQ::new(STATE * WINDOW, vec![0.0, 0.5, 3.0, -1.0]);
        let agent = LearningAgent::new(
            Role::Seeker,
            greedy_config(),
            ActionSpace::Flat { actions: 4 },
            q,
        );
        for _ in 0..10 {
            assert_eq!(agent.select_action(&[0.0; 4]), ActionValue::Flat(2));
        }
        // wrong input width falls back to exploration rather than panicking
        let _ = agent.select_action(&[0.0; 3]);
    }

    #[test]
    fn test_greedy_without_model_is_idle() {
        let agent: LearningAgent<StubQ> =
            LearningAgent::without_model(Role::Hider, config(), ActionSpace::MultiHead);
        assert_eq!(
            agent.select_greedy(&[0.0; 4]),
            ActionValue::MultiHead(MultiHeadAction::default())
        );
    }

    #[test]
    fn test_decay_epsilon_floors() {
        let agent: LearningAgent<StubQ> = LearningAgent::without_model(
            Role::Seeker,
            AgentConfig {
                epsilon_decay: 0.5,
                epsilon_min: 0.1,
                bonus_warmup_steps: 0,
                exploration_bonus: 0.1,
                exploration_bonus_decay: 0.5,
                exploration_bonus_min: 0.02,
                ..config()
            },
            ActionSpace::MultiHead,
        );
        for _ in 0..20 {
            agent.decay_epsilon();
        }
        assert!((agent.epsilon() - 0.1).abs() < 1e-6);
        assert!((agent.exploration_bonus() - 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_seeker_decays_slower_than_hider() {
        assert!(AgentConfig::seeker().epsilon_decay > AgentConfig::hider().epsilon_decay);
    }

    #[tokio::test]
    async fn test_train_requires_full_batch() {
        let q = StubQ::new(STATE * WINDOW, vec![0.0, 0.0, 0.0]);
        let agent = LearningAgent::new(Role::Seeker, config(), ActionSpace::Flat { actions: 3 }, q);
        let buffer = buffer_with(vec![transition("seeker_0", ActionValue::Flat(0), 1.0, false)]);
        assert_eq!(agent.train(&buffer, &histories()).await, None);
        assert!(!agent.is_training());
    }

    #[tokio::test]
    async fn test_train_builds_double_dqn_labels() {
        let q = StubQ::new(STATE * WINDOW, vec![1.0, 2.0, 3.0]).with_target(vec![10.0, 0.0, 5.0]);
        let log = q.log.clone();
        let agent = LearningAgent::new(
            Role::Seeker,
            AgentConfig {
                gamma: 0.5,
                ..config()
            },
            ActionSpace::Flat { actions: 3 },
            q,
        );
        let buffer = buffer_with(vec![
            transition("seeker_0", ActionValue::Flat(0), 1.0, false),
            transition("seeker_0", ActionValue::Flat(1), 100.0, true),
        ]);

        let loss = agent.train(&buffer, &histories()).await;
        assert!(loss.is_some());

        let log = log.lock().unwrap();
        assert_eq!(log.calls, 1);
        assert_eq!(log.inputs[0], vec![0.0, 0.0, 1.0, 1.0]);
        // online picks index 2 for the next state, target values it at 5.0
        assert!(log.labels.contains(&vec![3.5, 2.0, 3.0]));
        // terminal sample: reward clipped to 10, no bootstrap
        assert!(log.labels.contains(&vec![1.0, 10.0, 3.0]));

        let stats = agent.stats();
        assert_eq!(stats.train_steps, 1);
        assert!((stats.sample_yield() - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_multi_head_labels_overwrite_every_head() {
        let online: Vec<f32> = (0..14).map(|i| i as f32 * 0.1).collect();
        let q = StubQ::new(STATE * WINDOW, online.clone());
        let log = q.log.clone();
        let agent = LearningAgent::new(
            Role::Seeker,
            AgentConfig {
                gamma: 0.0,
                ..config()
            },
            ActionSpace::MultiHead,
            q,
        );
        let action = ActionValue::MultiHead(MultiHeadAction::from_heads([1, 0, 2, 0, 1]));
        let buffer = buffer_with(vec![
            transition("seeker_0", action, 0.5, false),
            transition("seeker_0", action, 0.5, false),
        ]);
        agent.train(&buffer, &histories()).await.unwrap();

        let log = log.lock().unwrap();
        let label = &log.labels[0];
        for idx in [1, 3, 7, 8, 12] {
            assert!((label[idx] - 0.5).abs() < 1e-6, "head slot {}", idx);
        }
        assert!((label[0] - online[0]).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_non_finite_current_values_are_skipped() {
        let q = StubQ::new(STATE * WINDOW, vec![f32::NAN, 0.0, 0.0]);
        let log = q.log.clone();
        let agent = LearningAgent::new(Role::Hider, config(), ActionSpace::Flat { actions: 3 }, q);
        let buffer = buffer_with(vec![
            transition("seeker_0", ActionValue::Flat(0), 1.0, false),
            transition("seeker_0", ActionValue::Flat(1), 1.0, false),
        ]);
        assert_eq!(agent.train(&buffer, &histories()).await, None);
        assert_eq!(log.lock().unwrap().calls, 0);
    }

    #[tokio::test]
    async fn test_missing_history_skips_samples() {
        let q = StubQ::new(STATE * WINDOW, vec![0.0, 0.0, 0.0]);
        let agent = LearningAgent::new(Role::Hider, config(), ActionSpace::Flat { actions: 3 }, q);
        let buffer = buffer_with(vec![
            transition("hider_9", ActionValue::Flat(0), 1.0, false),
            transition("hider_9", ActionValue::Flat(1), 1.0, false),
        ]);
        assert_eq!(agent.train(&buffer, &histories()).await, None);
    }

    #[tokio::test]
    async fn test_failed_fit_counts_drawn_samples() {
        let q = StubQ::new(STATE * WINDOW, vec![0.0, 0.0, 0.0]).with_failing_fit();
        let log = q.log.clone();
        let agent = LearningAgent::new(Role::Seeker, config(), ActionSpace::Flat { actions: 3 }, q);
        let buffer = buffer_with(vec![
            transition("seeker_0", ActionValue::Flat(0), 1.0, false),
            transition("seeker_0", ActionValue::Flat(1), -1.0, false),
        ]);

        assert_eq!(agent.train(&buffer, &histories()).await, None);
        assert_eq!(log.lock().unwrap().calls, 1);
        assert!(!agent.is_training());

        let stats = agent.stats();
        assert_eq!(stats.train_steps, 0);
        assert_eq!(stats.samples_drawn, 2);
        assert_eq!(stats.samples_used, 0);
    }

    #[tokio::test]
    async fn test_concurrent_train_is_rejected() {
        let q = StubQ::new(STATE * WINDOW, vec![0.0, 0.0, 0.0])
            .with_fit_delay(Duration::from_millis(50));
        let agent = LearningAgent::new(Role::Seeker, config(), ActionSpace::Flat { actions: 3 }, q);
        let buffer = buffer_with(vec![
            transition("seeker_0", ActionValue::Flat(0), 1.0, false),
            transition("seeker_0", ActionValue::Flat(2), -1.0, false),
        ]);
        let histories = histories();

        let (first, second) = tokio::join!(
            agent.train(&buffer, &histories),
            agent.train(&buffer, &histories)
        );
        assert!(first.is_some());
        assert_eq!(second, None);

        // the flag is released afterwards
        assert!(agent.train(&buffer, &histories).await.is_some());
    }

    #[tokio::test]
    async fn test_target_lags_until_synced() {
        let q = StubQ::new(STATE * WINDOW, vec![0.0, 0.0, 0.0]);
        let agent = LearningAgent::new(Role::Seeker, config(), ActionSpace::Flat { actions: 3 }, q);
        let input = [0.0; STATE * WINDOW];
        let online = || agent.q_values(Net::Online, &input).unwrap().unwrap();
        let target = || agent.q_values(Net::Target, &input).unwrap().unwrap();

        agent.update_target_model();
        assert_eq!(online(), target());

        let buffer = buffer_with(vec![
            transition("seeker_0", ActionValue::Flat(0), 2.0, true),
            transition("seeker_0", ActionValue::Flat(0), 2.0, true),
        ]);
        agent.train(&buffer, &histories()).await.unwrap();
        assert_ne!(online(), target());

        agent.update_target_model();
        assert_eq!(online(), target());
    }

    #[test]
    fn test_sync_without_model_is_harmless() {
        let agent: LearningAgent<StubQ> =
            LearningAgent::without_model(Role::Seeker, config(), ActionSpace::MultiHead);
        agent.update_target_model();
        assert!(matches!(
            agent.save_model(Path::new("unused")),
            Err(ModelError::Missing)
        ));
    }
}
