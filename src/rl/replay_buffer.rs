//! Fixed-capacity experience replay with uniform and reward-weighted sampling

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::action_space::ActionValue;

/// Keeps zero-reward transitions samplable in prioritized mode
const PRIORITY_EPSILON: f32 = 1e-3;

/// One recorded experience
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: Vec<f32>,
    pub action: ActionValue,
    pub reward: f32,
    pub next_state: Vec<f32>,
    pub done: bool,
    pub agent_id: String,
}

/// Configuration for a replay buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Maximum number of stored transitions
    pub capacity: usize,
    /// Expected state vector length; `None` accepts any consistent length
    pub state_size: Option<usize>,
    /// Fixed RNG seed for reproducible sampling
    pub seed: Option<u64>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 50_000,
            state_size: None,
            seed: None,
        }
    }
}

/// Summary of the current buffer contents
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BufferStats {
    pub size: usize,
    pub capacity: usize,
    /// Percentage of the capacity in use
    pub utilization: f32,
    pub avg_reward: f32,
    pub min_reward: f32,
    pub max_reward: f32,
    /// Fraction of transitions with a positive reward
    pub success_rate: f32,
}

/// Circular transition store, one per role
#[derive(Debug)]
pub struct ReplayBuffer {
    entries: Vec<Transition>,
    capacity: usize,
    state_size: Option<usize>,
    cursor: usize,
    total_inserted: u64,
    total_sampled: u64,
    rng: StdRng,
}

impl ReplayBuffer {
    pub fn new(config: &BufferConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let capacity = config.capacity.max(1);

        Self {
            entries: Vec::with_capacity(capacity.min(4096)),
            capacity,
            state_size: config.state_size,
            cursor: 0,
            total_inserted: 0,
            total_sampled: 0,
            rng,
        }
    }

    /// Structural validity check applied on insertion
    pub fn is_valid(&self, transition: &Transition) -> bool {
        let len = transition.state.len();
        if len == 0 || transition.next_state.len() != len {
            return false;
        }
        if self.state_size.is_some_and(|expected| expected != len) {
            return false;
        }
        transition.reward.is_finite()
            && transition.state.iter().all(|v| v.is_finite())
            && transition.next_state.iter().all(|v| v.is_finite())
    }

    /// Insert a transition, overwriting the oldest entry once full.
    /// Returns false (and stores nothing) when the transition is malformed.
    pub fn add(&mut self, transition: Transition) -> bool {
        if !self.is_valid(&transition) {
            tracing::trace!(agent = %transition.agent_id, "rejected malformed transition");
            return false;
        }

        if self.entries.len() < self.capacity {
            self.entries.push(transition);
        } else {
            self.entries[self.cursor] = transition;
        }
        self.cursor = (self.cursor + 1) % self.capacity;
        self.total_inserted += 1;
        true
    }

    pub fn can_sample(&self, batch_size: usize) -> bool {
        self.entries.len() >= batch_size
    }

    /// Uniform sample without replacement; short buffers return everything
    pub fn sample(&mut self, batch_size: usize) -> Vec<Transition> {
        let batch: Vec<Transition> = if self.entries.len() < batch_size {
            self.entries.clone()
        } else {
            index::sample(&mut self.rng, self.entries.len(), batch_size)
                .into_iter()
                .map(|i| self.entries[i].clone())
                .collect()
        };
        self.total_sampled += batch.len() as u64;
        batch
    }

    /// Reward-magnitude weighted sample with replacement
    pub fn sample_prioritized(&mut self, batch_size: usize, alpha: f32) -> Vec<Transition> {
        if self.entries.len() < batch_size {
            return self.sample(batch_size);
        }

        let mut cumulative = Vec::with_capacity(self.entries.len());
        let mut total = 0.0f64;
        for transition in &self.entries {
            let priority = (transition.reward.abs() + PRIORITY_EPSILON).powf(alpha) as f64;
            total += if priority.is_finite() { priority } else { 0.0 };
            cumulative.push(total);
        }

        if !(total > 0.0) {
            return self.sample(batch_size);
        }

        let batch: Vec<Transition> = (0..batch_size)
            .map(|_| {
                let target = self.rng.random::<f64>() * total;
                let i = cumulative
                    .partition_point(|&c| c <= target)
                    .min(self.entries.len() - 1);
                self.entries[i].clone()
            })
            .collect();
        self.total_sampled += batch.len() as u64;
        batch
    }

    pub fn stats(&self) -> BufferStats {
        let size = self.entries.len();
        if size == 0 {
            return BufferStats {
                capacity: self.capacity,
                ..BufferStats::default()
            };
        }

        let mut sum = 0.0f32;
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut positive = 0usize;
        for transition in &self.entries {
            sum += transition.reward;
            min = min.min(transition.reward);
            max = max.max(transition.reward);
            if transition.reward > 0.0 {
                positive += 1;
            }
        }

        BufferStats {
            size,
            capacity: self.capacity,
            utilization: size as f32 / self.capacity as f32 * 100.0,
            avg_reward: sum / size as f32,
            min_reward: min,
            max_reward: max,
            success_rate: positive as f32 / size as f32,
        }
    }

    /// Contents ordered from oldest to newest
    pub fn export(&self) -> Vec<Transition> {
        if self.entries.len() < self.capacity {
            return self.entries.clone();
        }
        let (newest, oldest) = self.entries.split_at(self.cursor);
        oldest.iter().chain(newest.iter()).cloned().collect()
    }

    /// Add every valid transition from `transitions`, returning how many were accepted
    pub fn import(&mut self, transitions: Vec<Transition>) -> usize {
        transitions
            .into_iter()
            .map(|t| self.add(t))
            .filter(|accepted| *accepted)
            .count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_inserted(&self) -> u64 {
        self.total_inserted
    }

    pub fn total_sampled(&self) -> u64 {
        self.total_sampled
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn transition(id: usize, reward: f32) -> Transition {
        Transition {
            state: vec![id as f32, 0.0, 1.0],
            action: ActionValue::Flat(id % 3),
            reward,
            next_state: vec![id as f32 + 1.0, 0.0, 1.0],
            done: false,
            agent_id: id.to_string(),
        }
    }

    fn buffer(capacity: usize) -> ReplayBuffer {
        ReplayBuffer::new(&BufferConfig {
            capacity,
            state_size: Some(3),
            seed: Some(42),
        })
    }

    #[test]
    fn test_circular_overwrite_keeps_latest() {
        let mut buf = buffer(4);
        for id in 1..=6 {
            assert!(buf.add(transition(id, 0.0)));
        }

        assert_eq!(buf.len(), 4);
        let ids: Vec<String> = buf.export().into_iter().map(|t| t.agent_id).collect();
        assert_eq!(ids, vec!["3", "4", "5", "6"]);
        assert_eq!(buf.total_inserted(), 6);
    }

    #[test]
    fn test_length_never_exceeds_capacity() {
        let mut buf = buffer(7);
        for id in 0..50 {
            buf.add(transition(id, id as f32));
            assert!(buf.len() <= 7);
        }
        let ids: Vec<String> = buf.export().into_iter().map(|t| t.agent_id).collect();
        let expected: Vec<String> = (43..50).map(|i| i.to_string()).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_rejects_malformed() {
        let mut buf = buffer(4);

        let mut short = transition(1, 0.0);
        short.next_state.pop();
        assert!(!buf.add(short));

        let mut nan = transition(2, 0.0);
        nan.state[1] = f32::NAN;
        assert!(!buf.add(nan));

        let mut wrong_size = transition(3, 0.0);
        wrong_size.state.push(0.0);
        wrong_size.next_state.push(0.0);
        assert!(!buf.add(wrong_size));

        assert!(!buf.add(transition(4, f32::INFINITY)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_sample_distinct() {
        let mut buf = buffer(64);
        for id in 0..64 {
            buf.add(transition(id, 0.0));
        }
        for _ in 0..20 {
            let batch = buf.sample(32);
            assert_eq!(batch.len(), 32);
            let unique: HashSet<String> = batch.into_iter().map(|t| t.agent_id).collect();
            assert_eq!(unique.len(), 32);
        }
        assert_eq!(buf.total_sampled(), 20 * 32);
    }

    #[test]
    fn test_sample_short_buffer_returns_everything() {
        let mut buf = buffer(16);
        for id in 0..5 {
            buf.add(transition(id, 0.0));
        }
        assert!(!buf.can_sample(8));
        let batch = buf.sample(8);
        assert_eq!(batch.len(), 5);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_prioritized_prefers_large_rewards() {
        let mut buf = buffer(100);
        for id in 0..99 {
            buf.add(transition(id, 0.0));
        }
        buf.add(transition(99, 50.0));

        let batch = buf.sample_prioritized(50, 1.0);
        assert_eq!(batch.len(), 50);
        let unique: HashSet<&str> = batch.iter().map(|t| t.agent_id.as_str()).collect();
        assert!(unique.len() < batch.len());
        let hits = batch.iter().filter(|t| t.agent_id == "99").count();
        assert!(hits > 40, "high reward transition drawn {} times", hits);
        assert_eq!(buf.total_sampled(), 50);
    }

    #[test]
    fn test_prioritized_falls_back_when_short() {
        let mut buf = buffer(10);
        buf.add(transition(1, 1.0));
        assert_eq!(buf.sample_prioritized(4, 0.6).len(), 1);
    }

    #[test]
    fn test_stats() {
        let mut buf = buffer(10);
        let empty = buf.stats();
        assert_eq!(empty.size, 0);
        assert_eq!(empty.capacity, 10);
        assert_eq!(empty.avg_reward, 0.0);

        buf.add(transition(1, -1.0));
        buf.add(transition(2, 3.0));
        let stats = buf.stats();
        assert_eq!(stats.size, 2);
        assert!((stats.utilization - 20.0).abs() < 1e-4);
        assert!((stats.avg_reward - 1.0).abs() < 1e-6);
        assert_eq!(stats.min_reward, -1.0);
        assert_eq!(stats.max_reward, 3.0);
        assert!((stats.success_rate - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_export_import() {
        let mut buf = buffer(4);
        for id in 0..3 {
            buf.add(transition(id, 0.0));
        }
        let mut exported = buf.export();
        exported.push(Transition {
            state: vec![],
            ..transition(9, 0.0)
        });

        let mut other = buffer(4);
        assert_eq!(other.import(exported), 3);
        assert_eq!(other.len(), 3);

        other.clear();
        assert!(other.is_empty());
    }
}
