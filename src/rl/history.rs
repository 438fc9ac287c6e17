//! Per-agent sliding windows of encoded states

use std::collections::{HashMap, VecDeque};

/// Fixed-length window of the most recent encoded states, oldest first
#[derive(Debug, Clone, PartialEq)]
pub struct StateHistory {
    window: VecDeque<Vec<f32>>,
    state_size: usize,
}

impl StateHistory {
    /// Window of `length` all-zero states
    pub fn new(length: usize, state_size: usize) -> Self {
        let length = length.max(1);
        Self {
            window: (0..length).map(|_| vec![0.0; state_size]).collect(),
            state_size,
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Drop the oldest state and append `state`
    pub fn push(&mut self, state: Vec<f32>) {
        if state.len() != self.state_size {
            tracing::warn!(
                expected = self.state_size,
                got = state.len(),
                "ignoring state with wrong size"
            );
            return;
        }
        self.window.pop_front();
        self.window.push_back(state);
    }

    pub fn reset(&mut self) {
        for state in self.window.iter_mut() {
            state.iter_mut().for_each(|v| *v = 0.0);
        }
    }

    /// Window concatenated into a single approximator input
    pub fn flattened(&self) -> Vec<f32> {
        self.window.iter().flatten().copied().collect()
    }

    /// Flattened window as it would look after pushing `next_state`
    pub fn flattened_with(&self, next_state: &[f32]) -> Vec<f32> {
        self.window
            .iter()
            .skip(1)
            .flatten()
            .chain(next_state.iter())
            .copied()
            .collect()
    }

    pub fn latest(&self) -> Option<&[f32]> {
        self.window.back().map(|s| s.as_slice())
    }
}

/// Rolling histories keyed by agent id
#[derive(Debug, Clone, Default)]
pub struct StateHistories {
    histories: HashMap<String, StateHistory>,
    length: usize,
    state_size: usize,
}

impl StateHistories {
    pub fn new(length: usize, state_size: usize) -> Self {
        Self {
            histories: HashMap::new(),
            length,
            state_size,
        }
    }

    /// Replace all histories with zeroed windows for `agent_ids`
    pub fn reset<'a>(&mut self, agent_ids: impl IntoIterator<Item = &'a str>) {
        self.histories.clear();
        for id in agent_ids {
            self.histories
                .insert(id.to_string(), StateHistory::new(self.length, self.state_size));
        }
    }

    pub fn push(&mut self, agent_id: &str, state: Vec<f32>) {
        self.histories
            .entry(agent_id.to_string())
            .or_insert_with(|| StateHistory::new(self.length, self.state_size))
            .push(state);
    }

    pub fn get(&self, agent_id: &str) -> Option<&StateHistory> {
        self.histories.get(agent_id)
    }

    /// Width of a flattened window
    pub fn input_size(&self) -> usize {
        self.length * self.state_size
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_slides() {
        let mut history = StateHistory::new(3, 2);
        assert_eq!(history.flattened(), vec![0.0; 6]);

        history.push(vec![1.0, 1.0]);
        history.push(vec![2.0, 2.0]);
        history.push(vec![3.0, 3.0]);
        history.push(vec![4.0, 4.0]);

        assert_eq!(history.len(), 3);
        assert_eq!(history.flattened(), vec![2.0, 2.0, 3.0, 3.0, 4.0, 4.0]);
        assert_eq!(
            history.flattened_with(&[5.0, 5.0]),
            vec![3.0, 3.0, 4.0, 4.0, 5.0, 5.0]
        );
        assert_eq!(history.latest(), Some(&[4.0, 4.0][..]));
    }

    #[test]
    fn test_wrong_size_is_ignored() {
        let mut history = StateHistory::new(2, 2);
        history.push(vec![1.0]);
        assert_eq!(history.flattened(), vec![0.0; 4]);
    }

    #[test]
    fn test_reset_zeroes() {
        let mut histories = StateHistories::new(2, 1);
        histories.reset(["seeker_0", "hider_0"]);
        histories.push("seeker_0", vec![3.0]);
        assert_eq!(histories.get("seeker_0").unwrap().flattened(), vec![0.0, 3.0]);

        histories.reset(["seeker_0"]);
        assert_eq!(histories.get("seeker_0").unwrap().flattened(), vec![0.0, 0.0]);
        assert!(histories.get("hider_0").is_none());
        assert_eq!(histories.input_size(), 2);
    }
}
