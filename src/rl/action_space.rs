//! Action space for the learning agents - flat discrete or multi-head categorical

use std::ops::Range;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Cardinalities of the multi-head sub-decisions: movement, jump, rotation, look, block
pub const HEAD_SIZES: [usize; 5] = [3, 2, 3, 3, 3];

/// Width of the shared output vector in multi-head mode
pub const MULTI_HEAD_OUTPUTS: usize = 14;

/// Number of distinct multi-head tuples (product of the head cardinalities)
pub const MULTI_HEAD_COMBINATIONS: usize = 162;

/// Number of actions in flat mode
pub const FLAT_ACTIONS: usize = 13;

/// Flat actions that only move or turn the agent
pub const MOVEMENT_ACTIONS: [usize; 7] = [1, 2, 3, 4, 5, 6, 8];

/// Low-level control format consumed by the movement executor and the trainer bridge
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementCommand {
    /// -1 backward .. 1 forward
    pub movement_forward: f32,
    /// -1 left .. 1 right
    pub movement_strafe: f32,
    /// -1 turn left .. 1 turn right
    pub rotation: f32,
    /// -1 look down .. 1 look up
    pub look: f32,
    pub jump: bool,
    pub place_block: bool,
    pub remove_block: bool,
}

/// One tuple of independent sub-choices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MultiHeadAction {
    /// 0 none, 1 forward, 2 backward
    pub movement: usize,
    /// 0 none, 1 jump
    pub jump: usize,
    /// 0 none, 1 left, 2 right
    pub rotation: usize,
    /// 0 none, 1 up, 2 down
    pub look: usize,
    /// 0 none, 1 place, 2 remove
    pub block: usize,
}

impl MultiHeadAction {
    pub fn from_heads(heads: [usize; 5]) -> Self {
        Self {
            movement: heads[0],
            jump: heads[1],
            rotation: heads[2],
            look: heads[3],
            block: heads[4],
        }
    }

    pub fn heads(&self) -> [usize; 5] {
        [self.movement, self.jump, self.rotation, self.look, self.block]
    }

    pub fn is_valid(&self) -> bool {
        self.heads()
            .iter()
            .zip(HEAD_SIZES.iter())
            .all(|(value, size)| value < size)
    }

    /// Mixed-radix code, first head most significant
    pub fn encode(&self) -> usize {
        self.heads()
            .iter()
            .zip(HEAD_SIZES.iter())
            .fold(0, |code, (value, radix)| code * radix + value)
    }

    fn to_command(self) -> MovementCommand {
        MovementCommand {
            movement_forward: match self.movement {
                1 => 1.0,
                2 => -1.0,
                _ => 0.0,
            },
            movement_strafe: 0.0,
            rotation: match self.rotation {
                1 => -1.0,
                2 => 1.0,
                _ => 0.0,
            },
            look: match self.look {
                1 => 1.0,
                2 => -1.0,
                _ => 0.0,
            },
            jump: self.jump == 1,
            place_block: self.block == 1,
            remove_block: self.block == 2,
        }
    }
}

/// Action chosen by an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionValue {
    Flat(usize),
    MultiHead(MultiHeadAction),
}

impl ActionValue {
    /// Single integer identifying the action, for usage counters and histograms
    pub fn key(&self) -> usize {
        match self {
            ActionValue::Flat(index) => *index,
            ActionValue::MultiHead(action) => action.encode(),
        }
    }

    pub fn to_command(&self) -> MovementCommand {
        match self {
            ActionValue::Flat(index) => flat_command(*index),
            ActionValue::MultiHead(action) => action.to_command(),
        }
    }
}

fn flat_command(index: usize) -> MovementCommand {
    let mut command = MovementCommand::default();
    match index {
        1 => command.movement_forward = 1.0,
        2 => command.movement_forward = -1.0,
        3 => command.movement_strafe = -1.0,
        4 => command.movement_strafe = 1.0,
        5 => command.rotation = -1.0,
        6 => command.rotation = 1.0,
        7 => command.jump = true,
        8 => {
            command.movement_forward = 1.0;
            command.jump = true;
        }
        9 => command.look = 1.0,
        10 => command.look = -1.0,
        11 => command.place_block = true,
        12 => command.remove_block = true,
        _ => {}
    }
    command
}

/// Shape of the action space, chosen once per deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSpace {
    Flat { actions: usize },
    MultiHead,
}

impl Default for ActionSpace {
    fn default() -> Self {
        ActionSpace::MultiHead
    }
}

impl ActionSpace {
    pub fn flat() -> Self {
        ActionSpace::Flat {
            actions: FLAT_ACTIONS,
        }
    }

    /// Width of the approximator output vector
    pub fn output_size(&self) -> usize {
        match self {
            ActionSpace::Flat { actions } => *actions,
            ActionSpace::MultiHead => MULTI_HEAD_OUTPUTS,
        }
    }

    /// Number of distinct action keys (see [`ActionValue::key`])
    pub fn num_keys(&self) -> usize {
        match self {
            ActionSpace::Flat { actions } => *actions,
            ActionSpace::MultiHead => MULTI_HEAD_COMBINATIONS,
        }
    }

    /// Output slices, one per head; flat mode has a single slice
    pub fn head_ranges(&self) -> Vec<Range<usize>> {
        match self {
            ActionSpace::Flat { actions } => vec![0..*actions],
            ActionSpace::MultiHead => {
                let mut start = 0;
                HEAD_SIZES
                    .iter()
                    .map(|size| {
                        let range = start..start + size;
                        start += size;
                        range
                    })
                    .collect()
            }
        }
    }

    /// Greedy action from an output vector (argmax per head)
    pub fn greedy(&self, values: &[f32]) -> ActionValue {
        let best = self.best_indices(values);
        self.from_output_indices(&best)
    }

    /// Absolute output index of the argmax within each head
    pub fn best_indices(&self, values: &[f32]) -> Vec<usize> {
        self.head_ranges()
            .into_iter()
            .map(|range| {
                let start = range.start;
                values
                    .get(range)
                    .and_then(|slice| argmax(slice))
                    .map(|i| start + i)
                    .unwrap_or(start)
            })
            .collect()
    }

    /// Absolute output indices holding the value of `action` (one per head)
    pub fn output_indices(&self, action: &ActionValue) -> Option<Vec<usize>> {
        match (self, action) {
            (ActionSpace::Flat { actions }, ActionValue::Flat(index)) if index < actions => {
                Some(vec![*index])
            }
            (ActionSpace::MultiHead, ActionValue::MultiHead(action)) if action.is_valid() => Some(
                self.head_ranges()
                    .iter()
                    .zip(action.heads())
                    .map(|(range, value)| range.start + value)
                    .collect(),
            ),
            _ => None,
        }
    }

    fn from_output_indices(&self, indices: &[usize]) -> ActionValue {
        match self {
            ActionSpace::Flat { .. } => ActionValue::Flat(indices.first().copied().unwrap_or(0)),
            ActionSpace::MultiHead => {
                let mut heads = [0; 5];
                for ((slot, range), index) in heads
                    .iter_mut()
                    .zip(self.head_ranges())
                    .zip(indices.iter())
                {
                    *slot = index - range.start;
                }
                ActionValue::MultiHead(MultiHeadAction::from_heads(heads))
            }
        }
    }

    /// Uniformly random action (each head independently in multi-head mode)
    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> ActionValue {
        match self {
            ActionSpace::Flat { actions } => ActionValue::Flat(rng.random_range(0..*actions)),
            ActionSpace::MultiHead => {
                let mut heads = [0; 5];
                for (slot, size) in heads.iter_mut().zip(HEAD_SIZES.iter()) {
                    *slot = rng.random_range(0..*size);
                }
                ActionValue::MultiHead(MultiHeadAction::from_heads(heads))
            }
        }
    }
}

/// Index of the largest finite value
pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_head_partition() {
        let ranges = ActionSpace::MultiHead.head_ranges();
        assert_eq!(ranges, vec![0..3, 3..5, 5..8, 8..11, 11..14]);
        assert_eq!(HEAD_SIZES.iter().sum::<usize>(), MULTI_HEAD_OUTPUTS);
        assert_eq!(HEAD_SIZES.iter().product::<usize>(), MULTI_HEAD_COMBINATIONS);
    }

    #[test]
    fn test_mixed_radix_boundaries() {
        let last = MultiHeadAction::from_heads([2, 1, 2, 2, 2]);
        assert_eq!(last.encode(), MULTI_HEAD_COMBINATIONS - 1);
        assert_eq!(MultiHeadAction::default().encode(), 0);

        let jump_only = MultiHeadAction::from_heads([0, 1, 0, 0, 0]);
        assert_eq!(jump_only.encode(), 27);
    }

    #[test]
    fn test_greedy_per_head() {
        let values = [
            0.1, 0.9, 0.0, // movement -> forward
            0.5, 0.2, // jump -> none
            0.0, 0.0, 3.0, // rotation -> right
            -1.0, -2.0, -0.5, // look -> down
            0.0, 1.0, 0.0, // block -> place
        ];
        let action = ActionSpace::MultiHead.greedy(&values);
        assert_eq!(
            action,
            ActionValue::MultiHead(MultiHeadAction::from_heads([1, 0, 2, 2, 1]))
        );
        assert_eq!(
            ActionSpace::MultiHead.output_indices(&action),
            Some(vec![1, 3, 7, 10, 12])
        );
    }

    #[test]
    fn test_greedy_ignores_nan() {
        let space = ActionSpace::flat();
        let mut values = vec![0.0; FLAT_ACTIONS];
        values[2] = f32::NAN;
        values[4] = 1.0;
        assert_eq!(space.greedy(&values), ActionValue::Flat(4));
    }

    #[test]
    fn test_random_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            match ActionSpace::MultiHead.random(&mut rng) {
                ActionValue::MultiHead(action) => assert!(action.is_valid()),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_output_indices_rejects_mismatched_shape() {
        let space = ActionSpace::flat();
        assert_eq!(space.output_indices(&ActionValue::Flat(FLAT_ACTIONS)), None);
        assert_eq!(
            space.output_indices(&ActionValue::MultiHead(MultiHeadAction::default())),
            None
        );
    }

    #[test]
    fn test_commands() {
        let forward_jump = ActionValue::Flat(8).to_command();
        assert_eq!(forward_jump.movement_forward, 1.0);
        assert!(forward_jump.jump);

        let remove = ActionValue::MultiHead(MultiHeadAction::from_heads([2, 0, 1, 0, 2])).to_command();
        assert_eq!(remove.movement_forward, -1.0);
        assert_eq!(remove.rotation, -1.0);
        assert!(remove.remove_block);
        assert!(!remove.place_block);
    }
}
