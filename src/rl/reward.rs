//! Role-conditioned reward shaping and per-episode agent bookkeeping

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::infra::{AgentState, GameStatus, Role, TerminalReason, Vec3, VisionData, WorldSize};

/// Reward magnitudes; every term is tunable
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Paid by both roles every step
    pub time_penalty: f32,

    pub visible_hider_reward: f32,
    pub proximity_bonus: f32,
    /// Distance at which the proximity bonus reaches zero
    pub proximity_range: f32,
    pub very_close_bonus: f32,
    pub very_close_distance: f32,
    /// Reward per unit of distance closed on the nearest hider (negative when retreating)
    pub approach_scale: f32,
    pub novelty_bonus: f32,
    /// Side of the grid cells used for novelty and exploration tracking
    pub cell_size: f32,

    pub visible_penalty: f32,
    pub hidden_bonus: f32,
    /// Distance at which the safety bonus saturates
    pub safety_distance: f32,
    pub safety_bonus: f32,
    pub threat_radius: f32,
    pub panic_penalty: f32,
    pub flee_bonus: f32,

    /// Horizontal speed under which an agent counts as stationary
    pub stationary_speed: f32,
    /// Consecutive stationary steps tolerated before the penalty applies
    pub stationary_grace: u32,
    pub stationary_penalty: f32,
    /// Turn rate (rad/s) that, without linear motion, counts as spinning in place
    pub spin_rate: f32,
    pub spin_penalty: f32,
    pub boundary_zone: f32,
    pub boundary_penalty: f32,

    pub clip_min: f32,
    pub clip_max: f32,

    pub seeker_win_bonus: f32,
    pub seeker_loss_penalty: f32,
    /// Scaled by the fraction of hiders found
    pub seeker_partial_credit: f32,
    pub capture_bonus: f32,
    pub hider_survival_bonus: f32,
    pub hider_capture_penalty: f32,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            time_penalty: 0.01,

            visible_hider_reward: 0.2,
            proximity_bonus: 0.1,
            proximity_range: 16.0,
            very_close_bonus: 0.2,
            very_close_distance: 3.0,
            approach_scale: 0.1,
            novelty_bonus: 0.05,
            cell_size: 2.0,

            visible_penalty: 0.2,
            hidden_bonus: 0.02,
            safety_distance: 12.0,
            safety_bonus: 0.05,
            threat_radius: 8.0,
            panic_penalty: 0.1,
            flee_bonus: 0.05,

            stationary_speed: 0.2,
            stationary_grace: 10,
            stationary_penalty: 0.05,
            spin_rate: 3.0,
            spin_penalty: 0.05,
            boundary_zone: 2.0,
            boundary_penalty: 0.05,

            clip_min: -1.0,
            clip_max: 1.0,

            seeker_win_bonus: 10.0,
            seeker_loss_penalty: -5.0,
            seeker_partial_credit: 5.0,
            capture_bonus: 3.0,
            hider_survival_bonus: 5.0,
            hider_capture_penalty: -5.0,
        }
    }
}

/// Episode-scoped memory of one agent, discarded at reset
#[derive(Debug, Clone, Default)]
pub struct EpisodeTracker {
    last_distance: Option<f32>,
    stationary_steps: u32,
    visited: HashSet<(i32, i32)>,
    last_position: Option<Vec3>,
    last_yaw: Option<f32>,
    pub reward_total: f32,
    pub distance_traveled: f32,
    pub jumps_attempted: u32,
    pub jumps_succeeded: u32,
}

impl EpisodeTracker {
    pub fn unique_cells(&self) -> usize {
        self.visited.len()
    }

    pub fn record_jump(&mut self, succeeded: bool) {
        self.jumps_attempted += 1;
        if succeeded {
            self.jumps_succeeded += 1;
        }
    }

    fn visit(&mut self, position: &Vec3, cell_size: f32) -> bool {
        let size = cell_size.max(f32::EPSILON);
        let cell = (
            (position.x / size).floor() as i32,
            (position.z / size).floor() as i32,
        );
        self.visited.insert(cell)
    }
}

/// How the opposing role sees an agent this step
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Exposure {
    /// Some active opponent's view contains the agent
    pub seen: bool,
    /// Horizontal distance to the nearest active opponent
    pub nearest_opponent: Option<f32>,
}

impl Exposure {
    /// Exposure of `agent` given the views of the other agents
    pub fn of<'a>(
        agent: &AgentState,
        views: impl IntoIterator<Item = (&'a AgentState, &'a VisionData)>,
    ) -> Self {
        let opponent = agent.role.opponent();
        let mut exposure = Exposure::default();
        for (other, vision) in views {
            if other.role != opponent || !other.is_active() {
                continue;
            }
            if vision.visible_others.iter().any(|o| o.id == agent.id) {
                exposure.seen = true;
            }
            let distance = agent.position.horizontal_distance(&other.position);
            exposure.nearest_opponent = Some(
                exposure
                    .nearest_opponent
                    .map_or(distance, |nearest| nearest.min(distance)),
            );
        }
        exposure
    }
}

/// What the shaper needs to know about one step of one agent
pub struct StepContext<'a> {
    pub agent: &'a AgentState,
    /// The agent's own view
    pub vision: &'a VisionData,
    pub exposure: Exposure,
    pub world: &'a WorldSize,
    /// Horizontal speed reported by the movement executor
    pub speed: f32,
    pub dt: f32,
}

#[derive(Debug, Clone)]
pub struct RewardShaper {
    config: RewardConfig,
}

impl RewardShaper {
    pub fn new(config: RewardConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RewardConfig {
        &self.config
    }

    /// Dense shaping reward for one step, clipped into `[clip_min, clip_max]`
    #[tracing::instrument(level = "trace", skip_all, fields(agent = %ctx.agent.id))]
    pub fn step_reward(&self, ctx: &StepContext<'_>, tracker: &mut EpisodeTracker) -> f32 {
        let c = &self.config;
        let agent = ctx.agent;

        let mut reward = -c.time_penalty;

        if let Some(last) = tracker.last_position {
            tracker.distance_traveled += agent.position.horizontal_distance(&last);
        }
        tracker.last_position = Some(agent.position);
        let novel = tracker.visit(&agent.position, c.cell_size);

        reward += match agent.role {
            Role::Seeker => self.seeker_terms(ctx, tracker, novel),
            Role::Hider => self.hider_terms(ctx, tracker),
        };

        // Stationary
        if ctx.speed < c.stationary_speed {
            tracker.stationary_steps += 1;
            if tracker.stationary_steps > c.stationary_grace {
                reward -= c.stationary_penalty;
            }
        } else {
            tracker.stationary_steps = 0;
        }

        // Spinning in place
        if let Some(last_yaw) = tracker.last_yaw {
            let turn = angle_delta(agent.yaw, last_yaw).abs() / ctx.dt.max(f32::EPSILON);
            if turn > c.spin_rate && ctx.speed < c.stationary_speed {
                reward -= c.spin_penalty;
            }
        }
        tracker.last_yaw = Some(agent.yaw);

        // Boundary proximity
        let zone = c.boundary_zone.max(f32::EPSILON);
        let nearest_wall = ctx
            .world
            .wall_distances(&agent.position)
            .into_iter()
            .fold(f32::INFINITY, f32::min);
        if nearest_wall < zone {
            reward -= c.boundary_penalty * (-nearest_wall.max(0.0) / zone).exp();
        }

        let reward = if reward.is_finite() {
            reward.clamp(c.clip_min, c.clip_max)
        } else {
            0.0
        };
        tracker.reward_total += reward;
        reward
    }

    fn seeker_terms(&self, ctx: &StepContext<'_>, tracker: &mut EpisodeTracker, novel: bool) -> f32 {
        let c = &self.config;
        let mut reward = 0.0;

        let visible = ctx.vision.visible_opponents(Role::Seeker).count();
        reward += c.visible_hider_reward * visible as f32;

        let nearest = ctx.vision.nearest_opponent(Role::Seeker).map(|o| o.distance);
        if let Some(distance) = nearest {
            let range = c.proximity_range.max(f32::EPSILON);
            reward += c.proximity_bonus * (1.0 - distance / range).max(0.0);
            if distance < c.very_close_distance {
                reward += c.very_close_bonus;
            }
            if let Some(last) = tracker.last_distance {
                reward += c.approach_scale * (last - distance);
            }
        }
        tracker.last_distance = nearest;

        if novel {
            reward += c.novelty_bonus;
        }
        reward
    }

    fn hider_terms(&self, ctx: &StepContext<'_>, tracker: &mut EpisodeTracker) -> f32 {
        let c = &self.config;
        let mut reward = 0.0;

        if ctx.exposure.seen {
            reward -= c.visible_penalty;
        } else {
            reward += c.hidden_bonus;
        }

        let nearest = ctx.exposure.nearest_opponent;
        if let Some(distance) = nearest {
            let safety = c.safety_distance.max(f32::EPSILON);
            reward += c.safety_bonus * (distance / safety).clamp(0.0, 1.0);

            if distance < c.threat_radius {
                if ctx.speed < c.stationary_speed {
                    reward -= c.panic_penalty;
                } else if tracker.last_distance.is_some_and(|last| distance > last) {
                    reward += c.flee_bonus;
                }
            }
        }
        tracker.last_distance = nearest;
        reward
    }

    /// One-time bonus when a seeker finds a hider, or the penalty for the hider found
    pub fn capture_reward(&self, role: Role) -> f32 {
        match role {
            Role::Seeker => self.config.capture_bonus,
            Role::Hider => self.config.hider_capture_penalty,
        }
    }

    /// One-time end-of-episode bonus, applied outside the per-step clip.
    ///
    /// Hitting the step cap is a truncation: only partial credit is handed out.
    pub fn terminal_bonus(&self, agent: &AgentState, reason: TerminalReason, status: &GameStatus) -> f32 {
        let c = &self.config;
        match (agent.role, reason) {
            (Role::Seeker, TerminalReason::AllFound) => c.seeker_win_bonus,
            (Role::Seeker, TerminalReason::TimeLimit) => {
                c.seeker_loss_penalty + c.seeker_partial_credit * status.resolved_fraction()
            }
            (Role::Seeker, TerminalReason::StepCap) => {
                c.seeker_partial_credit * status.resolved_fraction()
            }
            // Found hiders already paid the capture penalty
            (Role::Hider, _) if agent.found => 0.0,
            (Role::Hider, TerminalReason::TimeLimit) => c.hider_survival_bonus,
            (Role::Hider, TerminalReason::StepCap) => {
                c.hider_survival_bonus * (1.0 - status.time_remaining_fraction())
            }
            (Role::Hider, TerminalReason::AllFound) => 0.0,
        }
    }
}

/// Signed smallest difference between two angles
fn angle_delta(a: f32, b: f32) -> f32 {
    let d = (a - b).rem_euclid(std::f32::consts::TAU);
    if d > std::f32::consts::PI {
        d - std::f32::consts::TAU
    } else {
        d
    }
}
