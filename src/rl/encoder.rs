//! State encoder for RL - converts an agent's view of the world to a fixed-length feature vector

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::infra::{AgentState, GamePhase, GameStatus, Role, Vec3, VisionData, WorldSize};

/// Width of every fixed block of the layout, excluding the ray block
const FIXED_FEATURES: usize = 3 + 2 + 3 + 1 + 4 + 4 + 4 + 6 + 3;

/// Configuration for the state encoder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Number of ray slots in the perception summary (extra rays are dropped, missing ones are zero)
    pub max_rays: usize,
    /// Maximum ray length used to normalise hit distances
    pub vision_range: f32,
    /// Width of the wall danger zone
    pub danger_zone: f32,
    /// Time constant of the last-seen recency decay, in simulated seconds
    pub memory_tau: f32,
    /// Lower bound of the recency score once an opponent has been seen
    pub memory_floor: f32,
    /// Distances beyond this are clamped in the nearest-opponent block
    pub max_opponent_distance: f32,
    /// Distance under which the very-close flag is raised
    pub very_close_distance: f32,
    /// Time-remaining fraction under which the end-game flag is raised
    pub endgame_fraction: f32,
    pub seeker_max_speed: f32,
    pub hider_max_speed: f32,
    /// Every feature is clamped to [-clamp_bound, clamp_bound]
    pub clamp_bound: f32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            max_rays: 64,
            vision_range: 24.0,
            danger_zone: 2.0,
            memory_tau: 5.0,
            memory_floor: 0.01,
            max_opponent_distance: 32.0,
            very_close_distance: 3.0,
            endgame_fraction: 0.15,
            seeker_max_speed: 6.0,
            hider_max_speed: 5.0,
            clamp_bound: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LastSeen {
    position: Vec3,
    seen_at: f32,
}

/// Stateful encoder; remembers where each agent last saw an opponent
#[derive(Debug, Clone)]
pub struct StateEncoder {
    config: EncoderConfig,
    last_seen: HashMap<String, LastSeen>,
}

impl StateEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            config,
            last_seen: HashMap::new(),
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Length of every encoded vector
    pub fn state_size(&self) -> usize {
        FIXED_FEATURES + self.config.max_rays
    }

    /// Forget all last-seen memories (episode reset)
    pub fn reset(&mut self) {
        self.last_seen.clear();
    }

    #[tracing::instrument(level = "trace", skip_all, fields(agent = %agent.id))]
    pub fn encode(
        &mut self,
        agent: &AgentState,
        status: &GameStatus,
        vision: &VisionData,
        world: &WorldSize,
    ) -> Vec<f32> {
        let mut obs = Vec::with_capacity(self.state_size());
        let width = world.width.max(1.0);
        let depth = world.depth.max(1.0);
        let height = world.height.max(1.0);

        // Position (normalized)
        obs.push(agent.position.x / width);
        obs.push(agent.position.y / height);
        obs.push(agent.position.z / depth);

        // Orientation
        obs.push(wrap_angle(agent.yaw) / std::f32::consts::PI);
        obs.push(agent.pitch / std::f32::consts::FRAC_PI_2);

        // Velocity relative to the role's top speed
        let max_speed = match agent.role {
            Role::Seeker => self.config.seeker_max_speed,
            Role::Hider => self.config.hider_max_speed,
        }
        .max(f32::EPSILON);
        for v in [agent.velocity.x, agent.velocity.y, agent.velocity.z] {
            obs.push((v / max_speed).clamp(-1.0, 1.0));
        }

        obs.push(if agent.grounded { 1.0 } else { 0.0 });

        // Boundary proximity, sharp only near a wall
        let danger = self.config.danger_zone.max(f32::EPSILON);
        for distance in world.wall_distances(&agent.position) {
            obs.push((-distance.max(0.0) / danger).exp());
        }

        // Ray summary: distance and hit category packed into one scalar per ray
        let range = self.config.vision_range.max(f32::EPSILON);
        for slot in 0..self.config.max_rays {
            let value = match vision.rays.get(slot) {
                Some(ray) if ray.hit => {
                    (ray.distance / range).clamp(0.0, 1.0) * 0.5 + ray.category as f32 * 0.01
                }
                _ => 0.0,
            };
            obs.push(value);
        }

        // Game phase
        let remaining = status.time_remaining_fraction();
        obs.push(remaining);
        obs.push(status.resolved_fraction());
        obs.push(if status.phase == GamePhase::Seeking {
            1.0
        } else {
            0.0
        });
        obs.push(
            if status.phase == GamePhase::Seeking && remaining < self.config.endgame_fraction {
                1.0
            } else {
                0.0
            },
        );

        // Last-seen opponent memory
        let nearest = vision.nearest_opponent(agent.role);
        if let Some(opponent) = nearest {
            self.last_seen.insert(
                agent.id.clone(),
                LastSeen {
                    position: opponent.position,
                    seen_at: status.elapsed_time,
                },
            );
        }
        match self.last_seen.get(&agent.id) {
            Some(memory) => {
                let elapsed = (status.elapsed_time - memory.seen_at).max(0.0);
                let recency = (-elapsed / self.config.memory_tau.max(f32::EPSILON)).exp();
                obs.push(memory.position.x / width);
                obs.push(memory.position.z / depth);
                obs.push(recency.max(self.config.memory_floor));
                obs.push(if nearest.is_some() { 1.0 } else { 0.0 });
            }
            None => obs.extend_from_slice(&[0.0, 0.0, 0.0, 0.0]),
        }

        // Nearest opponent
        match nearest {
            Some(opponent) => {
                let direction = opponent.direction.horizontal_normalized();
                let max_distance = self.config.max_opponent_distance.max(f32::EPSILON);
                let count = vision.visible_opponents(agent.role).count() as f32;
                obs.push(1.0);
                obs.push(direction.x);
                obs.push(direction.z);
                obs.push((opponent.distance / max_distance).clamp(0.0, 1.0));
                // Seekers count visible hiders; hiders read it as a threat level
                obs.push(match agent.role {
                    Role::Seeker => count / 4.0,
                    Role::Hider => 1.0 - (opponent.distance / max_distance).clamp(0.0, 1.0),
                });
                obs.push(if opponent.distance < self.config.very_close_distance {
                    1.0
                } else {
                    0.0
                });
            }
            None => obs.extend_from_slice(&[0.0; 6]),
        }

        // Interaction capabilities
        obs.push(if agent.blocks > 0 { 1.0 } else { 0.0 });
        obs.push(if agent.can_place { 1.0 } else { 0.0 });
        obs.push(if agent.can_remove { 1.0 } else { 0.0 });

        debug_assert_eq!(obs.len(), self.state_size());
        sanitize(&mut obs, self.config.clamp_bound);
        obs
    }
}

/// Replace non-finite entries with zero and clamp magnitudes
pub fn sanitize(values: &mut [f32], bound: f32) {
    let bound = bound.abs();
    for v in values.iter_mut() {
        *v = if v.is_finite() {
            v.clamp(-bound, bound)
        } else {
            0.0
        };
    }
}

fn wrap_angle(angle: f32) -> f32 {
    if !angle.is_finite() {
        return 0.0;
    }
    let two_pi = std::f32::consts::TAU;
    let wrapped = (angle + std::f32::consts::PI).rem_euclid(two_pi);
    wrapped - std::f32::consts::PI
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::{RayHit, VisibleAgent};

    fn status(elapsed: f32) -> GameStatus {
        GameStatus {
            phase: GamePhase::Seeking,
            resolved_count: 0,
            total_targets: 2,
            elapsed_time: elapsed,
            time_limit: 100.0,
        }
    }

    fn hider_in_view(distance: f32) -> VisibleAgent {
        VisibleAgent {
            id: "hider_0".into(),
            role: Role::Hider,
            distance,
            direction: Vec3::new(1.0, 0.0, 0.0),
            position: Vec3::new(12.0, 0.0, 8.0),
        }
    }

    #[test]
    fn test_encoder_state_size() {
        let encoder = StateEncoder::new(EncoderConfig::default());
        assert_eq!(encoder.state_size(), 94);
    }

    #[test]
    fn test_origin_agent_with_no_hits_is_finite_and_bounded() {
        let config = EncoderConfig::default();
        let bound = config.clamp_bound;
        let mut encoder = StateEncoder::new(config);
        let agent = AgentState::new("seeker_0", Role::Seeker, Vec3::ZERO);
        let vision = VisionData {
            visible_others: Vec::new(),
            rays: vec![RayHit::default(); 8],
        };

        let obs = encoder.encode(&agent, &status(0.0), &vision, &WorldSize::new(32.0, 32.0, 16.0));
        assert_eq!(obs.len(), encoder.state_size());
        assert!(obs.iter().all(|v| v.is_finite() && v.abs() <= bound));
        // At the corner the -x and -z wall signals saturate
        assert!((obs[9] - 1.0).abs() < 1e-6);
        assert!((obs[11] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_inputs_are_sanitized() {
        let mut encoder = StateEncoder::new(EncoderConfig::default());
        let mut agent = AgentState::new("hider_0", Role::Hider, Vec3::new(f32::NAN, 0.0, 1e9));
        agent.velocity = Vec3::new(f32::INFINITY, 0.0, 0.0);
        agent.yaw = f32::NAN;
        let obs = encoder.encode(
            &agent,
            &status(0.0),
            &VisionData::default(),
            &WorldSize::new(0.0, 0.0, 0.0),
        );
        assert!(obs.iter().all(|v| v.is_finite() && v.abs() <= 5.0));
    }

    #[test]
    fn test_ray_packing() {
        let mut encoder = StateEncoder::new(EncoderConfig {
            max_rays: 2,
            vision_range: 10.0,
            ..EncoderConfig::default()
        });
        let agent = AgentState::new("seeker_0", Role::Seeker, Vec3::new(5.0, 0.0, 5.0));
        let vision = VisionData {
            visible_others: Vec::new(),
            rays: vec![
                RayHit {
                    hit: true,
                    distance: 5.0,
                    is_opponent: false,
                    category: 2,
                },
                RayHit {
                    hit: false,
                    distance: 10.0,
                    is_opponent: false,
                    category: 1,
                },
                RayHit {
                    hit: true,
                    distance: 1.0,
                    is_opponent: true,
                    category: 3,
                },
            ],
        };
        let obs = encoder.encode(&agent, &status(0.0), &vision, &WorldSize::new(10.0, 10.0, 10.0));
        assert_eq!(obs.len(), FIXED_FEATURES + 2);
        assert!((obs[13] - 0.27).abs() < 1e-6);
        assert_eq!(obs[14], 0.0);
    }

    #[test]
    fn test_last_seen_memory_decays() {
        let mut encoder = StateEncoder::new(EncoderConfig::default());
        let agent = AgentState::new("seeker_0", Role::Seeker, Vec3::new(4.0, 0.0, 4.0));
        let world = WorldSize::new(32.0, 32.0, 16.0);
        let memory_at = FIXED_FEATURES - 13 + encoder.config().max_rays;

        let seen = VisionData {
            visible_others: vec![hider_in_view(2.0)],
            rays: Vec::new(),
        };
        let obs = encoder.encode(&agent, &status(10.0), &seen, &world);
        assert!((obs[memory_at] - 12.0 / 32.0).abs() < 1e-6);
        assert!((obs[memory_at + 2] - 1.0).abs() < 1e-6);
        assert_eq!(obs[memory_at + 3], 1.0);
        // nearest-opponent block: present and very close
        assert_eq!(obs[memory_at + 4], 1.0);
        assert_eq!(obs[memory_at + 9], 1.0);

        let later = encoder.encode(&agent, &status(15.0), &VisionData::default(), &world);
        let recency = later[memory_at + 2];
        assert!((recency - (-1.0f32).exp()).abs() < 1e-5);
        assert_eq!(later[memory_at + 3], 0.0);

        let much_later = encoder.encode(&agent, &status(95.0), &VisionData::default(), &world);
        assert!((much_later[memory_at + 2] - 0.01).abs() < 1e-6);

        encoder.reset();
        let fresh = encoder.encode(&agent, &status(96.0), &VisionData::default(), &world);
        assert_eq!(fresh[memory_at + 2], 0.0);
    }
}
