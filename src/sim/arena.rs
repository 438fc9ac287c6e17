//! Flat walled arena with pillars: a small kinematic simulation behind the collaborator traits

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::infra::{
    AgentState, GamePhase, GameSession, GameStatus, MovementExecutor, RayHit, Role, TerminalReason,
    TerrainProvider, Vec3, VisibleAgent, VisionData, VisionProvider, World, WorldSize,
};
use crate::rl::action_space::MovementCommand;

const AGENT_RADIUS: f32 = 0.4;
const BLOCK_RADIUS: f32 = 0.5;
const REACH: f32 = 2.0;
const MAX_PITCH: f32 = 1.2;

const CATEGORY_WALL: u8 = 1;
const CATEGORY_PILLAR: u8 = 2;
const CATEGORY_BLOCK: u8 = 3;
const CATEGORY_AGENT: u8 = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    pub width: f32,
    pub depth: f32,
    pub height: f32,
    pub num_hiders: usize,
    /// Seconds hiders get before the seeker starts
    pub hiding_time: f32,
    /// Episode length in simulated seconds, hiding included
    pub time_limit: f32,
    pub capture_radius: f32,
    pub num_pillars: usize,
    pub pillar_radius: f32,
    pub ray_count: usize,
    /// Horizontal field of view in radians
    pub field_of_view: f32,
    pub vision_range: f32,
    pub seeker_speed: f32,
    pub hider_speed: f32,
    /// Radians per second at full rotation input
    pub turn_rate: f32,
    pub look_rate: f32,
    pub jump_speed: f32,
    pub gravity: f32,
    pub hider_blocks: u32,
    pub seed: Option<u64>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            width: 40.0,
            depth: 40.0,
            height: 16.0,
            num_hiders: 2,
            hiding_time: 3.0,
            time_limit: 60.0,
            capture_radius: 1.5,
            num_pillars: 8,
            pillar_radius: 1.2,
            ray_count: 16,
            field_of_view: 2.0,
            vision_range: 24.0,
            seeker_speed: 6.0,
            hider_speed: 5.0,
            turn_rate: 3.0,
            look_rate: 1.5,
            jump_speed: 5.0,
            gravity: 9.8,
            hider_blocks: 3,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Obstacle {
    pub x: f32,
    pub z: f32,
    pub radius: f32,
    /// Placed by an agent and removable
    pub placed: bool,
}

/// Static and agent-built obstacles shared by every arena collaborator
#[derive(Debug, Clone)]
pub struct ArenaLayout {
    pub size: WorldSize,
    pub obstacles: Vec<Obstacle>,
}

impl ArenaLayout {
    fn new(config: &ArenaConfig) -> Self {
        Self {
            size: WorldSize::new(config.width, config.depth, config.height),
            obstacles: Vec::new(),
        }
    }

    /// First obstacle hit along a horizontal ray, within `max_distance`
    fn cast(&self, origin: &Vec3, direction: &Vec3, max_distance: f32) -> Option<(f32, u8)> {
        let mut best: Option<(f32, u8)> = None;
        for obstacle in &self.obstacles {
            if let Some(t) = ray_circle(origin, direction, obstacle.x, obstacle.z, obstacle.radius) {
                if t <= max_distance && best.is_none_or(|(d, _)| t < d) {
                    let category = if obstacle.placed {
                        CATEGORY_BLOCK
                    } else {
                        CATEGORY_PILLAR
                    };
                    best = Some((t, category));
                }
            }
        }
        best
    }

    fn wall_distance(&self, origin: &Vec3, direction: &Vec3) -> f32 {
        let mut t = f32::INFINITY;
        if direction.x > f32::EPSILON {
            t = t.min((self.size.width - origin.x) / direction.x);
        } else if direction.x < -f32::EPSILON {
            t = t.min(-origin.x / direction.x);
        }
        if direction.z > f32::EPSILON {
            t = t.min((self.size.depth - origin.z) / direction.z);
        } else if direction.z < -f32::EPSILON {
            t = t.min(-origin.z / direction.z);
        }
        t.max(0.0)
    }

    pub fn line_of_sight(&self, from: &Vec3, to: &Vec3) -> bool {
        let distance = from.horizontal_distance(to);
        if distance <= f32::EPSILON {
            return true;
        }
        let direction = (*to - *from).horizontal_normalized();
        self.cast(from, &direction, distance).is_none()
    }

    fn is_free(&self, x: f32, z: f32, clearance: f32) -> bool {
        self.obstacles.iter().all(|o| {
            let dx = x - o.x;
            let dz = z - o.z;
            (dx * dx + dz * dz).sqrt() > o.radius + clearance
        })
    }
}

type SharedLayout = Arc<RwLock<ArenaLayout>>;

fn read(layout: &SharedLayout) -> RwLockReadGuard<'_, ArenaLayout> {
    layout.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(layout: &SharedLayout) -> RwLockWriteGuard<'_, ArenaLayout> {
    layout.write().unwrap_or_else(PoisonError::into_inner)
}

/// Distance along a unit horizontal ray to a circle, if it is hit ahead of the origin
fn ray_circle(origin: &Vec3, direction: &Vec3, cx: f32, cz: f32, radius: f32) -> Option<f32> {
    let ox = origin.x - cx;
    let oz = origin.z - cz;
    let b = ox * direction.x + oz * direction.z;
    let c = ox * ox + oz * oz - radius * radius;
    let disc = b * b - c;
    if disc < 0.0 {
        return None;
    }
    let root = disc.sqrt();
    let t = if -b - root >= 0.0 { -b - root } else { -b + root };
    (t >= 0.0).then_some(t)
}

fn heading(yaw: f32) -> Vec3 {
    Vec3::new(yaw.cos(), 0.0, yaw.sin())
}

fn random_free_position(layout: &ArenaLayout, rng: &mut StdRng, clearance: f32) -> Vec3 {
    let margin = 1.0;
    let max_x = (layout.size.width - margin).max(margin + 0.1);
    let max_z = (layout.size.depth - margin).max(margin + 0.1);
    let mut candidate = Vec3::new(layout.size.width / 2.0, 0.0, layout.size.depth / 2.0);
    for _ in 0..100 {
        candidate = Vec3::new(
            rng.random_range(margin..max_x),
            0.0,
            rng.random_range(margin..max_z),
        );
        if layout.is_free(candidate.x, candidate.z, clearance) {
            break;
        }
    }
    candidate
}

/// Places pillars; always ready immediately
pub struct ArenaTerrain {
    layout: SharedLayout,
    num_pillars: usize,
    pillar_radius: f32,
    rng: StdRng,
}

impl TerrainProvider for ArenaTerrain {
    fn regenerate(&mut self, seed: Option<u64>) {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut self.rng),
        };
        let mut layout = write(&self.layout);
        layout.obstacles.clear();
        for _ in 0..self.num_pillars {
            let position = random_free_position(&layout, &mut rng, self.pillar_radius * 2.0);
            layout.obstacles.push(Obstacle {
                x: position.x,
                z: position.z,
                radius: self.pillar_radius,
                placed: false,
            });
        }
        tracing::trace!(?seed, pillars = layout.obstacles.len(), "Arena regenerated");
    }

    fn is_ready(&self) -> bool {
        true
    }
}

/// Field-of-view visibility plus a horizontal ray fan
pub struct ArenaVision {
    layout: SharedLayout,
    ray_count: usize,
    field_of_view: f32,
    range: f32,
}

impl VisionProvider for ArenaVision {
    fn vision(&self, agent: &AgentState, all_agents: &[AgentState]) -> VisionData {
        let layout = read(&self.layout);
        let facing = heading(agent.yaw);
        let half_fov = self.field_of_view / 2.0;

        let mut visible_others = Vec::new();
        for other in all_agents {
            if other.id == agent.id || other.found {
                continue;
            }
            let offset = other.position - agent.position;
            let distance = offset.horizontal_length();
            if distance > self.range {
                continue;
            }
            let direction = offset.horizontal_normalized();
            let cos_angle = direction.x * facing.x + direction.z * facing.z;
            if distance > AGENT_RADIUS && cos_angle < half_fov.cos() {
                continue;
            }
            if !layout.line_of_sight(&agent.position, &other.position) {
                continue;
            }
            visible_others.push(VisibleAgent {
                id: other.id.clone(),
                role: other.role,
                distance,
                direction,
                position: other.position,
            });
        }

        let mut rays = Vec::with_capacity(self.ray_count);
        for i in 0..self.ray_count {
            let fraction = if self.ray_count > 1 {
                i as f32 / (self.ray_count - 1) as f32
            } else {
                0.5
            };
            let direction = heading(agent.yaw - half_fov + fraction * self.field_of_view);

            let mut best = (layout.wall_distance(&agent.position, &direction), CATEGORY_WALL, false);
            if let Some((t, category)) = layout.cast(&agent.position, &direction, best.0) {
                best = (t, category, false);
            }
            for other in all_agents.iter().filter(|o| o.id != agent.id && !o.found) {
                if let Some(t) = ray_circle(
                    &agent.position,
                    &direction,
                    other.position.x,
                    other.position.z,
                    AGENT_RADIUS,
                ) {
                    if t < best.0 {
                        best = (t, CATEGORY_AGENT, other.role != agent.role);
                    }
                }
            }

            rays.push(if best.0 <= self.range {
                RayHit {
                    hit: true,
                    distance: best.0,
                    is_opponent: best.2,
                    category: best.1,
                }
            } else {
                RayHit {
                    hit: false,
                    distance: self.range,
                    is_opponent: false,
                    category: 0,
                }
            });
        }

        VisionData {
            visible_others,
            rays,
        }
    }
}

/// Kinematic movement with gravity, jumping, pillar collisions and block building
pub struct ArenaMovement {
    layout: SharedLayout,
    seeker_speed: f32,
    hider_speed: f32,
    turn_rate: f32,
    look_rate: f32,
    jump_speed: f32,
    gravity: f32,
}

impl ArenaMovement {
    fn refresh_capabilities(&self, layout: &ArenaLayout, agent: &mut AgentState) {
        agent.can_place = agent.blocks > 0;
        agent.can_remove = layout
            .obstacles
            .iter()
            .any(|o| o.placed && reach_distance(agent, o) <= REACH);
    }
}

fn reach_distance(agent: &AgentState, obstacle: &Obstacle) -> f32 {
    let dx = agent.position.x - obstacle.x;
    let dz = agent.position.z - obstacle.z;
    (dx * dx + dz * dz).sqrt() - obstacle.radius
}

impl MovementExecutor for ArenaMovement {
    fn execute_action(&mut self, agent: &mut AgentState, command: &MovementCommand, dt: f32) {
        agent.yaw += command.rotation.clamp(-1.0, 1.0) * self.turn_rate * dt;
        agent.pitch =
            (agent.pitch + command.look.clamp(-1.0, 1.0) * self.look_rate * dt).clamp(-MAX_PITCH, MAX_PITCH);

        let speed = match agent.role {
            Role::Seeker => self.seeker_speed,
            Role::Hider => self.hider_speed,
        };
        let forward = heading(agent.yaw);
        let right = Vec3::new(-forward.z, 0.0, forward.x);
        let planar = forward * command.movement_forward.clamp(-1.0, 1.0)
            + right * command.movement_strafe.clamp(-1.0, 1.0);
        let planar = if planar.horizontal_length() > 1.0 {
            planar.horizontal_normalized()
        } else {
            planar
        };
        agent.velocity.x = planar.x * speed;
        agent.velocity.z = planar.z * speed;

        if command.jump && agent.grounded {
            agent.velocity.y = self.jump_speed;
            agent.grounded = false;
        }

        let mut layout = write(&self.layout);
        if command.place_block && agent.blocks > 0 {
            let spot = agent.position + forward * (AGENT_RADIUS + BLOCK_RADIUS + 0.6);
            if layout.is_free(spot.x, spot.z, BLOCK_RADIUS)
                && spot.x > 0.0
                && spot.z > 0.0
                && spot.x < layout.size.width
                && spot.z < layout.size.depth
            {
                layout.obstacles.push(Obstacle {
                    x: spot.x,
                    z: spot.z,
                    radius: BLOCK_RADIUS,
                    placed: true,
                });
                agent.blocks -= 1;
            }
        } else if command.remove_block {
            let nearest = layout
                .obstacles
                .iter()
                .enumerate()
                .filter(|(_, o)| o.placed && reach_distance(agent, o) <= REACH)
                .min_by(|(_, a), (_, b)| reach_distance(agent, a).total_cmp(&reach_distance(agent, b)))
                .map(|(i, _)| i);
            if let Some(i) = nearest {
                layout.obstacles.swap_remove(i);
                agent.blocks += 1;
            }
        }
        self.refresh_capabilities(&layout, agent);
    }

    fn update_physics(&mut self, agent: &mut AgentState, dt: f32) {
        if !agent.grounded {
            agent.velocity.y -= self.gravity * dt;
        }
        agent.position = agent.position + agent.velocity * dt;

        if agent.position.y <= 0.0 {
            agent.position.y = 0.0;
            agent.velocity.y = 0.0;
            agent.grounded = true;
        }

        let layout = read(&self.layout);
        for obstacle in &layout.obstacles {
            let dx = agent.position.x - obstacle.x;
            let dz = agent.position.z - obstacle.z;
            let distance = (dx * dx + dz * dz).sqrt();
            let min_distance = obstacle.radius + AGENT_RADIUS;
            if distance < min_distance {
                let (nx, nz) = if distance > f32::EPSILON {
                    (dx / distance, dz / distance)
                } else {
                    (1.0, 0.0)
                };
                agent.position.x = obstacle.x + nx * min_distance;
                agent.position.z = obstacle.z + nz * min_distance;
            }
        }

        agent.position.x = agent
            .position
            .x
            .clamp(AGENT_RADIUS, (layout.size.width - AGENT_RADIUS).max(AGENT_RADIUS));
        agent.position.z = agent
            .position
            .z
            .clamp(AGENT_RADIUS, (layout.size.depth - AGENT_RADIUS).max(AGENT_RADIUS));
    }

    fn speed(&self, agent: &AgentState) -> f32 {
        agent.velocity.horizontal_length()
    }
}

/// Hiding then seeking phases; a hider is found when a seeker is close with line of sight
pub struct ArenaSession {
    layout: SharedLayout,
    config: ArenaConfig,
    rng: StdRng,
    phase: GamePhase,
    elapsed: f32,
    resolved: usize,
    total: usize,
}

impl GameSession for ArenaSession {
    fn status(&self) -> GameStatus {
        GameStatus {
            phase: self.phase,
            resolved_count: self.resolved,
            total_targets: self.total,
            elapsed_time: self.elapsed,
            time_limit: self.config.time_limit,
        }
    }

    fn update(&mut self, dt: f32, agents: &mut [AgentState]) {
        if self.phase == GamePhase::Finished || self.phase == GamePhase::Waiting {
            return;
        }
        self.elapsed += dt;

        if self.phase == GamePhase::Hiding && self.elapsed >= self.config.hiding_time {
            self.phase = GamePhase::Seeking;
            tracing::trace!("Seeking phase started");
        }

        if self.phase == GamePhase::Seeking {
            let layout = read(&self.layout);
            let seekers: Vec<Vec3> = agents
                .iter()
                .filter(|a| a.role == Role::Seeker)
                .map(|a| a.position)
                .collect();
            for hider in agents
                .iter_mut()
                .filter(|a| a.role == Role::Hider && !a.found)
            {
                let caught = seekers.iter().any(|s| {
                    s.horizontal_distance(&hider.position) < self.config.capture_radius
                        && layout.line_of_sight(s, &hider.position)
                });
                if caught {
                    hider.found = true;
                    hider.velocity = Vec3::ZERO;
                    self.resolved += 1;
                    tracing::debug!(hider = %hider.id, elapsed = self.elapsed, "Hider found");
                }
            }

            if self.resolved >= self.total || self.elapsed >= self.config.time_limit {
                self.phase = GamePhase::Finished;
            }
        }
    }

    fn end_episode(&mut self, reason: TerminalReason) {
        self.phase = GamePhase::Finished;
        tracing::trace!(%reason, "Arena episode ended");
    }

    fn spawn_agents(&mut self) -> Vec<AgentState> {
        self.elapsed = 0.0;
        self.resolved = 0;
        self.total = self.config.num_hiders;
        self.phase = if self.config.hiding_time > 0.0 {
            GamePhase::Hiding
        } else {
            GamePhase::Seeking
        };

        let layout = read(&self.layout);
        let mut agents = Vec::with_capacity(self.config.num_hiders + 1);

        let mut seeker = AgentState::new(
            "seeker_0",
            Role::Seeker,
            random_free_position(&layout, &mut self.rng, AGENT_RADIUS),
        );
        seeker.yaw = self.rng.random_range(0.0..std::f32::consts::TAU);
        let seeker_position = seeker.position;
        agents.push(seeker);

        let min_separation = (self.config.capture_radius * 4.0).max(4.0);
        for i in 0..self.config.num_hiders {
            let mut position = random_free_position(&layout, &mut self.rng, AGENT_RADIUS);
            for _ in 0..50 {
                if position.horizontal_distance(&seeker_position) >= min_separation {
                    break;
                }
                position = random_free_position(&layout, &mut self.rng, AGENT_RADIUS);
            }
            let mut hider = AgentState::new(format!("hider_{}", i), Role::Hider, position);
            hider.yaw = self.rng.random_range(0.0..std::f32::consts::TAU);
            hider.blocks = self.config.hider_blocks;
            hider.can_place = hider.blocks > 0;
            agents.push(hider);
        }
        agents
    }

    fn world_size(&self) -> WorldSize {
        read(&self.layout).size
    }
}

/// Build every arena collaborator around one shared layout
pub fn arena_world(config: ArenaConfig) -> World {
    let layout: SharedLayout = Arc::new(RwLock::new(ArenaLayout::new(&config)));
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let terrain = ArenaTerrain {
        layout: layout.clone(),
        num_pillars: config.num_pillars,
        pillar_radius: config.pillar_radius,
        rng: StdRng::from_rng(&mut rng),
    };
    let vision = ArenaVision {
        layout: layout.clone(),
        ray_count: config.ray_count,
        field_of_view: config.field_of_view,
        range: config.vision_range,
    };
    let movement = ArenaMovement {
        layout: layout.clone(),
        seeker_speed: config.seeker_speed,
        hider_speed: config.hider_speed,
        turn_rate: config.turn_rate,
        look_rate: config.look_rate,
        jump_speed: config.jump_speed,
        gravity: config.gravity,
    };
    let session = ArenaSession {
        layout,
        rng: StdRng::from_rng(&mut rng),
        config,
        phase: GamePhase::Waiting,
        elapsed: 0.0,
        resolved: 0,
        total: 0,
    };

    World::new(vision, movement, session, terrain)
}
