use std::fmt;
use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Length of the x/z component, ignoring vertical motion
    pub fn horizontal_length(&self) -> f32 {
        (self.x * self.x + self.z * self.z).sqrt()
    }

    pub fn horizontal_distance(&self, other: &Vec3) -> f32 {
        (*self - *other).horizontal_length()
    }

    pub fn distance(&self, other: &Vec3) -> f32 {
        (*self - *other).length()
    }

    /// Unit vector in the x/z plane, or zero when the vector has no horizontal extent
    pub fn horizontal_normalized(&self) -> Vec3 {
        let len = self.horizontal_length();
        if len > f32::EPSILON {
            Vec3::new(self.x / len, 0.0, self.z / len)
        } else {
            Vec3::ZERO
        }
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f32) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Seeker,
    Hider,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Seeker, Role::Hider];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Seeker => "seeker",
            Role::Hider => "hider",
        }
    }

    pub fn opponent(&self) -> Role {
        match self {
            Role::Seeker => Role::Hider,
            Role::Hider => Role::Seeker,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per role, used for per-role agents, buffers and configs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerRole<T> {
    pub seeker: T,
    pub hider: T,
}

impl<T> PerRole<T> {
    pub fn new(seeker: T, hider: T) -> Self {
        Self { seeker, hider }
    }

    pub fn get(&self, role: Role) -> &T {
        match role {
            Role::Seeker => &self.seeker,
            Role::Hider => &self.hider,
        }
    }

    pub fn get_mut(&mut self, role: Role) -> &mut T {
        match role {
            Role::Seeker => &mut self.seeker,
            Role::Hider => &mut self.hider,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Role, &T)> {
        [(Role::Seeker, &self.seeker), (Role::Hider, &self.hider)].into_iter()
    }
}

/// Simulated agent body as seen by the learning pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: String,
    pub role: Role,
    pub position: Vec3,
    pub velocity: Vec3,
    /// Heading in radians
    pub yaw: f32,
    /// Look angle in radians, positive is up
    pub pitch: f32,
    pub grounded: bool,
    /// Hider has been found by the seeker
    pub found: bool,
    pub blocks: u32,
    pub can_place: bool,
    pub can_remove: bool,
}

impl AgentState {
    pub fn new(id: impl Into<String>, role: Role, position: Vec3) -> Self {
        Self {
            id: id.into(),
            role,
            position,
            velocity: Vec3::ZERO,
            yaw: 0.0,
            pitch: 0.0,
            grounded: true,
            found: false,
            blocks: 0,
            can_place: false,
            can_remove: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.found
    }
}

/// Extent of the playable area; x in [0, width), z in [0, depth)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldSize {
    pub width: f32,
    pub depth: f32,
    pub height: f32,
}

impl WorldSize {
    pub fn new(width: f32, depth: f32, height: f32) -> Self {
        Self {
            width,
            depth,
            height,
        }
    }

    /// Distances to the -x, +x, -z and +z walls
    pub fn wall_distances(&self, position: &Vec3) -> [f32; 4] {
        [
            position.x,
            self.width - position.x,
            position.z,
            self.depth - position.z,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GamePhase {
    Waiting,
    Hiding,
    Seeking,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GameStatus {
    pub phase: GamePhase,
    pub resolved_count: usize,
    pub total_targets: usize,
    /// Simulated seconds since the episode started
    pub elapsed_time: f32,
    pub time_limit: f32,
}

impl GameStatus {
    pub fn time_remaining_fraction(&self) -> f32 {
        if self.time_limit <= 0.0 {
            return 0.0;
        }
        ((self.time_limit - self.elapsed_time) / self.time_limit).clamp(0.0, 1.0)
    }

    pub fn resolved_fraction(&self) -> f32 {
        if self.total_targets == 0 {
            0.0
        } else {
            self.resolved_count as f32 / self.total_targets as f32
        }
    }

    pub fn all_resolved(&self) -> bool {
        self.total_targets > 0 && self.resolved_count >= self.total_targets
    }

    pub fn time_expired(&self) -> bool {
        self.time_limit > 0.0 && self.elapsed_time >= self.time_limit
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibleAgent {
    pub id: String,
    pub role: Role,
    pub distance: f32,
    /// Unit vector from the observer towards the other agent
    pub direction: Vec3,
    pub position: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RayHit {
    pub hit: bool,
    pub distance: f32,
    pub is_opponent: bool,
    /// Small integer describing what was hit (terrain, obstacle, agent, ...)
    pub category: u8,
}

/// Output of the perception system for one agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisionData {
    pub visible_others: Vec<VisibleAgent>,
    pub rays: Vec<RayHit>,
}

impl VisionData {
    pub fn visible_opponents(&self, role: Role) -> impl Iterator<Item = &VisibleAgent> {
        let opponent = role.opponent();
        self.visible_others.iter().filter(move |o| o.role == opponent)
    }

    pub fn nearest_opponent(&self, role: Role) -> Option<&VisibleAgent> {
        self.visible_opponents(role)
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    TimeLimit,
    AllFound,
    StepCap,
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TerminalReason::TimeLimit => "time_limit",
            TerminalReason::AllFound => "all_found",
            TerminalReason::StepCap => "step_cap",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_distances() {
        let size = WorldSize::new(32.0, 16.0, 8.0);
        let d = size.wall_distances(&Vec3::new(4.0, 0.0, 10.0));
        assert_eq!(d, [4.0, 28.0, 10.0, 6.0]);
    }

    #[test]
    fn test_status_fractions() {
        let status = GameStatus {
            phase: GamePhase::Seeking,
            resolved_count: 1,
            total_targets: 4,
            elapsed_time: 30.0,
            time_limit: 120.0,
        };
        assert!((status.resolved_fraction() - 0.25).abs() < 1e-6);
        assert!((status.time_remaining_fraction() - 0.75).abs() < 1e-6);
        assert!(!status.all_resolved());
        assert!(!status.time_expired());
    }

    #[test]
    fn test_nearest_opponent_filters_role() {
        let vision = VisionData {
            visible_others: vec![
                VisibleAgent {
                    id: "hider_0".into(),
                    role: Role::Hider,
                    distance: 3.0,
                    direction: Vec3::new(1.0, 0.0, 0.0),
                    position: Vec3::ZERO,
                },
                VisibleAgent {
                    id: "hider_1".into(),
                    role: Role::Hider,
                    distance: 2.0,
                    direction: Vec3::new(0.0, 0.0, 1.0),
                    position: Vec3::ZERO,
                },
            ],
            rays: Vec::new(),
        };
        assert_eq!(vision.nearest_opponent(Role::Seeker).unwrap().id, "hider_1");
        assert!(vision.nearest_opponent(Role::Hider).is_none());
    }
}
