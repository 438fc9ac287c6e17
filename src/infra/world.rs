//! Contracts of the simulation collaborators the learning pipeline drives

use super::types::{AgentState, GameStatus, TerminalReason, VisionData, WorldSize};
use crate::rl::action_space::MovementCommand;

/// Perception: turns the scene into visible agents and a ray summary
pub trait VisionProvider: Send {
    fn vision(&self, agent: &AgentState, all_agents: &[AgentState]) -> VisionData;
}

/// Movement and physics integration
pub trait MovementExecutor: Send {
    /// Apply a control command for `dt` simulated seconds
    fn execute_action(&mut self, agent: &mut AgentState, command: &MovementCommand, dt: f32);

    /// Integrate velocity, gravity and collisions
    fn update_physics(&mut self, agent: &mut AgentState, dt: f32);

    /// Current horizontal speed
    fn speed(&self, agent: &AgentState) -> f32;
}

/// Game rules, phases and the simulated clock
pub trait GameSession: Send {
    fn status(&self) -> GameStatus;

    /// Advance the clock by `dt`; may mark hiders as found
    fn update(&mut self, dt: f32, agents: &mut [AgentState]);

    fn end_episode(&mut self, reason: TerminalReason);

    /// Restart the clock and place a fresh set of agents
    fn spawn_agents(&mut self) -> Vec<AgentState>;

    fn world_size(&self) -> WorldSize;
}

/// Terrain generation and chunk readiness
pub trait TerrainProvider: Send {
    fn regenerate(&mut self, seed: Option<u64>);

    fn is_ready(&self) -> bool;
}

/// The full set of collaborators behind one environment
pub struct World {
    pub vision: Box<dyn VisionProvider>,
    pub movement: Box<dyn MovementExecutor>,
    pub session: Box<dyn GameSession>,
    pub terrain: Box<dyn TerrainProvider>,
}

impl World {
    pub fn new(
        vision: impl VisionProvider + 'static,
        movement: impl MovementExecutor + 'static,
        session: impl GameSession + 'static,
        terrain: impl TerrainProvider + 'static,
    ) -> Self {
        Self {
            vision: Box::new(vision),
            movement: Box::new(movement),
            session: Box::new(session),
            terrain: Box::new(terrain),
        }
    }
}
