//! RL Environment - episode lifecycle, rewards and observations over the simulation collaborators

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::action_space::MovementCommand;
use super::encoder::{EncoderConfig, StateEncoder};
use super::reward::{EpisodeTracker, Exposure, RewardConfig, RewardShaper, StepContext};
use crate::infra::{AgentState, GamePhase, GameStatus, Role, TerminalReason, World};

/// How terrain seeds are chosen per episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedMode {
    /// Let the terrain provider pick
    Random,
    /// Same terrain every episode
    Fixed(u64),
    /// Cycle through a pool, one seed per episode
    Rotating(Vec<u64>),
}

impl SeedMode {
    pub fn seed_for(&self, episode: usize) -> Option<u64> {
        match self {
            SeedMode::Random => None,
            SeedMode::Fixed(seed) => Some(*seed),
            SeedMode::Rotating(pool) if !pool.is_empty() => Some(pool[episode % pool.len()]),
            SeedMode::Rotating(_) => None,
        }
    }
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Maximum steps per episode
    pub max_steps: usize,
    /// Simulated seconds per step
    pub dt: f32,
    /// Steps between fresh action decisions
    pub decision_interval: usize,
    /// Encoded states per agent fed to the approximator
    pub history_len: usize,
    /// Simulation ticks to wait for the seeking phase before aborting
    pub phase_wait_ticks: usize,
    /// Wall-clock pause between phase polls (0 just yields)
    pub poll_interval_ms: u64,
    pub terrain_wait_polls: usize,
    pub terrain_poll_interval_ms: u64,
    pub seed_mode: SeedMode,
    pub encoder: EncoderConfig,
    pub reward: RewardConfig,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            max_steps: 1500,
            dt: 0.05,
            decision_interval: 4,
            history_len: 5,
            phase_wait_ticks: 2000,
            poll_interval_ms: 0,
            terrain_wait_polls: 100,
            terrain_poll_interval_ms: 50,
            seed_mode: SeedMode::Random,
            encoder: EncoderConfig::default(),
            reward: RewardConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodePhase {
    Reset,
    WaitForActivePhase,
    Stepping,
    Terminal,
}

/// Encoded view of one agent
#[derive(Debug, Clone, PartialEq)]
pub struct AgentObservation {
    pub id: String,
    pub role: Role,
    pub observation: Vec<f32>,
}

/// Outcome of one step for one agent that was active when the step began
#[derive(Debug, Clone, PartialEq)]
pub struct AgentStep {
    pub id: String,
    pub role: Role,
    pub state: Vec<f32>,
    pub next_state: Vec<f32>,
    /// Clipped shaping reward plus any pending one-time bonuses
    pub reward: f32,
    /// Episode over, or this hider was found
    pub done: bool,
    pub command: MovementCommand,
}

/// Step result from the environment
#[derive(Debug, Clone)]
pub struct StepResult {
    pub agents: Vec<AgentStep>,
    pub done: bool,
    pub terminal: Option<TerminalReason>,
    pub steps: usize,
}

/// Hide-and-seek environment driving the collaborator traits
pub struct HideSeekEnv {
    world: World,
    config: EnvConfig,
    encoder: StateEncoder,
    shaper: RewardShaper,
    agents: Vec<AgentState>,
    trackers: BTreeMap<String, EpisodeTracker>,
    pending: HashMap<String, f32>,
    last_observations: HashMap<String, Vec<f32>>,
    phase: EpisodePhase,
    terminal: Option<TerminalReason>,
    episode: usize,
    steps: usize,
}

impl HideSeekEnv {
    pub fn new(world: World, config: EnvConfig) -> Self {
        let encoder = StateEncoder::new(config.encoder.clone());
        let shaper = RewardShaper::new(config.reward.clone());

        Self {
            world,
            config,
            encoder,
            shaper,
            agents: Vec::new(),
            trackers: BTreeMap::new(),
            pending: HashMap::new(),
            last_observations: HashMap::new(),
            phase: EpisodePhase::Reset,
            terminal: None,
            episode: 0,
            steps: 0,
        }
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// Length of one encoded observation
    pub fn state_size(&self) -> usize {
        self.encoder.state_size()
    }

    pub fn phase(&self) -> EpisodePhase {
        self.phase
    }

    pub fn agents(&self) -> &[AgentState] {
        &self.agents
    }

    pub fn episode(&self) -> usize {
        self.episode
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn terminal(&self) -> Option<TerminalReason> {
        self.terminal
    }

    #[cfg(test)]
    pub(crate) fn agents_mut(&mut self) -> &mut [AgentState] {
        &mut self.agents
    }

    pub fn trackers(&self) -> &BTreeMap<String, EpisodeTracker> {
        &self.trackers
    }

    pub fn status(&self) -> GameStatus {
        self.world.session.status()
    }

    /// Start episode `episode` and wait for the seeking phase.
    ///
    /// Returns the initial observations, or `None` when the game never became active.
    pub async fn reset(&mut self, episode: usize) -> Option<Vec<AgentObservation>> {
        self.phase = EpisodePhase::Reset;
        self.episode = episode;
        self.steps = 0;
        self.terminal = None;

        let seed = self.config.seed_mode.seed_for(episode);
        self.world.terrain.regenerate(seed);
        self.wait_for_terrain().await;

        self.agents = self.world.session.spawn_agents();
        self.encoder.reset();
        self.pending.clear();
        self.last_observations.clear();
        self.trackers = self
            .agents
            .iter()
            .map(|a| (a.id.clone(), EpisodeTracker::default()))
            .collect();
        tracing::debug!(episode, ?seed, agents = self.agents.len(), "Environment reset");

        if !self.wait_for_active_phase().await {
            return None;
        }
        self.phase = EpisodePhase::Stepping;
        Some(self.observe())
    }

    /// Bounded readiness poll; proceeds anyway when the budget runs out
    async fn wait_for_terrain(&mut self) {
        for _ in 0..self.config.terrain_wait_polls {
            if self.world.terrain.is_ready() {
                return;
            }
            pause(self.config.terrain_poll_interval_ms).await;
        }
        if !self.world.terrain.is_ready() {
            tracing::warn!("Terrain not ready after {} polls, proceeding", self.config.terrain_wait_polls);
        }
    }

    /// Advance simulated time with idle agents until the seeking phase starts
    pub async fn wait_for_active_phase(&mut self) -> bool {
        self.phase = EpisodePhase::WaitForActivePhase;
        let dt = self.config.dt;

        for _ in 0..self.config.phase_wait_ticks {
            match self.world.session.status().phase {
                GamePhase::Seeking => return true,
                GamePhase::Finished => {
                    tracing::warn!(episode = self.episode, "Game finished before seeking began");
                    return false;
                }
                GamePhase::Waiting | GamePhase::Hiding => {}
            }

            for agent in self.agents.iter_mut() {
                self.world.movement.update_physics(agent, dt);
            }
            self.world.session.update(dt, &mut self.agents);
            pause(self.config.poll_interval_ms).await;
        }

        let ready = self.world.session.status().phase == GamePhase::Seeking;
        if !ready {
            tracing::warn!(
                episode = self.episode,
                "Seeking phase not reached after {} ticks, aborting episode",
                self.config.phase_wait_ticks
            );
        }
        ready
    }

    /// Encode every active agent's current view
    pub fn observe(&mut self) -> Vec<AgentObservation> {
        let status = self.world.session.status();
        let size = self.world.session.world_size();
        let mut observations = Vec::new();

        for agent in self.agents.iter().filter(|a| a.is_active()) {
            let vision = self.world.vision.vision(agent, &self.agents);
            let observation = self.encoder.encode(agent, &status, &vision, &size);
            self.last_observations
                .insert(agent.id.clone(), observation.clone());
            observations.push(AgentObservation {
                id: agent.id.clone(),
                role: agent.role,
                observation,
            });
        }
        observations
    }

    /// Execute one simulation step. Agents missing from `commands` stay idle.
    #[tracing::instrument(level = "trace", skip_all, fields(step = self.steps))]
    pub fn step(&mut self, commands: &HashMap<String, MovementCommand>) -> StepResult {
        let dt = self.config.dt;
        let active: Vec<usize> = (0..self.agents.len())
            .filter(|&i| self.agents[i].is_active())
            .collect();

        let mut executed = Vec::with_capacity(active.len());
        for &i in &active {
            let command = commands.get(&self.agents[i].id).copied().unwrap_or_default();
            let agent = &mut self.agents[i];
            let jump_attempt = command.jump && agent.grounded;

            self.world.movement.execute_action(agent, &command, dt);
            self.world.movement.update_physics(agent, dt);

            if jump_attempt {
                let succeeded = !agent.grounded || agent.velocity.y > 0.0;
                if let Some(tracker) = self.trackers.get_mut(&agent.id) {
                    tracker.record_jump(succeeded);
                }
            }
            executed.push(command);
        }

        let found_before: Vec<bool> = self.agents.iter().map(|a| a.found).collect();
        self.world.session.update(dt, &mut self.agents);
        self.steps += 1;
        let status = self.world.session.status();

        // Captures pay out once, through the pending buffer
        let captures = self
            .agents
            .iter()
            .zip(found_before.iter())
            .filter(|(a, was_found)| a.found && !**was_found)
            .count();
        if captures > 0 {
            for (agent, was_found) in self.agents.iter().zip(found_before.iter()) {
                let bonus = match agent.role {
                    Role::Seeker => self.shaper.capture_reward(Role::Seeker) * captures as f32,
                    Role::Hider if agent.found && !*was_found => {
                        self.shaper.capture_reward(Role::Hider)
                    }
                    Role::Hider => continue,
                };
                *self.pending.entry(agent.id.clone()).or_default() += bonus;
            }
        }

        let terminal = if status.all_resolved() {
            Some(TerminalReason::AllFound)
        } else if status.time_expired() {
            Some(TerminalReason::TimeLimit)
        } else if self.steps >= self.config.max_steps {
            Some(TerminalReason::StepCap)
        } else {
            None
        };

        if let Some(reason) = terminal {
            for &i in &active {
                let agent = &self.agents[i];
                let bonus = self.shaper.terminal_bonus(agent, reason, &status);
                *self.pending.entry(agent.id.clone()).or_default() += bonus;
            }
            self.world.session.end_episode(reason);
            self.terminal = Some(reason);
            self.phase = EpisodePhase::Terminal;
            tracing::debug!(episode = self.episode, steps = self.steps, %reason, "Episode terminal");
        }

        let size = self.world.session.world_size();
        let visions: Vec<_> = active
            .iter()
            .map(|&i| self.world.vision.vision(&self.agents[i], &self.agents))
            .collect();

        let mut agents = Vec::with_capacity(active.len());
        for ((&i, command), vision) in active.iter().zip(executed).zip(&visions) {
            let agent = &self.agents[i];
            let exposure = Exposure::of(
                agent,
                active.iter().map(|&j| &self.agents[j]).zip(&visions),
            );
            let speed = self.world.movement.speed(agent);
            let tracker = self.trackers.entry(agent.id.clone()).or_default();

            let shaped = self.shaper.step_reward(
                &StepContext {
                    agent,
                    vision,
                    exposure,
                    world: &size,
                    speed,
                    dt,
                },
                tracker,
            );
            let bonus = self.pending.remove(&agent.id).unwrap_or(0.0);
            tracker.reward_total += bonus;

            let next_state = self.encoder.encode(agent, &status, vision, &size);
            let state = self
                .last_observations
                .insert(agent.id.clone(), next_state.clone())
                .unwrap_or_else(|| next_state.clone());

            agents.push(AgentStep {
                id: agent.id.clone(),
                role: agent.role,
                state,
                next_state,
                reward: shaped + bonus,
                done: terminal.is_some() || agent.found,
                command,
            });
        }

        StepResult {
            agents,
            done: terminal.is_some(),
            terminal,
            steps: self.steps,
        }
    }
}

async fn pause(interval_ms: u64) {
    if interval_ms == 0 {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ArenaConfig, arena_world};

    fn env(arena: ArenaConfig, max_steps: usize) -> HideSeekEnv {
        HideSeekEnv::new(
            arena_world(arena),
            EnvConfig {
                max_steps,
                terrain_poll_interval_ms: 0,
                ..EnvConfig::default()
            },
        )
    }

    #[test]
    fn test_seed_modes() {
        assert_eq!(SeedMode::Random.seed_for(3), None);
        assert_eq!(SeedMode::Fixed(9).seed_for(3), Some(9));
        assert_eq!(SeedMode::Rotating(vec![1, 2, 3]).seed_for(4), Some(2));
        assert_eq!(SeedMode::Rotating(vec![]).seed_for(4), None);
    }

    #[tokio::test]
    async fn test_reset_reaches_seeking_phase() {
        let mut env = env(ArenaConfig::default(), 50);
        let observations = env.reset(0).await.expect("episode should start");
        assert_eq!(env.phase(), EpisodePhase::Stepping);
        assert_eq!(observations.len(), env.agents().len());
        assert!(observations
            .iter()
            .all(|o| o.observation.len() == env.state_size()));
    }

    #[tokio::test]
    async fn test_wait_budget_aborts_episode() {
        let arena = ArenaConfig {
            hiding_time: 100.0,
            ..ArenaConfig::default()
        };
        let mut env = HideSeekEnv::new(
            arena_world(arena),
            EnvConfig {
                phase_wait_ticks: 10,
                terrain_poll_interval_ms: 0,
                ..EnvConfig::default()
            },
        );
        assert!(env.reset(0).await.is_none());
        assert_eq!(env.phase(), EpisodePhase::WaitForActivePhase);
    }

    #[tokio::test]
    async fn test_step_cap_is_terminal() {
        let arena = ArenaConfig {
            capture_radius: 0.0,
            ..ArenaConfig::default()
        };
        let mut env = env(arena, 5);
        env.reset(0).await.unwrap();

        let idle = HashMap::new();
        for i in 1..5 {
            let result = env.step(&idle);
            assert!(!result.done);
            assert_eq!(result.steps, i);
        }
        let last = env.step(&idle);
        assert!(last.done);
        assert_eq!(last.terminal, Some(TerminalReason::StepCap));
        assert_eq!(env.phase(), EpisodePhase::Terminal);
        assert!(last.agents.iter().all(|a| a.done));
    }

    #[tokio::test]
    async fn test_step_rewards_and_states_are_consistent() {
        let arena = ArenaConfig {
            capture_radius: 0.0,
            ..ArenaConfig::default()
        };
        let mut env = env(arena, 100);
        let initial = env.reset(1).await.unwrap();
        let clip = env.config().reward.clip_max;
        let forward = MovementCommand {
            movement_forward: 1.0,
            ..MovementCommand::default()
        };
        let commands: HashMap<String, MovementCommand> = initial
            .iter()
            .map(|o| (o.id.clone(), forward))
            .collect();

        let first = env.step(&commands);
        for (step, obs) in first.agents.iter().zip(initial.iter()) {
            assert_eq!(step.id, obs.id);
            assert_eq!(step.state, obs.observation);
            assert!(step.reward.is_finite());
            assert!(step.reward <= clip + 1e-6);
        }
        let second = env.step(&commands);
        for (a, b) in first.agents.iter().zip(second.agents.iter()) {
            assert_eq!(a.next_state, b.state);
        }
        assert!(env.trackers().values().any(|t| t.distance_traveled > 0.0));
    }

    #[tokio::test]
    async fn test_hider_penalty_follows_seeker_view() {
        // Seeker at x=16, hider at x=22; yaw 0 faces +x
        async fn hider_reward(seeker_yaw: f32, hider_yaw: f32) -> f32 {
            let arena = ArenaConfig {
                num_hiders: 1,
                num_pillars: 0,
                capture_radius: 0.0,
                hiding_time: 0.1,
                seed: Some(5),
                ..ArenaConfig::default()
            };
            let mut env = env(arena, 100);
            env.reset(0).await.unwrap();
            for agent in env.agents_mut() {
                let (x, yaw) = match agent.role {
                    Role::Seeker => (16.0, seeker_yaw),
                    Role::Hider => (22.0, hider_yaw),
                };
                agent.position.x = x;
                agent.position.z = 20.0;
                agent.yaw = yaw;
            }

            let result = env.step(&HashMap::new());
            result
                .agents
                .iter()
                .find(|a| a.role == Role::Hider)
                .map(|a| a.reward)
                .unwrap()
        }

        let pi = std::f32::consts::PI;
        let watched = hider_reward(0.0, 0.0).await;
        let watching = hider_reward(pi, pi).await;
        assert!(watched < watching, "watched {} vs watching {}", watched, watching);
    }
}
