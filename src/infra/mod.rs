mod bridge;
mod default_observer;
mod episode_observer;
mod types;
mod world;

pub use bridge::{
    AgentReport, BridgeError, BridgeRequest, BridgeResponse, BridgeServer, BridgeSession,
    parse_request,
};
pub use default_observer::DefaultObserver;
pub use episode_observer::EpisodeObserver;
pub use types::{
    AgentState, GamePhase, GameStatus, PerRole, RayHit, Role, TerminalReason, Vec3, VisibleAgent,
    VisionData, WorldSize,
};
pub use world::{GameSession, MovementExecutor, TerrainProvider, VisionProvider, World};
