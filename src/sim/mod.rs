//! Sandbox simulation used for local training, demos and tests

mod arena;

pub use arena::{
    ArenaConfig, ArenaLayout, ArenaMovement, ArenaSession, ArenaTerrain, ArenaVision, Obstacle,
    arena_world,
};
