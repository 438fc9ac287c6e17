//! JSON-over-WebSocket bridge serving the reset/step protocol to an out-of-process trainer

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use super::types::Role;
use crate::rl::action_space::MovementCommand;
use crate::rl::env::{EpisodePhase, HideSeekEnv};

#[derive(Debug)]
pub enum BridgeError {
    Io(std::io::Error),
    WebSocket(tokio_tungstenite::tungstenite::Error),
    Json(serde_json::Error),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BridgeError::Io(e) => write!(formatter, "Bridge I/O error: {}", e),
            BridgeError::WebSocket(e) => write!(formatter, "WebSocket error: {}", e),
            BridgeError::Json(e) => write!(formatter, "JSON error: {}", e),
        }
    }
}

impl Error for BridgeError {}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Io(e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        BridgeError::WebSocket(e)
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Json(e)
    }
}

/// Requests sent by the trainer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BridgeRequest {
    Reset {
        #[serde(default)]
        episode: usize,
    },
    Step {
        #[serde(default)]
        actions: HashMap<String, MovementCommand>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReport {
    pub id: String,
    pub role: Role,
    pub observation: Vec<f32>,
    pub reward: f32,
    pub done: bool,
}

/// Replies sent back to the trainer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BridgeResponse {
    Observation {
        agents: Vec<AgentReport>,
        episode_done: bool,
        episode: usize,
    },
}

/// Parse a raw text frame. Unknown types and malformed JSON are logged and yield `None`.
pub fn parse_request(text: &str) -> Option<BridgeRequest> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Malformed bridge message: {}", e);
            return None;
        }
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("reset") | Some("step") => {}
        other => {
            tracing::warn!("Unknown bridge message type: {:?}", other);
            return None;
        }
    }

    match serde_json::from_value(value) {
        Ok(request) => Some(request),
        Err(e) => {
            tracing::warn!("Invalid bridge request: {}", e);
            None
        }
    }
}

/// Drives one environment on behalf of a remote trainer
pub struct BridgeSession {
    env: HideSeekEnv,
}

impl BridgeSession {
    pub fn new(env: HideSeekEnv) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &HideSeekEnv {
        &self.env
    }

    pub async fn handle(&mut self, request: BridgeRequest) -> BridgeResponse {
        match request {
            BridgeRequest::Reset { episode } => self.reset(episode).await,
            BridgeRequest::Step { actions } => self.step(&actions),
        }
    }

    /// Text frame in, optional text frame out
    pub async fn handle_text(&mut self, text: &str) -> Option<String> {
        let request = parse_request(text)?;
        let response = self.handle(request).await;
        match serde_json::to_string(&response) {
            Ok(reply) => Some(reply),
            Err(e) => {
                tracing::error!("Failed to encode bridge response: {}", e);
                None
            }
        }
    }

    async fn reset(&mut self, episode: usize) -> BridgeResponse {
        match self.env.reset(episode).await {
            Some(observations) => BridgeResponse::Observation {
                agents: observations
                    .into_iter()
                    .map(|o| AgentReport {
                        id: o.id,
                        role: o.role,
                        observation: o.observation,
                        reward: 0.0,
                        done: false,
                    })
                    .collect(),
                episode_done: false,
                episode,
            },
            None => {
                tracing::warn!(episode, "Bridge reset did not reach the seeking phase");
                self.finished()
            }
        }
    }

    fn step(&mut self, actions: &HashMap<String, MovementCommand>) -> BridgeResponse {
        if self.env.phase() != EpisodePhase::Stepping {
            tracing::debug!(phase = ?self.env.phase(), "Step received outside an active episode");
            return self.finished();
        }

        let result = self.env.step(actions);
        BridgeResponse::Observation {
            agents: result
                .agents
                .into_iter()
                .map(|a| AgentReport {
                    id: a.id,
                    role: a.role,
                    observation: a.next_state,
                    reward: a.reward,
                    done: a.done,
                })
                .collect(),
            episode_done: result.done,
            episode: self.env.episode(),
        }
    }

    fn finished(&self) -> BridgeResponse {
        BridgeResponse::Observation {
            agents: Vec::new(),
            episode_done: true,
            episode: self.env.episode(),
        }
    }
}

/// WebSocket server; clients are served one at a time against the same environment
pub struct BridgeServer {
    listener: TcpListener,
    session: BridgeSession,
}

impl BridgeServer {
    pub async fn bind(addr: impl ToSocketAddrs, env: HideSeekEnv) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            session: BridgeSession::new(env),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(mut self) -> Result<(), BridgeError> {
        tracing::info!("Bridge listening on {}", self.local_addr()?);
        loop {
            let (stream, peer) = self.listener.accept().await?;
            tracing::info!("Trainer connected from {}", peer);
            if let Err(e) = self.serve_connection(stream).await {
                tracing::warn!("Trainer connection from {} ended: {}", peer, e);
            } else {
                tracing::info!("Trainer {} disconnected", peer);
            }
        }
    }

    async fn serve_connection(&mut self, stream: tokio::net::TcpStream) -> Result<(), BridgeError> {
        let ws = accept_async(stream).await?;
        let (mut writer, mut reader) = ws.split();

        while let Some(message) = reader.next().await {
            match message? {
                Message::Text(text) => {
                    if let Some(reply) = self.session.handle_text(&text).await {
                        writer.send(Message::Text(reply)).await?;
                    }
                }
                Message::Close(_) => break,
                Message::Ping(payload) => writer.send(Message::Pong(payload)).await?,
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rl::env::EnvConfig;
    use crate::sim::{ArenaConfig, arena_world};
    use tokio_tungstenite::connect_async;

    fn env() -> HideSeekEnv {
        let arena = ArenaConfig {
            hiding_time: 0.1,
            capture_radius: 0.0,
            seed: Some(11),
            ..ArenaConfig::default()
        };
        HideSeekEnv::new(
            arena_world(arena),
            EnvConfig {
                max_steps: 3,
                terrain_poll_interval_ms: 0,
                ..EnvConfig::default()
            },
        )
    }

    #[test]
    fn test_parse_request() {
        assert_eq!(
            parse_request(r#"{"type": "reset", "episode": 4}"#),
            Some(BridgeRequest::Reset { episode: 4 })
        );

        let step = parse_request(
            r#"{"type": "step", "actions": {"seeker_0": {"movement_forward": 1.0, "jump": true}}}"#,
        );
        let Some(BridgeRequest::Step { actions }) = step else {
            panic!("expected a step request");
        };
        let command = actions["seeker_0"];
        assert_eq!(command.movement_forward, 1.0);
        assert!(command.jump);
        assert!(!command.place_block);

        assert_eq!(parse_request("{not json"), None);
        assert_eq!(parse_request(r#"{"type": "ping"}"#), None);
        assert_eq!(parse_request(r#"{"episode": 1}"#), None);
    }

    #[tokio::test]
    async fn test_session_reset_and_step() {
        let mut session = BridgeSession::new(env());

        let BridgeResponse::Observation {
            agents,
            episode_done,
            ..
        } = session.handle(BridgeRequest::Step {
            actions: HashMap::new(),
        })
        .await;
        assert!(agents.is_empty());
        assert!(episode_done);

        let BridgeResponse::Observation {
            agents,
            episode_done,
            episode,
        } = session.handle(BridgeRequest::Reset { episode: 2 }).await;
        assert_eq!(episode, 2);
        assert!(!episode_done);
        assert_eq!(agents.len(), 3);
        let size = session.env().state_size();
        assert!(agents.iter().all(|a| a.observation.len() == size));

        let mut done = false;
        for _ in 0..3 {
            let BridgeResponse::Observation { episode_done, .. } = session
                .handle(BridgeRequest::Step {
                    actions: HashMap::new(),
                })
                .await;
            done = episode_done;
        }
        assert!(done);
    }

    #[tokio::test]
    async fn test_websocket_round_trip() {
        let server = BridgeServer::bind("127.0.0.1:0", env()).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        ws.send(Message::Text("garbage".into())).await.unwrap();
        ws.send(Message::Text(r#"{"type": "reset", "episode": 1}"#.into()))
            .await
            .unwrap();

        let reply = loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => break text,
                _ => continue,
            }
        };
        let response: BridgeResponse = serde_json::from_str(&reply).unwrap();
        let BridgeResponse::Observation { agents, episode, .. } = response;
        assert_eq!(episode, 1);
        assert_eq!(agents.len(), 3);
        assert!(reply.contains(r#""type":"observation""#));
    }
}
