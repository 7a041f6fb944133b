use std::{collections::HashSet, fs, path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 12300;

/// Server settings, usually read from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub agent_timeout_ms: u64,
    pub max_packet_length: usize,
    pub send_buffer_size: usize,
    pub bye_grace_ms: u64,
    pub handshake_timeout_ms: u64,
    pub log_level: String,
    pub teams: Vec<TeamConfig>,
    pub team_sizes: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamConfig {
    pub name: String,
    #[serde(default)]
    pub agents: Vec<AgentCredentials>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCredentials {
    pub name: String,
    pub password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            backlog: 10_000,
            agent_timeout_ms: 4_000,
            max_packet_length: 65_536,
            send_buffer_size: 4,
            bye_grace_ms: 5_000,
            handshake_timeout_ms: 5_000,
            log_level: "info".to_string(),
            teams: Vec::new(),
            team_sizes: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.send_buffer_size == 0 {
            bail!("sendBufferSize must be at least 1");
        }
        if self.max_packet_length == 0 {
            bail!("maxPacketLength must be at least 1");
        }
        let mut teams = HashSet::new();
        let mut agents = HashSet::new();
        for team in &self.teams {
            if team.name.trim().is_empty() {
                bail!("team names must not be empty");
            }
            if !teams.insert(team.name.as_str()) {
                bail!("team {} is configured twice", team.name);
            }
            for agent in &team.agents {
                if !agents.insert(agent.name.as_str()) {
                    bail!("agent {} is configured more than once", agent.name);
                }
            }
        }
        Ok(())
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn bye_grace(&self) -> Duration {
        Duration::from_millis(self.bye_grace_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn team_names(&self) -> Vec<String> {
        self.teams.iter().map(|team| team.name.clone()).collect()
    }

    /// Sizes reported to status queries. Falls back to the roster when no
    /// explicit sizes are configured.
    pub fn reported_team_sizes(&self) -> Vec<u32> {
        if !self.team_sizes.is_empty() {
            return self.team_sizes.clone();
        }
        self.teams
            .iter()
            .map(|team| team.agents.len() as u32)
            .collect()
    }
}
