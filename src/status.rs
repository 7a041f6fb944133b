use chrono::Utc;
use parking_lot::RwLock;

use crate::{config::ServerConfig, protocol::StatusResponse};

/// Sentinel for "no simulation running".
pub const NO_SIMULATION: i64 = -1;

/// What the listener reports to `status-request` connections. The simulation
/// engine updates it between matches.
#[derive(Debug)]
pub struct StatusBoard {
    inner: RwLock<StatusInner>,
}

#[derive(Debug, Clone)]
struct StatusInner {
    teams: Vec<String>,
    team_sizes: Vec<u32>,
    current_simulation: i64,
}

impl StatusBoard {
    pub fn new(teams: Vec<String>, team_sizes: Vec<u32>) -> Self {
        Self {
            inner: RwLock::new(StatusInner {
                teams,
                team_sizes,
                current_simulation: NO_SIMULATION,
            }),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.team_names(), config.reported_team_sizes())
    }

    pub fn set_teams(&self, teams: Vec<String>) {
        self.inner.write().teams = teams;
    }

    pub fn set_team_sizes(&self, team_sizes: Vec<u32>) {
        self.inner.write().team_sizes = team_sizes;
    }

    pub fn set_current_simulation(&self, index: i64) {
        self.inner.write().current_simulation = index;
    }

    pub fn clear_current_simulation(&self) {
        self.set_current_simulation(NO_SIMULATION);
    }

    pub fn snapshot(&self) -> StatusResponse {
        let inner = self.inner.read().clone();
        StatusResponse {
            time: Utc::now().timestamp_millis(),
            teams: inner.teams,
            team_sizes: inner.team_sizes,
            current_simulation: inner.current_simulation,
        }
    }
}
