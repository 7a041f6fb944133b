use std::{collections::HashMap, sync::Arc};

use tokio::task::JoinSet;

use crate::{
    config::ServerConfig,
    proxy::{AgentProxy, ProxySettings},
};

#[derive(Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub name: String,
    pub team: String,
    password: String,
}

impl AgentIdentity {
    pub fn new(
        name: impl Into<String>,
        team: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            team: team.into(),
            password: password.into(),
        }
    }

    fn password_matches(&self, candidate: &str) -> bool {
        self.password == candidate
    }
}

impl std::fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentIdentity")
            .field("name", &self.name)
            .field("team", &self.team)
            .finish_non_exhaustive()
    }
}

/// Roster of every agent and its proxy. Built once at startup and never
/// mutated afterwards.
pub struct AgentRegistry {
    agents: HashMap<String, Arc<AgentProxy>>,
    teams: Vec<String>,
}

impl AgentRegistry {
    pub fn new(identities: Vec<AgentIdentity>, settings: ProxySettings) -> Self {
        let mut teams: Vec<String> = Vec::new();
        let mut agents = HashMap::with_capacity(identities.len());
        for identity in identities {
            if !teams.contains(&identity.team) {
                teams.push(identity.team.clone());
            }
            agents.insert(
                identity.name.clone(),
                Arc::new(AgentProxy::new(identity, settings.clone())),
            );
        }
        Self { agents, teams }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        let identities = config
            .teams
            .iter()
            .flat_map(|team| {
                team.agents.iter().map(|agent| {
                    AgentIdentity::new(agent.name.clone(), team.name.clone(), agent.password.clone())
                })
            })
            .collect();
        let mut registry = Self::new(identities, ProxySettings::from_config(config));
        registry.teams = config.team_names();
        registry
    }

    /// Returns the agent's proxy when `user` exists and `password` matches.
    pub fn authenticate(&self, user: &str, password: &str) -> Option<Arc<AgentProxy>> {
        self.agents
            .get(user)
            .filter(|proxy| proxy.identity().password_matches(password))
            .cloned()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AgentProxy>> {
        self.agents.get(name)
    }

    pub fn agent_names(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn teams(&self) -> &[String] {
        &self.teams
    }

    pub fn team_members(&self, team: &str) -> Vec<&str> {
        let mut members: Vec<&str> = self
            .agents
            .values()
            .filter(|proxy| proxy.team() == team)
            .map(|proxy| proxy.name())
            .collect();
        members.sort_unstable();
        members
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Closes every proxy concurrently; each one says bye to its agent.
    pub async fn close_all(&self) {
        let mut closing = JoinSet::new();
        for proxy in self.agents.values() {
            let proxy = Arc::clone(proxy);
            closing.spawn(async move { proxy.close().await });
        }
        while let Some(result) = closing.join_next().await {
            if let Err(error) = result {
                tracing::warn!(target = "arena_broker::registry", error = %error, "proxy close task failed");
            }
        }
    }
}
