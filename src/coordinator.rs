use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::task::{self, JoinSet};

use crate::{
    deadline::Deadline,
    protocol::{Action, Message, Percept, RequestAction, SimEnd},
    proxy::AgentProxy,
    registry::AgentRegistry,
};

type RoundMembers = HashMap<task::Id, (String, Arc<AgentProxy>)>;

/// Fans requests out to agent proxies and gathers the answers for one step.
#[derive(Clone)]
pub struct TurnCoordinator {
    registry: Arc<AgentRegistry>,
    agent_timeout: Duration,
}

impl TurnCoordinator {
    pub fn new(registry: Arc<AgentRegistry>, agent_timeout: Duration) -> Self {
        Self {
            registry,
            agent_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Runs one step with a deadline of now + the configured agent timeout.
    pub async fn request_actions(
        &self,
        requests: HashMap<String, RequestAction>,
    ) -> HashMap<String, Action> {
        self.collect_actions(requests, Deadline::after(self.agent_timeout))
            .await
    }

    /// Asks every named agent for an action and waits for all of them.
    ///
    /// Each agent is judged against the same `deadline`; agents that miss it
    /// get a no-action entry. Names without a registered agent are skipped.
    pub async fn collect_actions(
        &self,
        requests: HashMap<String, RequestAction>,
        deadline: Deadline,
    ) -> HashMap<String, Action> {
        let mut round = JoinSet::new();
        let mut members = RoundMembers::with_capacity(requests.len());
        for (name, request) in requests {
            let Some(proxy) = self.registry.get(&name).cloned() else {
                tracing::warn!(target = "arena_broker::coordinator", agent = %name, "no such agent, skipping request");
                continue;
            };
            let requester = Arc::clone(&proxy);
            let handle =
                round.spawn(async move { requester.request_action(request, &deadline).await });
            members.insert(handle.id(), (name, proxy));
        }

        let actions = join_round(round, members).await;

        let missing = actions.values().filter(|action| action.is_no_action()).count();
        tracing::debug!(
            target = "arena_broker::coordinator",
            agents = actions.len(),
            missing,
            "collected actions"
        );
        actions
    }

    pub fn broadcast_initial(&self, percepts: HashMap<String, Percept>) {
        for (name, percept) in percepts {
            self.broadcast(&name, Message::SimStart(percept));
        }
    }

    pub fn broadcast_final(&self, results: HashMap<String, SimEnd>) {
        for (name, result) in results {
            self.broadcast(&name, Message::SimEnd(result));
        }
    }

    /// Says bye to every agent and drops their connections.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }

    fn broadcast(&self, name: &str, message: Message) {
        match self.registry.get(name) {
            Some(proxy) => proxy.send_broadcast(message),
            None => {
                tracing::warn!(target = "arena_broker::coordinator", agent = %name, kind = %message.kind(), "no such agent, dropping broadcast");
            }
        }
    }
}

/// Waits for every request task. A task that fails to join still yields an
/// entry: no action, tagged with the last id its proxy issued.
async fn join_round(
    mut round: JoinSet<Action>,
    mut members: RoundMembers,
) -> HashMap<String, Action> {
    let mut actions = HashMap::with_capacity(members.len());
    while let Some(joined) = round.join_next_with_id().await {
        match joined {
            Ok((id, action)) => {
                if let Some((name, _)) = members.remove(&id) {
                    actions.insert(name, action);
                }
            }
            Err(error) => {
                let Some((name, proxy)) = members.remove(&error.id()) else {
                    continue;
                };
                tracing::error!(target = "arena_broker::coordinator", agent = %name, error = %error, "action request task failed");
                let id = proxy.high_water_mark().unwrap_or_default();
                actions.insert(name, Action::no_action(id));
            }
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc, time::Duration};

    use serde_json::json;
    use tokio::{task::JoinSet, time::Instant};

    use super::{join_round, RoundMembers, TurnCoordinator};
    use crate::{
        deadline::Deadline,
        protocol::{percept, Action, Message, RequestAction, SimEnd},
        proxy::ProxySettings,
        registry::{AgentIdentity, AgentRegistry},
    };

    fn coordinator(names: &[&str]) -> TurnCoordinator {
        let identities = names
            .iter()
            .map(|name| AgentIdentity::new(*name, "A", "1"))
            .collect();
        let registry = AgentRegistry::new(identities, ProxySettings::default());
        TurnCoordinator::new(Arc::new(registry), Duration::from_millis(50))
    }

    fn requests(names: &[&str]) -> HashMap<String, RequestAction> {
        names
            .iter()
            .map(|name| {
                let request = RequestAction::new(percept(json!({"step": 0})).unwrap());
                (name.to_string(), request)
            })
            .collect()
    }

    #[tokio::test]
    async fn silent_agents_get_no_action_within_deadline() {
        let coordinator = coordinator(&["a1", "a2", "a3"]);
        let responder = {
            let proxy = Arc::clone(coordinator.registry().get("a2").unwrap());
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    if proxy.pending_requests() == 1 {
                        let id = proxy.high_water_mark().unwrap();
                        proxy.handle_received(Message::Action(Action::new("move", id, vec!["n".into()])));
                        break;
                    }
                }
            })
        };

        let started = Instant::now();
        let actions = coordinator
            .collect_actions(
                requests(&["a1", "a2", "a3"]),
                Deadline::after(Duration::from_millis(150)),
            )
            .await;
        responder.await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(1_000));
        assert_eq!(actions.len(), 3);
        assert_eq!(actions["a2"].action_type, "move");
        assert!(actions["a1"].is_no_action());
        assert!(actions["a3"].is_no_action());
    }

    #[tokio::test]
    async fn unknown_agents_are_skipped() {
        let coordinator = coordinator(&["a1"]);
        let actions = coordinator.request_actions(requests(&["a1", "ghost"])).await;
        assert_eq!(actions.len(), 1);
        assert!(actions["a1"].is_no_action());
    }

    #[tokio::test]
    async fn broadcasts_queue_per_agent() {
        let coordinator = coordinator(&["a1", "a2"]);
        coordinator.broadcast_initial(HashMap::from([
            ("a1".to_string(), percept(json!({"role": "scout"})).unwrap()),
            ("ghost".to_string(), percept(json!({})).unwrap()),
        ]));
        coordinator.broadcast_final(HashMap::from([("a2".to_string(), SimEnd::new(3, 2))]));

        let registry = coordinator.registry();
        assert_eq!(registry.get("a1").unwrap().queued_len(), 1);
        assert_eq!(registry.get("a2").unwrap().queued_len(), 1);
    }

    #[tokio::test]
    async fn failed_request_task_still_reports_no_action() {
        let coordinator = coordinator(&["a1", "a2"]);
        let registry = coordinator.registry();
        let mut round = JoinSet::new();
        let mut members = RoundMembers::new();

        let answered = round.spawn(async { Action::new("move", 0, vec!["n".into()]) });
        members.insert(
            answered.id(),
            ("a1".to_string(), Arc::clone(registry.get("a1").unwrap())),
        );
        let crashed = round.spawn(async { Option::<Action>::None.expect("request task crashed") });
        members.insert(
            crashed.id(),
            ("a2".to_string(), Arc::clone(registry.get("a2").unwrap())),
        );

        let actions = join_round(round, members).await;
        assert_eq!(actions.len(), 2);
        assert_eq!(actions["a1"].action_type, "move");
        assert!(actions["a2"].is_no_action());
        assert_eq!(actions["a2"].id, 0);
    }
}
