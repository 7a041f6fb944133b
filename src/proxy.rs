//! Server-side handle for one agent.
//!
//! An [`AgentProxy`] lives for the whole process. Each accepted socket becomes
//! a session with its own generation number, one reader task and one writer
//! task. Replacing the socket cancels and awaits the previous pair first, and
//! a failing task only tears down the generation it was started for, so a
//! stale task can never close a newer connection.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{oneshot, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ServerConfig,
    deadline::Deadline,
    framing::{write_frame, FrameReader},
    outbox::Outbox,
    protocol::{self, Action, Bye, Message, RequestAction},
    registry::AgentIdentity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub queue_bound: usize,
    pub max_frame_len: usize,
    pub bye_grace: Duration,
}

impl ProxySettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            queue_bound: config.send_buffer_size,
            max_frame_len: config.max_packet_length,
            bye_grace: config.bye_grace(),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("agent {0} has been shut down")]
    Terminated(String),
}

type PendingTable = Mutex<HashMap<u64, oneshot::Sender<Action>>>;

struct Session {
    generation: u64,
    peer: Option<SocketAddr>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    async fn stop(self) {
        self.cancel.cancel();
        self.reader.abort();
        self.writer.abort();
        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}

/// Removes a pending request when the waiting call finishes or is dropped.
struct PendingSlot<'a> {
    pending: &'a PendingTable,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

pub struct AgentProxy {
    identity: AgentIdentity,
    settings: ProxySettings,
    next_id: AtomicU64,
    pending: PendingTable,
    outbox: Outbox<Message>,
    replay: Mutex<Option<Message>>,
    session: Mutex<Option<Session>>,
    generations: AtomicU64,
    handover: tokio::sync::Mutex<()>,
    state: watch::Sender<ConnectionState>,
    terminated: AtomicBool,
}

impl AgentProxy {
    pub fn new(identity: AgentIdentity, settings: ProxySettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            identity,
            outbox: Outbox::new(settings.queue_bound),
            settings,
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            replay: Mutex::new(None),
            session: Mutex::new(None),
            generations: AtomicU64::new(0),
            handover: tokio::sync::Mutex::new(()),
            state,
            terminated: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn team(&self) -> &str {
        &self.identity.team
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Generation of the live session, or `None` while disconnected.
    pub fn generation(&self) -> Option<u64> {
        self.session.lock().as_ref().map(|session| session.generation)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.session.lock().as_ref().and_then(|session| session.peer)
    }

    pub fn queued_len(&self) -> usize {
        self.outbox.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Last correlation id handed out, `None` before the first request.
    pub fn high_water_mark(&self) -> Option<u64> {
        self.next_id.load(Ordering::SeqCst).checked_sub(1)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Installs `stream` as the agent's connection, replacing any previous one.
    ///
    /// `buffered` holds bytes the handshake already read past the auth frame.
    pub async fn handle_new_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        buffered: Vec<u8>,
    ) -> Result<(), ProxyError> {
        let _handover = self.handover.lock().await;
        if self.is_terminated() {
            return Err(ProxyError::Terminated(self.name().to_string()));
        }

        self.state.send_replace(ConnectionState::Connecting);
        let previous = self.session.lock().take();
        if let Some(previous) = previous {
            tracing::info!(
                target = "arena_broker::proxy",
                agent = %self.name(),
                generation = previous.generation,
                "replacing existing connection"
            );
            previous.stop().await;
        }

        self.outbox.clear();
        let replay = self.replay.lock().clone();
        if let Some(initial) = replay {
            self.outbox.push_front(initial);
        }

        let peer = stream.peer_addr().ok();
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let (read_half, write_half) = stream.into_split();
        let frames = FrameReader::with_buffered(read_half, self.settings.max_frame_len, buffered);
        let cancel = CancellationToken::new();

        // Held while spawning so a task that fails immediately cannot observe
        // the slot before this session is installed.
        let mut slot = self.session.lock();
        let reader = tokio::spawn(Arc::clone(self).read_loop(generation, frames, cancel.clone()));
        let writer =
            tokio::spawn(Arc::clone(self).write_loop(generation, write_half, cancel.clone()));
        *slot = Some(Session {
            generation,
            peer,
            cancel,
            reader,
            writer,
        });
        self.state.send_replace(ConnectionState::Connected);
        drop(slot);

        tracing::info!(
            target = "arena_broker::proxy",
            agent = %self.name(),
            generation,
            peer = ?peer,
            "agent connected"
        );
        Ok(())
    }

    /// Routes one inbound message. Only actions matter; an action whose id is
    /// no longer pending was answered too late and is dropped.
    pub fn handle_received(&self, message: Message) {
        match message {
            Message::Action(action) => {
                let waiter = self.pending.lock().remove(&action.id);
                match waiter {
                    Some(waiter) => {
                        let id = action.id;
                        if waiter.send(action).is_err() {
                            tracing::debug!(target = "arena_broker::proxy", agent = %self.name(), id, "requester already gone");
                        }
                    }
                    None => {
                        tracing::debug!(
                            target = "arena_broker::proxy",
                            agent = %self.name(),
                            id = action.id,
                            "discarding late or unknown action"
                        );
                    }
                }
            }
            other => {
                tracing::warn!(
                    target = "arena_broker::proxy",
                    agent = %self.name(),
                    kind = %other.kind(),
                    "unexpected message from agent"
                );
            }
        }
    }

    /// Sends `request` and waits for the matching action until `deadline`.
    ///
    /// Never fails: a timeout or a vanished waiter yields
    /// [`Action::no_action`] tagged with the id that was issued.
    pub async fn request_action(&self, mut request: RequestAction, deadline: &Deadline) -> Action {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        request.id = id;
        request.deadline = deadline.epoch_ms();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };
        self.enqueue(Message::RequestAction(request));

        match tokio::time::timeout_at(deadline.instant(), rx).await {
            Ok(Ok(action)) => action,
            Ok(Err(_)) => Action::no_action(id),
            Err(_) => {
                tracing::debug!(target = "arena_broker::proxy", agent = %self.name(), id, "no action before deadline");
                Action::no_action(id)
            }
        }
    }

    /// Queues a one-way message. `sim-start` is kept for replay on
    /// reconnection until the matching `sim-end` goes out.
    pub fn send_broadcast(&self, message: Message) {
        match &message {
            Message::SimStart(_) => *self.replay.lock() = Some(message.clone()),
            Message::SimEnd(_) => *self.replay.lock() = None,
            _ => {}
        }
        self.enqueue(message);
    }

    /// Says bye, gives the writer `bye_grace` to flush, then drops the socket.
    /// The proxy refuses new connections afterwards.
    pub async fn close(&self) {
        let _handover = self.handover.lock().await;
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        self.enqueue(Message::Bye(Bye {}));
        self.outbox.begin_drain();

        let session = self.session.lock().take();
        if let Some(session) = session {
            let Session {
                generation,
                cancel,
                reader,
                mut writer,
                ..
            } = session;
            let flushed =
                tokio::time::timeout(self.settings.bye_grace, &mut writer).await.is_ok();
            if !flushed {
                tracing::warn!(
                    target = "arena_broker::proxy",
                    agent = %self.name(),
                    generation,
                    "outbound queue not drained before close"
                );
            }
            cancel.cancel();
            reader.abort();
            let _ = reader.await;
            if !flushed {
                writer.abort();
                let _ = writer.await;
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        tracing::info!(target = "arena_broker::proxy", agent = %self.name(), "agent closed");
    }

    fn enqueue(&self, message: Message) {
        if let Some(dropped) = self.outbox.push(message) {
            tracing::debug!(
                target = "arena_broker::proxy",
                agent = %self.name(),
                kind = %dropped.kind(),
                "outbound queue full, dropped oldest message"
            );
        }
    }

    /// Tears down `generation` if it is still the live session.
    fn connection_lost(&self, generation: u64, error: &io::Error) {
        let mut slot = self.session.lock();
        if slot.as_ref().map(|session| session.generation) != Some(generation) {
            return;
        }
        if let Some(session) = slot.take() {
            session.cancel.cancel();
        }
        self.state.send_replace(ConnectionState::Disconnected);
        drop(slot);

        tracing::info!(
            target = "arena_broker::proxy",
            agent = %self.name(),
            generation,
            error = %error,
            "agent disconnected"
        );
    }

    async fn read_loop(
        self: Arc<Self>,
        generation: u64,
        mut frames: FrameReader<OwnedReadHalf>,
        cancel: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return,
                frame = frames.next_frame() => frame,
            };
            match frame {
                Ok(bytes) => match protocol::decode(&bytes) {
                    Ok(message) => self.handle_received(message),
                    Err(error) => {
                        tracing::warn!(
                            target = "arena_broker::proxy",
                            agent = %self.name(),
                            error = %error,
                            "dropping undecodable message"
                        );
                    }
                },
                Err(error) => {
                    self.connection_lost(generation, &error);
                    return;
                }
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        generation: u64,
        mut writer: OwnedWriteHalf,
        cancel: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = self.outbox.pop() => next,
            };
            let Some(message) = next else {
                let _ = writer.shutdown().await;
                return;
            };
            let frame = match protocol::encode(&message) {
                Ok(frame) => frame,
                Err(error) => {
                    tracing::warn!(target = "arena_broker::proxy", agent = %self.name(), error = %error, "failed to encode message");
                    continue;
                }
            };
            let written = tokio::select! {
                _ = cancel.cancelled() => return,
                written = write_frame(&mut writer, &frame) => written,
            };
            if let Err(error) = written {
                self.connection_lost(generation, &error);
                return;
            }
            tracing::trace!(target = "arena_broker::proxy", agent = %self.name(), kind = %message.kind(), "sent message");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use serde_json::json;
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::protocol::{encode, percept, Percept, SimEnd};

    fn proxy(queue_bound: usize) -> Arc<AgentProxy> {
        Arc::new(AgentProxy::new(
            AgentIdentity::new("agentA1", "A", "1"),
            ProxySettings {
                queue_bound,
                max_frame_len: 4096,
                bye_grace: Duration::from_millis(500),
            },
        ))
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, client.unwrap())
    }

    async fn read_message(frames: &mut FrameReader<TcpStream>) -> Message {
        let frame = tokio::time::timeout(Duration::from_secs(2), frames.next_frame())
            .await
            .expect("timed out waiting for frame")
            .unwrap();
        protocol::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn issues_monotonic_ids_and_times_out() {
        let proxy = proxy(4);
        assert_eq!(proxy.high_water_mark(), None);

        let first = proxy
            .request_action(
                RequestAction::new(Percept::new()),
                &Deadline::after(Duration::from_millis(10)),
            )
            .await;
        let second = proxy
            .request_action(
                RequestAction::new(Percept::new()),
                &Deadline::after(Duration::from_millis(10)),
            )
            .await;

        assert!(first.is_no_action());
        assert!(second.is_no_action());
        assert_eq!((first.id, second.id), (0, 1));
        assert_eq!(proxy.high_water_mark(), Some(1));
        assert_eq!(proxy.pending_requests(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_get_distinct_ids() {
        let proxy = proxy(4);
        let deadline = Deadline::after(Duration::from_millis(200));
        let a = proxy.request_action(RequestAction::new(Percept::new()), &deadline);
        let b = proxy.request_action(RequestAction::new(Percept::new()), &deadline);
        let answer = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(proxy.pending_requests(), 2);
            proxy.handle_received(Message::Action(Action::new("move", 1, vec!["e".into()])));
        };
        let (a, b, ()) = tokio::join!(a, b, answer);
        assert!(a.is_no_action());
        assert_eq!(a.id, 0);
        assert_eq!(b, Action::new("move", 1, vec!["e".into()]));
    }

    #[tokio::test]
    async fn late_action_is_ignored() {
        let proxy = proxy(4);
        let result = proxy
            .request_action(
                RequestAction::new(Percept::new()),
                &Deadline::after(Duration::from_millis(5)),
            )
            .await;
        assert!(result.is_no_action());

        proxy.handle_received(Message::Action(Action::new("move", result.id, Vec::new())));
        proxy.handle_received(Message::Action(Action::new("move", 99, Vec::new())));
        assert_eq!(proxy.pending_requests(), 0);
        assert_eq!(proxy.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn stalled_queue_keeps_newest_messages() {
        let proxy = proxy(3);
        for step in 0..10 {
            let start = percept(json!({ "step": step })).unwrap();
            proxy.send_broadcast(Message::SimStart(start));
        }
        assert_eq!(proxy.queued_len(), 3);

        let (server, client) = socket_pair().await;
        proxy.handle_new_connection(server, Vec::new()).await.unwrap();
        let mut frames = FrameReader::new(client, 4096);
        // Reconnection resets the queue to the last sim-start only.
        assert_eq!(
            read_message(&mut frames).await,
            Message::SimStart(percept(json!({ "step": 9 })).unwrap())
        );
    }

    #[tokio::test]
    async fn delivers_request_and_resolves_answer() {
        let proxy = proxy(4);
        let (server, mut client) = socket_pair().await;
        proxy.handle_new_connection(server, Vec::new()).await.unwrap();
        assert_eq!(proxy.state(), ConnectionState::Connected);
        assert_eq!(proxy.generation(), Some(1));

        let requester = {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move {
                proxy
                    .request_action(
                        RequestAction::new(percept(json!({"step": 1})).unwrap()),
                        &Deadline::after(Duration::from_secs(2)),
                    )
                    .await
            })
        };

        let (read_half, mut write_half) = client.split();
        let mut frames = FrameReader::new(read_half, 4096);
        let frame = frames.next_frame().await.unwrap();
        let Message::RequestAction(request) = protocol::decode(&frame).unwrap() else {
            panic!("expected request-action");
        };
        assert_eq!(request.percept, percept(json!({"step": 1})).unwrap());
        assert!(request.deadline > 0);

        let reply = encode(&Message::Action(Action::new("skip", request.id, Vec::new()))).unwrap();
        write_frame(&mut write_half, &reply).await.unwrap();

        let action = requester.await.unwrap();
        assert_eq!(action, Action::new("skip", request.id, Vec::new()));
    }

    #[tokio::test]
    async fn sim_end_clears_replay() {
        let proxy = proxy(4);
        proxy.send_broadcast(Message::SimStart(percept(json!({"map": "a"})).unwrap()));
        proxy.send_broadcast(Message::SimEnd(SimEnd::new(10, 1)));

        let (server, client) = socket_pair().await;
        proxy.handle_new_connection(server, Vec::new()).await.unwrap();
        assert_eq!(proxy.queued_len(), 0);
        drop(client);
    }

    #[tokio::test]
    async fn peer_disconnect_marks_proxy_disconnected() {
        let proxy = proxy(4);
        let mut state = proxy.subscribe_state();
        let (server, client) = socket_pair().await;
        proxy.handle_new_connection(server, Vec::new()).await.unwrap();
        drop(client);

        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|state| *state == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(proxy.generation(), None);
    }

    #[tokio::test]
    async fn close_sends_bye_and_refuses_reconnect() {
        let proxy = proxy(4);
        let (server, client) = socket_pair().await;
        proxy.handle_new_connection(server, Vec::new()).await.unwrap();
        let mut frames = FrameReader::new(client, 4096);

        proxy.close().await;
        assert_eq!(read_message(&mut frames).await, Message::Bye(Bye {}));
        assert!(frames.next_frame().await.is_err());
        assert_eq!(proxy.state(), ConnectionState::Disconnected);

        let (server, _client) = socket_pair().await;
        assert!(matches!(
            proxy.handle_new_connection(server, Vec::new()).await,
            Err(ProxyError::Terminated(_))
        ));
    }
}
