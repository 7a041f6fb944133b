//! Accept loop and the one-message handshake every connection starts with.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpSocket, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ServerConfig,
    framing::{write_frame, FrameReader},
    protocol::{self, AuthRequest, AuthResponse, Message},
    registry::AgentRegistry,
    status::StatusBoard,
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub struct ConnectionListener {
    listener: TcpListener,
    handshake: Handshake,
}

#[derive(Clone)]
struct Handshake {
    registry: Arc<AgentRegistry>,
    status: Arc<StatusBoard>,
    timeout: Duration,
    max_frame_len: usize,
}

/// Running accept loop. Dropping the handle leaves the loop running; call
/// [`ListenerHandle::stop`] to close the listening socket.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(error) = self.task.await {
            tracing::warn!(target = "arena_broker::listener", error = %error, "accept loop ended abnormally");
        }
    }
}

impl ConnectionListener {
    pub async fn bind(
        config: &ServerConfig,
        registry: Arc<AgentRegistry>,
        status: Arc<StatusBoard>,
    ) -> Result<Self> {
        let addr = tokio::net::lookup_host((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("failed to resolve {}:{}", config.host, config.port))?
            .next()
            .with_context(|| format!("no address for {}:{}", config.host, config.port))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("failed to create listening socket")?;
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .with_context(|| format!("failed to bind {addr}"))?;
        let listener = socket
            .listen(config.backlog)
            .with_context(|| format!("failed to listen on {addr}"))?;

        Ok(Self {
            listener,
            handshake: Handshake {
                registry,
                status,
                timeout: config.handshake_timeout(),
                max_frame_len: config.max_packet_length,
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn start(self) -> Result<ListenerHandle> {
        let local_addr = self.local_addr()?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.accept_loop(cancel.clone()));
        tracing::info!(target = "arena_broker::listener", addr = %local_addr, "listening for agents");
        Ok(ListenerHandle {
            local_addr,
            cancel,
            task,
        })
    }

    async fn accept_loop(self, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(target = "arena_broker::listener", peer = %peer, "accepted connection");
                    let handshake = self.handshake.clone();
                    tokio::spawn(handshake.run(stream, peer));
                }
                Err(error) => {
                    tracing::warn!(target = "arena_broker::listener", error = %error, "accept failed");
                    if !back_off(&cancel, ACCEPT_BACKOFF).await {
                        break;
                    }
                }
            }
        }
        tracing::info!(target = "arena_broker::listener", "listener stopped");
    }
}

impl Handshake {
    async fn run(self, mut stream: TcpStream, peer: SocketAddr) {
        let mut frames = FrameReader::new(&mut stream, self.max_frame_len);
        let frame = match tokio::time::timeout(self.timeout, frames.next_frame()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(error)) => {
                tracing::debug!(target = "arena_broker::listener", peer = %peer, error = %error, "connection closed during handshake");
                return;
            }
            Err(_) => {
                tracing::warn!(target = "arena_broker::listener", peer = %peer, "handshake timed out");
                return;
            }
        };
        let (_, buffered) = frames.into_parts();

        match protocol::decode(&frame) {
            Ok(Message::AuthRequest(auth)) => self.authenticate(stream, peer, auth, buffered).await,
            Ok(Message::StatusRequest(_)) => self.answer_status(stream, peer).await,
            Ok(other) => {
                tracing::warn!(target = "arena_broker::listener", peer = %peer, kind = %other.kind(), "unexpected handshake message, closing");
            }
            Err(error) => {
                tracing::warn!(target = "arena_broker::listener", peer = %peer, error = %error, "invalid handshake message, closing");
            }
        }
    }

    async fn authenticate(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        auth: AuthRequest,
        buffered: Vec<u8>,
    ) {
        let Some(proxy) = self.registry.authenticate(&auth.user, &auth.pw) else {
            tracing::warn!(target = "arena_broker::listener", user = %auth.user, peer = %peer, "authentication failed");
            refuse(stream, peer).await;
            return;
        };
        if proxy.is_terminated() {
            tracing::warn!(target = "arena_broker::listener", agent = %proxy.name(), peer = %peer, "agent is shut down, refusing login");
            refuse(stream, peer).await;
            return;
        }

        if let Err(error) = reply(&mut stream, Message::AuthResponse(AuthResponse::ok())).await {
            tracing::warn!(target = "arena_broker::listener", agent = %proxy.name(), peer = %peer, error = %error, "failed to send auth response");
            return;
        }
        tracing::info!(target = "arena_broker::listener", agent = %proxy.name(), team = %proxy.team(), peer = %peer, "agent authenticated");

        if let Err(error) = proxy.handle_new_connection(stream, buffered).await {
            tracing::warn!(target = "arena_broker::listener", agent = %proxy.name(), error = %error, "connection refused");
        }
    }

    async fn answer_status(&self, mut stream: TcpStream, peer: SocketAddr) {
        let status = self.status.snapshot();
        if let Err(error) = reply(&mut stream, Message::StatusResponse(status)).await {
            tracing::debug!(target = "arena_broker::listener", peer = %peer, error = %error, "failed to send status");
        }
        let _ = stream.shutdown().await;
    }
}

async fn reply(stream: &mut TcpStream, message: Message) -> anyhow::Result<()> {
    let frame = protocol::encode(&message)?;
    write_frame(stream, &frame).await?;
    Ok(())
}

async fn refuse(mut stream: TcpStream, peer: SocketAddr) {
    if let Err(error) = reply(&mut stream, Message::AuthResponse(AuthResponse::fail())).await {
        tracing::debug!(target = "arena_broker::listener", peer = %peer, error = %error, "failed to send auth failure");
    }
    let _ = stream.shutdown().await;
}

/// Sleeps for `delay` unless cancelled first. Returns false on cancellation.
async fn back_off(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
