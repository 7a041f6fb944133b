//! Agent-side connector: authenticate, then trade messages with the arena.

use std::{io, time::Duration};

use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream, ToSocketAddrs,
    },
};

use crate::{
    framing::{write_frame, FrameReader},
    protocol::{
        self, Action, AuthRequest, AuthResult, Message, MessageKind, ProtocolError,
        StatusRequest, StatusResponse,
    },
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("server rejected credentials for {0}")]
    Rejected(String),
    #[error("unexpected {0} message")]
    Unexpected(MessageKind),
    #[error("server did not answer within {0:?}")]
    Timeout(Duration),
}

pub struct AgentClient {
    name: String,
    frames: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl AgentClient {
    pub async fn connect(
        addr: impl ToSocketAddrs,
        user: &str,
        password: &str,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, writer) = stream.into_split();
        let mut client = Self {
            name: user.to_string(),
            frames: FrameReader::new(read_half, MAX_FRAME_LEN),
            writer,
        };

        client
            .send(&Message::AuthRequest(AuthRequest {
                user: user.to_string(),
                pw: password.to_string(),
            }))
            .await?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, client.frames.next_frame())
            .await
            .map_err(|_| ClientError::Timeout(HANDSHAKE_TIMEOUT))??;
        match protocol::decode(&reply)? {
            Message::AuthResponse(response) if response.result == AuthResult::Ok => {
                tracing::debug!(target = "arena_broker::client", agent = %user, "authenticated");
                Ok(client)
            }
            Message::AuthResponse(_) => Err(ClientError::Rejected(user.to_string())),
            other => Err(ClientError::Unexpected(other.kind())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next message from the server. Undecodable frames are logged and
    /// skipped; a closed connection is an error.
    pub async fn next_message(&mut self) -> Result<Message, ClientError> {
        loop {
            let frame = self.frames.next_frame().await?;
            match protocol::decode(&frame) {
                Ok(message) => return Ok(message),
                Err(error) => {
                    tracing::warn!(target = "arena_broker::client", agent = %self.name, error = %error, "skipping undecodable message");
                }
            }
        }
    }

    pub async fn send_action(&mut self, action: Action) -> Result<(), ClientError> {
        self.send(&Message::Action(action)).await
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), ClientError> {
        let frame = protocol::encode(message)?;
        write_frame(&mut self.writer, &frame).await?;
        Ok(())
    }

    pub async fn shutdown(mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Asks the server at `addr` for its status over a fresh connection.
pub async fn query_status(addr: impl ToSocketAddrs) -> Result<StatusResponse, ClientError> {
    let mut stream = TcpStream::connect(addr).await?;
    let frame = protocol::encode(&Message::StatusRequest(StatusRequest {}))?;
    write_frame(&mut stream, &frame).await?;

    let mut frames = FrameReader::new(stream, MAX_FRAME_LEN);
    let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, frames.next_frame())
        .await
        .map_err(|_| ClientError::Timeout(HANDSHAKE_TIMEOUT))??;
    match protocol::decode(&reply)? {
        Message::StatusResponse(status) => Ok(status),
        other => Err(ClientError::Unexpected(other.kind())),
    }
}
