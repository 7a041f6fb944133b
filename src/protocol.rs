//! Wire envelopes exchanged between the arena and its agents.
//!
//! Every message travels as `{"type": "<tag>", "content": {...}}` followed by a
//! single `0x00` terminator. Decoding goes through [`MessageKind::from_tag`] and
//! a per-kind content parser, yielding a typed [`Message`].

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

pub const FRAME_TERMINATOR: u8 = 0x00;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("envelope is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("{0} envelope has no content")]
    MissingContent(MessageKind),
    #[error("invalid {kind} content: {source}")]
    InvalidContent {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("percept must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("failed to encode {kind} envelope: {source}")]
    Encode {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Scenario-defined percept content. Always a JSON object on the wire.
pub type Percept = Map<String, Value>;

/// Converts a scenario value into a [`Percept`], refusing anything but an
/// object so it cannot reach an agent and fail to decode there.
pub fn percept(value: Value) -> Result<Percept, ProtocolError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Err(ProtocolError::NotAnObject("null")),
        Value::Bool(_) => Err(ProtocolError::NotAnObject("a boolean")),
        Value::Number(_) => Err(ProtocolError::NotAnObject("a number")),
        Value::String(_) => Err(ProtocolError::NotAnObject("a string")),
        Value::Array(_) => Err(ProtocolError::NotAnObject("an array")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    AuthRequest,
    AuthResponse,
    StatusRequest,
    StatusResponse,
    SimStart,
    RequestAction,
    Action,
    SimEnd,
    Bye,
}

impl MessageKind {
    pub const ALL: [MessageKind; 9] = [
        MessageKind::AuthRequest,
        MessageKind::AuthResponse,
        MessageKind::StatusRequest,
        MessageKind::StatusResponse,
        MessageKind::SimStart,
        MessageKind::RequestAction,
        MessageKind::Action,
        MessageKind::SimEnd,
        MessageKind::Bye,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            MessageKind::AuthRequest => "auth-request",
            MessageKind::AuthResponse => "auth-response",
            MessageKind::StatusRequest => "status-request",
            MessageKind::StatusResponse => "status-response",
            MessageKind::SimStart => "sim-start",
            MessageKind::RequestAction => "request-action",
            MessageKind::Action => "action",
            MessageKind::SimEnd => "sim-end",
            MessageKind::Bye => "bye",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    fn parse(self, content: Value) -> Result<Message, serde_json::Error> {
        Ok(match self {
            MessageKind::AuthRequest => Message::AuthRequest(parse_content(content)?),
            MessageKind::AuthResponse => Message::AuthResponse(parse_content(content)?),
            MessageKind::StatusRequest => Message::StatusRequest(parse_content(content)?),
            MessageKind::StatusResponse => Message::StatusResponse(parse_content(content)?),
            MessageKind::SimStart => Message::SimStart(parse_content(content)?),
            MessageKind::RequestAction => Message::RequestAction(parse_content(content)?),
            MessageKind::Action => Message::Action(parse_content(content)?),
            MessageKind::SimEnd => Message::SimEnd(parse_content(content)?),
            MessageKind::Bye => Message::Bye(parse_content(content)?),
        })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

fn parse_content<T: DeserializeOwned>(content: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(content)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub user: String,
    pub pw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthResult {
    Ok,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub result: AuthResult,
}

impl AuthResponse {
    pub fn ok() -> Self {
        Self {
            result: AuthResult::Ok,
        }
    }

    pub fn fail() -> Self {
        Self {
            result: AuthResult::Fail,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub time: i64,
    pub teams: Vec<String>,
    pub team_sizes: Vec<u32>,
    pub current_simulation: i64,
}

/// Per-turn request pushed to an agent. `id` and `deadline` are stamped by the
/// agent's proxy right before the request is queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestAction {
    pub id: u64,
    pub deadline: i64,
    pub percept: Percept,
}

impl RequestAction {
    pub fn new(percept: Percept) -> Self {
        Self {
            id: 0,
            deadline: 0,
            percept,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: String,
    pub id: u64,
    #[serde(default)]
    pub p: Vec<String>,
}

impl Action {
    /// Recorded for agents that did not answer a request in time.
    pub const NO_ACTION: &'static str = "noAction";

    pub fn new(action_type: impl Into<String>, id: u64, p: Vec<String>) -> Self {
        Self {
            action_type: action_type.into(),
            id,
            p,
        }
    }

    pub fn no_action(id: u64) -> Self {
        Self::new(Self::NO_ACTION, id, Vec::new())
    }

    pub fn is_no_action(&self) -> bool {
        self.action_type == Self::NO_ACTION
    }
}

fn unset() -> i64 {
    -1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimEnd {
    #[serde(default = "unset")]
    pub score: i64,
    #[serde(default = "unset")]
    pub ranking: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SimEnd {
    pub fn new(score: i64, ranking: i64) -> Self {
        Self {
            score,
            ranking,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bye {}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    AuthRequest(AuthRequest),
    AuthResponse(AuthResponse),
    StatusRequest(StatusRequest),
    StatusResponse(StatusResponse),
    SimStart(Percept),
    RequestAction(RequestAction),
    Action(Action),
    SimEnd(SimEnd),
    Bye(Bye),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::AuthRequest(_) => MessageKind::AuthRequest,
            Message::AuthResponse(_) => MessageKind::AuthResponse,
            Message::StatusRequest(_) => MessageKind::StatusRequest,
            Message::StatusResponse(_) => MessageKind::StatusResponse,
            Message::SimStart(_) => MessageKind::SimStart,
            Message::RequestAction(_) => MessageKind::RequestAction,
            Message::Action(_) => MessageKind::Action,
            Message::SimEnd(_) => MessageKind::SimEnd,
            Message::Bye(_) => MessageKind::Bye,
        }
    }

    fn content(&self) -> Result<Value, serde_json::Error> {
        match self {
            Message::AuthRequest(content) => serde_json::to_value(content),
            Message::AuthResponse(content) => serde_json::to_value(content),
            Message::StatusRequest(content) => serde_json::to_value(content),
            Message::StatusResponse(content) => serde_json::to_value(content),
            Message::SimStart(content) => Ok(Value::Object(content.clone())),
            Message::RequestAction(content) => serde_json::to_value(content),
            Message::Action(content) => serde_json::to_value(content),
            Message::SimEnd(content) => serde_json::to_value(content),
            Message::Bye(content) => serde_json::to_value(content),
        }
    }
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    #[serde(rename = "type")]
    msg_type: &'a str,
    content: Value,
}

#[derive(Deserialize)]
struct InboundEnvelope {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    content: Option<Value>,
}

/// Serializes `message` into one terminated frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let kind = message.kind();
    let content = message
        .content()
        .map_err(|source| ProtocolError::Encode { kind, source })?;
    let envelope = OutboundEnvelope {
        msg_type: kind.tag(),
        content,
    };
    let mut bytes =
        serde_json::to_vec(&envelope).map_err(|source| ProtocolError::Encode { kind, source })?;
    bytes.push(FRAME_TERMINATOR);
    Ok(bytes)
}

/// Parses one frame body (terminator already stripped).
///
/// Top-level keys other than `type` and `content` are ignored; older clients
/// still attach a `time` stamp to some envelopes.
pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
    let envelope: InboundEnvelope =
        serde_json::from_slice(frame).map_err(ProtocolError::InvalidJson)?;
    let kind = MessageKind::from_tag(&envelope.msg_type)
        .ok_or_else(|| ProtocolError::UnknownType(envelope.msg_type.clone()))?;
    let content = match envelope.content {
        Some(Value::Null) | None => return Err(ProtocolError::MissingContent(kind)),
        Some(content) => content,
    };
    kind.parse(content)
        .map_err(|source| ProtocolError::InvalidContent { kind, source })
}
