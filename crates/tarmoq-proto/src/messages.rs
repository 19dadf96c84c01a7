//! Protocol message types
//!
//! Broker → agent traffic is a [`ControlMessage`]; agent → broker replies are
//! [`ForwardResponse`]s. Both travel as JSON text frames on the session channel.
//! The JSON shape is flat (`{"type": "FORWARD", "forwardInfo": {...}}`) while the
//! Rust side works with tagged enums; [`WireRequest`] and [`WireResponse`] are the
//! literal wire shapes used to bridge the two.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::codec::CodecError;

/// Discriminator carried in the `type` field of broker → agent messages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    Created,
    Forward,
    Error,
}

/// Public address of a freshly provisioned tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub public_url: String,
}

/// Normalized HTTP request handed over by the ingress
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRequest {
    pub method: String,
    /// Path including the query string
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl ForwardRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Broker → agent control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireRequest", try_from = "WireRequest")]
pub enum ControlMessage {
    /// Tunnel provisioned
    Created { public_url: String },
    /// Public request to execute against the agent's local service
    Forward {
        request_id: String,
        request: ForwardRequest,
    },
    /// Error report; `fatal` instructs the agent to disconnect
    Error { message: String, fatal: bool },
}

impl ControlMessage {
    pub fn created(public_url: impl Into<String>) -> Self {
        ControlMessage::Created {
            public_url: public_url.into(),
        }
    }

    pub fn forward(request_id: impl Into<String>, request: ForwardRequest) -> Self {
        ControlMessage::Forward {
            request_id: request_id.into(),
            request,
        }
    }

    pub fn error(message: impl Into<String>, fatal: bool) -> Self {
        ControlMessage::Error {
            message: message.into(),
            fatal,
        }
    }

    pub fn request_type(&self) -> RequestType {
        match self {
            ControlMessage::Created { .. } => RequestType::Created,
            ControlMessage::Forward { .. } => RequestType::Forward,
            ControlMessage::Error { .. } => RequestType::Error,
        }
    }

    /// Correlation id, present on FORWARD messages only
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ControlMessage::Forward { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

/// Literal JSON shape of a broker → agent message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_info: Option<TunnelInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_info: Option<ForwardRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub shut_down: bool,
}

impl From<ControlMessage> for WireRequest {
    fn from(msg: ControlMessage) -> Self {
        let request_type = msg.request_type();
        let mut wire = WireRequest {
            id: None,
            request_type,
            tunnel_info: None,
            forward_info: None,
            error: None,
            shut_down: false,
        };

        match msg {
            ControlMessage::Created { public_url } => {
                wire.tunnel_info = Some(TunnelInfo { public_url });
            }
            ControlMessage::Forward {
                request_id,
                request,
            } => {
                wire.id = Some(request_id);
                wire.forward_info = Some(request);
            }
            ControlMessage::Error { message, fatal } => {
                wire.error = Some(message);
                wire.shut_down = fatal;
            }
        }

        wire
    }
}

impl TryFrom<WireRequest> for ControlMessage {
    type Error = CodecError;

    fn try_from(wire: WireRequest) -> Result<Self, CodecError> {
        match wire.request_type {
            RequestType::Created => {
                let info = wire
                    .tunnel_info
                    .ok_or(CodecError::MissingField("tunnelInfo"))?;
                Ok(ControlMessage::Created {
                    public_url: info.public_url,
                })
            }
            RequestType::Forward => Ok(ControlMessage::Forward {
                request_id: wire.id.ok_or(CodecError::MissingField("id"))?,
                request: wire
                    .forward_info
                    .ok_or(CodecError::MissingField("forwardInfo"))?,
            }),
            RequestType::Error => Ok(ControlMessage::Error {
                message: wire.error.unwrap_or_default(),
                fatal: wire.shut_down,
            }),
        }
    }
}

/// Kind of agent reply, carried in `responseType`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ResponseKind {
    /// Complete response in a single message
    #[default]
    #[serde(rename = "RESPONSE")]
    Normal,
    /// One fragment of a multi-message body; `last` marks the terminal fragment
    #[serde(rename = "RESPONSE_CHUNK")]
    Chunk,
    /// The agent's local service refused the forwarded call
    #[serde(rename = "UPSTREAM_UNAVAILABLE", alias = "NOT_RUNNING_APP_OF_CLIENT")]
    UpstreamUnavailable,
}

/// Agent → broker reply to a FORWARD message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardResponse {
    pub request_id: String,
    pub status: u16,
    pub body: String,
    pub headers: HashMap<String, String>,
    /// Terminal fragment marker (only meaningful for [`ResponseKind::Chunk`])
    pub last: bool,
    pub kind: ResponseKind,
}

impl ForwardResponse {
    pub fn new(request_id: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            body: body.into(),
            headers: HashMap::new(),
            last: false,
            kind: ResponseKind::Normal,
        }
    }

    pub fn chunk(request_id: impl Into<String>, fragment: impl Into<String>, last: bool) -> Self {
        Self {
            request_id: request_id.into(),
            status: 200,
            body: fragment.into(),
            headers: HashMap::new(),
            last,
            kind: ResponseKind::Chunk,
        }
    }

    pub fn upstream_unavailable(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: 500,
            body: String::new(),
            headers: HashMap::new(),
            last: false,
            kind: ResponseKind::UpstreamUnavailable,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

/// Literal JSON shape of an agent reply. Required fields are optional here so that
/// a reply missing them can be told apart from one that is not JSON at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireResponse {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub last: bool,
    #[serde(default)]
    pub response_type: Option<ResponseKind>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
}

impl From<ForwardResponse> for WireResponse {
    fn from(response: ForwardResponse) -> Self {
        Self {
            request_id: Some(response.request_id),
            status: Some(response.status),
            body: Some(response.body),
            last: response.last,
            response_type: Some(response.kind),
            headers: Some(response.headers),
        }
    }
}

impl TryFrom<WireResponse> for ForwardResponse {
    type Error = CodecError;

    fn try_from(wire: WireResponse) -> Result<Self, CodecError> {
        Ok(Self {
            request_id: wire.request_id.ok_or(CodecError::MissingField("requestId"))?,
            status: wire.status.ok_or(CodecError::MissingField("status"))?,
            kind: wire
                .response_type
                .ok_or(CodecError::MissingField("responseType"))?,
            body: wire.body.unwrap_or_default(),
            headers: wire.headers.unwrap_or_default(),
            last: wire.last,
        })
    }
}
