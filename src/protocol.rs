//! Wire envelopes exchanged with a remote host.
//!
//! Every frame is one JSON object. Outbound commands have the shape
//! `{"command": ..., "args": {...}, "requestId": ...}`; inbound frames are
//! either typed (`{"type": ..., "data": ..., "containerId": ...}`) or legacy
//! (`{"success": ..., "message": ..., "error": ...}`). Binary payloads travel
//! as base64 strings inside `data`.

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

/// Maximum inbound frame size (16 MiB). Prevents OOM on malformed data.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// The only payload encoding the host and client agree on.
pub const ENCODING_BASE64: &str = "base64";

/// Outbound command frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub command: String,
    #[serde(default)]
    pub args: Value,
    /// Correlation id echoed back by hosts that support it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Command {
    /// Build a command with an arbitrary serializable argument object.
    ///
    /// Arguments that fail to serialize collapse to an empty object; every
    /// argument type in this crate is a plain struct, so this only matters for
    /// caller-supplied maps with non-string keys.
    pub fn new<A: Serialize>(command: &str, args: A) -> Self {
        let args = serde_json::to_value(args).unwrap_or_else(|e| {
            tracing::warn!(command, error = %e, "command args not serializable, sending {{}}");
            Value::Object(Default::default())
        });
        Self {
            command: command.to_string(),
            args,
            request_id: None,
        }
    }

    /// A command with no arguments (`"args": {}`).
    pub fn bare(command: &str) -> Self {
        Self::new(command, Value::Object(Default::default()))
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn list_containers() -> Self {
        Self::bare("listContainers")
    }

    pub fn start_terminal(session_id: &str) -> Self {
        Self::new(
            "startTerminal",
            SessionArgs {
                session_id: session_id.to_string(),
            },
        )
    }

    pub fn terminal_input(session_id: &str, data: &[u8]) -> Self {
        Self::new(
            "terminalInput",
            TerminalInputArgs {
                session_id: session_id.to_string(),
                data: data.to_vec(),
                encoding: ENCODING_BASE64.to_string(),
            },
        )
    }

    pub fn terminal_resize(session_id: &str, cols: u16, rows: u16) -> Self {
        Self::new(
            "terminalResize",
            TerminalResizeArgs {
                session_id: session_id.to_string(),
                cols,
                rows,
            },
        )
    }

    pub fn kill_terminal(session_id: &str) -> Self {
        Self::new(
            "killTerminal",
            SessionArgs {
                session_id: session_id.to_string(),
            },
        )
    }

    /// Encode this command into a wire frame.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Decode a command frame. Used by host-side test harnesses.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(DecodeError::TooLarge(frame.len()));
        }
        Ok(serde_json::from_slice(frame)?)
    }

    /// Deserialize `args` into a typed struct.
    pub fn args_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.args.clone())
    }
}

// ── Terminal command arguments ─────────────────────────────────────

/// Arguments for `startTerminal` and `killTerminal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionArgs {
    #[serde(alias = "containerId")]
    pub session_id: String,
}

/// Arguments for `terminalInput`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInputArgs {
    #[serde(alias = "containerId")]
    pub session_id: String,
    /// Raw keystroke bytes (base64-encoded in JSON).
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub encoding: String,
}

/// Arguments for `terminalResize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalResizeArgs {
    #[serde(alias = "containerId")]
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

// ── Inbound envelopes ──────────────────────────────────────────────

/// One inbound frame. Typed and legacy frames share this shape; absent
/// fields stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, alias = "sessionId", skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Either a plain string or an object with a `message` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Broadcast kinds the host pushes without being asked for a specific reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BroadcastKind {
    Containers,
    Images,
    Networks,
    Volumes,
    Stacks,
    SystemInfo,
    Stats,
    AllStats,
    Other(String),
}

impl BroadcastKind {
    pub fn from_type(kind: &str) -> Self {
        match kind {
            "containers" => Self::Containers,
            "images" => Self::Images,
            "networks" => Self::Networks,
            "volumes" => Self::Volumes,
            "stacks" => Self::Stacks,
            "systemInfo" | "dockerInfo" => Self::SystemInfo,
            "stats" => Self::Stats,
            "allStats" => Self::AllStats,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Containers => "containers",
            Self::Images => "images",
            Self::Networks => "networks",
            Self::Volumes => "volumes",
            Self::Stacks => "stacks",
            Self::SystemInfo => "systemInfo",
            Self::Stats => "stats",
            Self::AllStats => "allStats",
            Self::Other(kind) => kind,
        }
    }

    /// Telemetry kinds go to the stats aggregator instead of the listing cache.
    pub fn is_stats(&self) -> bool {
        matches!(self, Self::Stats | Self::AllStats)
    }
}

/// Streamed terminal output kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    TerminalOutput,
    ExecOutput,
    ExecErrorOutput,
}

/// Structural route of an inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Broadcast(BroadcastKind),
    Stream(StreamKind),
    Legacy,
}

impl Envelope {
    /// A typed frame, as the host would send it.
    pub fn typed(kind: &str, data: Value) -> Self {
        Self {
            kind: Some(kind.to_string()),
            data,
            ..Default::default()
        }
    }

    /// A terminal output frame carrying `bytes` as base64.
    pub fn terminal_output(session_id: &str, bytes: &[u8]) -> Self {
        Self {
            kind: Some("terminalOutput".to_string()),
            data: Value::String(encode_payload(bytes)),
            container_id: Some(session_id.to_string()),
            encoding: Some(ENCODING_BASE64.to_string()),
            ..Default::default()
        }
    }

    /// A legacy success frame.
    pub fn success(message: &str) -> Self {
        Self {
            success: Some(true),
            message: Some(message.to_string()),
            ..Default::default()
        }
    }

    /// A legacy failure frame.
    pub fn failure(error: &str) -> Self {
        Self {
            success: Some(false),
            error: Some(Value::String(error.to_string())),
            ..Default::default()
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Classify this envelope for dispatch.
    pub fn route(&self) -> Route {
        match self.kind.as_deref() {
            Some("terminalOutput") => Route::Stream(StreamKind::TerminalOutput),
            Some("execOutput") => Route::Stream(StreamKind::ExecOutput),
            Some("execErrorOutput") => Route::Stream(StreamKind::ExecErrorOutput),
            Some(kind) => Route::Broadcast(BroadcastKind::from_type(kind)),
            None => Route::Legacy,
        }
    }

    /// Human-readable error text, if the host reported one.
    pub fn error_text(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => match obj.get("message").and_then(Value::as_str) {
                Some(msg) => Some(msg.to_string()),
                None => Some(Value::Object(obj.clone()).to_string()),
            },
            other => Some(other.to_string()),
        }
    }

    /// True for `success: false` or any frame carrying an `error`.
    pub fn is_failure(&self) -> bool {
        self.success == Some(false) || self.error_text().is_some()
    }

    /// The text a legacy matcher is tested against: `message`, falling back
    /// to a string `data` payload.
    pub fn message_text(&self) -> Option<&str> {
        self.message.as_deref().or_else(|| self.data.as_str())
    }

    /// Decode the binary payload of a stream frame.
    ///
    /// Frames without an `encoding` are base64 (the host always encodes
    /// terminal bytes); `utf8`/`text` frames carry the string as-is.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, DecodeError> {
        let text = self.data.as_str().ok_or(DecodeError::MissingData)?;
        match self.encoding.as_deref() {
            None | Some(ENCODING_BASE64) => decode_payload(text),
            Some("utf8") | Some("utf-8") | Some("text") => Ok(text.as_bytes().to_vec()),
            Some(other) => Err(DecodeError::UnknownEncoding(other.to_string())),
        }
    }

    /// Encode into a wire frame (host side / tests).
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// Decode one inbound frame.
pub fn decode(frame: &[u8]) -> Result<Envelope, DecodeError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(DecodeError::TooLarge(frame.len()));
    }
    let value: Value = serde_json::from_slice(frame)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    Ok(serde_json::from_value(value)?)
}

pub fn encode_payload(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_payload(text: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(base64::engine::general_purpose::STANDARD.decode(text.trim())?)
}

/// Serde helper for base64-encoded byte vectors in JSON.
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}
