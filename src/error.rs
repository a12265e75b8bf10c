//! Error taxonomy shared by the correlator, the peer and the router.
//!
//! Remote error text is untrusted: it can leak host paths and socket
//! locations, and it can be arbitrarily long. Everything that reaches a
//! caller goes through [`sanitize_message`] first.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Maximum length (in characters) of a user-facing error message.
pub const MAX_MESSAGE_LEN: usize = 200;

const REDACTED: &str = "<path>";

/// A frame that could not be turned into an [`crate::protocol::Envelope`].
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("stream frame has no string data payload")]
    MissingData,

    #[error("unsupported payload encoding: {0}")]
    UnknownEncoding(String),

    #[error("bad base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Coarse classification of an explicit remote `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    ResourceInUse,
    NotFound,
    PermissionDenied,
    Validation,
    Conflict,
    Other,
}

/// Why a command did not produce a successful response.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// No live peer, or the write failed. Retry once reconnected.
    #[error("transport unavailable: {0}")]
    Transport(String),

    /// No matching response within the deadline. Remote state is unknown.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The host answered with an explicit error.
    #[error("{message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },

    /// The response arrived but its payload could not be interpreted.
    #[error("undecodable response: {0}")]
    Decode(String),
}

impl CommandError {
    /// Build a classified, sanitized remote error from raw host text.
    pub fn remote(raw: &str) -> Self {
        CommandError::Remote {
            kind: classify_remote_error(raw),
            message: sanitize_message(raw),
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Transport(_) => "transport",
            CommandError::Timeout(_) => "timeout",
            CommandError::Remote { kind, .. } => match kind {
                RemoteErrorKind::ResourceInUse => "resource_in_use",
                RemoteErrorKind::NotFound => "not_found",
                RemoteErrorKind::PermissionDenied => "permission_denied",
                RemoteErrorKind::Validation => "validation",
                RemoteErrorKind::Conflict => "conflict",
                RemoteErrorKind::Other => "remote_error",
            },
            CommandError::Decode(_) => "decode",
        }
    }

    /// Transport and timeout failures may succeed if the command is re-issued.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CommandError::Transport(_) | CommandError::Timeout(_))
    }
}

/// Classify remote error text by the substrings Docker-like daemons use.
///
/// Order matters: "already in use by" is a naming conflict, not a busy
/// resource.
pub fn classify_remote_error(raw: &str) -> RemoteErrorKind {
    let lower = raw.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["conflict", "already exists", "already in use by"]) {
        RemoteErrorKind::Conflict
    } else if has(&[
        "in use",
        "is being used",
        "is running",
        "has active endpoints",
        "device or resource busy",
    ]) {
        RemoteErrorKind::ResourceInUse
    } else if has(&["no such", "not found", "does not exist"]) {
        RemoteErrorKind::NotFound
    } else if has(&[
        "permission denied",
        "access denied",
        "unauthorized",
        "forbidden",
        "not permitted",
        "eacces",
    ]) {
        RemoteErrorKind::PermissionDenied
    } else if has(&["invalid", "required", "must ", "malformed", "bad request"]) {
        RemoteErrorKind::Validation
    } else {
        RemoteErrorKind::Other
    }
}

/// Redact paths and socket addresses, collapse whitespace and truncate to
/// [`MAX_MESSAGE_LEN`] characters.
pub fn sanitize_message(raw: &str) -> String {
    let redacted = raw
        .split_whitespace()
        .map(redact_token)
        .collect::<Vec<_>>()
        .join(" ");
    truncate_chars(&redacted, MAX_MESSAGE_LEN)
}

fn redact_token(token: &str) -> String {
    let start = token
        .find(|c: char| !matches!(c, '"' | '\'' | '(' | '[' | '`' | '<'))
        .unwrap_or(token.len());
    let (lead, rest) = token.split_at(start);
    let core_len = rest
        .trim_end_matches(|c: char| {
            matches!(c, '"' | '\'' | ')' | ']' | ',' | '.' | ';' | ':' | '`' | '>')
        })
        .len();
    let (core, trail) = rest.split_at(core_len);

    if looks_like_path(core) {
        format!("{lead}{REDACTED}{trail}")
    } else {
        token.to_string()
    }
}

fn looks_like_path(s: &str) -> bool {
    if s.starts_with("unix://") || s.starts_with("npipe://") || s.starts_with("file://") {
        return true;
    }
    if s.len() > 1 && (s.starts_with('/') || s.starts_with("~/") || s.starts_with("\\\\")) {
        return true;
    }
    let b = s.as_bytes();
    b.len() >= 3 && b[0].is_ascii_alphabetic() && b[1] == b':' && (b[2] == b'\\' || b[2] == b'/')
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_not_found() {
        assert_eq!(
            classify_remote_error("Error: No such container: c1"),
            RemoteErrorKind::NotFound
        );
        assert_eq!(
            classify_remote_error("network web not found"),
            RemoteErrorKind::NotFound
        );
    }

    #[test]
    fn classify_in_use() {
        assert_eq!(
            classify_remote_error("unable to remove image: image is being used by running container"),
            RemoteErrorKind::ResourceInUse
        );
        assert_eq!(
            classify_remote_error("volume is in use - [abc]"),
            RemoteErrorKind::ResourceInUse
        );
    }

    #[test]
    fn classify_conflict_before_in_use() {
        assert_eq!(
            classify_remote_error(
                "The container name \"/web\" is already in use by container \"abc\""
            ),
            RemoteErrorKind::Conflict
        );
    }

    #[test]
    fn classify_permission() {
        assert_eq!(
            classify_remote_error("dial unix /var/run/docker.sock: connect: permission denied"),
            RemoteErrorKind::PermissionDenied
        );
    }

    #[test]
    fn classify_validation_and_other() {
        assert_eq!(
            classify_remote_error("invalid reference format"),
            RemoteErrorKind::Validation
        );
        assert_eq!(classify_remote_error("daemon exploded"), RemoteErrorKind::Other);
    }

    #[test]
    fn sanitize_redacts_socket_path() {
        let msg = sanitize_message(
            "Got permission denied while trying to connect to the Docker daemon socket at unix:///var/run/docker.sock: Get \"http://x/v1\"",
        );
        assert!(!msg.contains("docker.sock"), "{msg}");
        assert!(msg.contains("<path>:"), "{msg}");
        assert!(msg.contains("http://x/v1"));
    }

    #[test]
    fn sanitize_redacts_absolute_and_windows_paths() {
        let msg = sanitize_message("open /home/alice/.docker/config.json: no such file");
        assert_eq!(msg, "open <path>: no such file");

        let msg = sanitize_message("cannot read (C:\\Users\\bob\\compose.yml)");
        assert_eq!(msg, "cannot read (<path>)");
    }

    #[test]
    fn sanitize_leaves_plain_words() {
        assert_eq!(sanitize_message("  container   started \n"), "container started");
        assert_eq!(sanitize_message("a/b is fine"), "a/b is fine");
        assert_eq!(sanitize_message("/"), "/");
    }

    #[test]
    fn sanitize_truncates_to_limit() {
        let long = "x".repeat(500);
        let msg = sanitize_message(&long);
        assert_eq!(msg.chars().count(), MAX_MESSAGE_LEN);
        assert!(msg.ends_with('…'));
    }

    #[test]
    fn sanitize_truncates_multibyte_safely() {
        let long = "é".repeat(300);
        let msg = sanitize_message(&long);
        assert_eq!(msg.chars().count(), MAX_MESSAGE_LEN);
    }

    #[test]
    fn remote_error_is_classified_and_sanitized() {
        let err = CommandError::remote("No such image: /srv/registry/img");
        match &err {
            CommandError::Remote { kind, message } => {
                assert_eq!(*kind, RemoteErrorKind::NotFound);
                assert_eq!(message, "No such image: <path>");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.code(), "not_found");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn recoverable_errors() {
        assert!(CommandError::Transport("gone".into()).is_recoverable());
        assert!(CommandError::Timeout(Duration::from_secs(1)).is_recoverable());
        assert!(!CommandError::Decode("bad".into()).is_recoverable());
    }
}
