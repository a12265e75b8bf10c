//! Command/response correlation.
//!
//! Every outbound command gets a fresh `requestId`. Hosts that echo it are
//! matched exactly. For hosts that don't, pending requests form a FIFO queue
//! and each inbound envelope resolves the first entry whose [`Expect`] it
//! satisfies. An untagged legacy failure rejects the oldest legacy request.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::CommandError;
use crate::peer::PeerSlot;
use crate::protocol::{BroadcastKind, Command, Envelope, Route};

/// Default deadline for simple mutations.
pub const SHORT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default deadline for long-running operations (pulls, builds).
pub const LONG_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// What an inbound envelope must look like to resolve a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    /// The first legacy response of any content.
    Any,
    /// A legacy response whose message contains this text.
    Fragment(String),
    /// A typed envelope of this `type`.
    Type(String),
}

impl Expect {
    pub fn fragment(text: impl Into<String>) -> Self {
        Expect::Fragment(text.into())
    }

    pub fn kind(kind: BroadcastKind) -> Self {
        Expect::Type(kind.as_str().to_string())
    }

    fn is_legacy(&self) -> bool {
        matches!(self, Expect::Any | Expect::Fragment(_))
    }

    fn matches(&self, envelope: &Envelope) -> bool {
        match (self, envelope.route()) {
            (Expect::Type(kind), Route::Broadcast(_)) => envelope.kind.as_deref() == Some(kind),
            (Expect::Any, Route::Legacy) => true,
            (Expect::Fragment(fragment), Route::Legacy) => envelope
                .message_text()
                .is_some_and(|m| m.contains(fragment.as_str())),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub expect: Expect,
    pub timeout: Duration,
    /// Listing command to re-send once this one settles.
    pub refresh: Option<String>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            expect: Expect::Any,
            timeout: LONG_TIMEOUT,
            refresh: None,
        }
    }
}

impl CommandOptions {
    pub fn new(expect: Expect, timeout: Duration) -> Self {
        Self {
            expect,
            timeout,
            refresh: None,
        }
    }

    pub fn refresh(mut self, command: &str) -> Self {
        self.refresh = Some(command.to_string());
        self
    }
}

/// A successful, correlated response.
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: String,
    pub envelope: Envelope,
    pub elapsed: Duration,
}

impl Response {
    pub fn message(&self) -> Option<&str> {
        self.envelope.message_text()
    }

    /// Deserialize the envelope's `data`.
    pub fn data_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, CommandError> {
        serde_json::from_value(self.envelope.data.clone())
            .map_err(|e| CommandError::Decode(e.to_string()))
    }
}

type Reply = Result<Response, CommandError>;

struct PendingRequest {
    request_id: String,
    command: String,
    expect: Expect,
    created_at: Instant,
    reply: oneshot::Sender<Reply>,
}

impl PendingRequest {
    fn settle(self, envelope: &Envelope) {
        let reply = match envelope.error_text() {
            Some(text) => Err(CommandError::remote(&text)),
            None if envelope.success == Some(false) => Err(CommandError::remote(
                envelope.message_text().unwrap_or("command failed"),
            )),
            None => Ok(Response {
                request_id: self.request_id.clone(),
                envelope: envelope.clone(),
                elapsed: self.created_at.elapsed(),
            }),
        };
        tracing::debug!(
            command = %self.command,
            request_id = %self.request_id,
            ok = reply.is_ok(),
            "request settled"
        );
        // The caller may have timed out and dropped the receiver.
        let _ = self.reply.send(reply);
    }
}

pub struct Correlator {
    connection_id: String,
    peer: PeerSlot,
    pending: Mutex<VecDeque<PendingRequest>>,
}

impl Correlator {
    pub fn new(connection_id: &str, peer: PeerSlot) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            peer,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Send `command` and wait for the response that matches `opts.expect`.
    ///
    /// Timing out only stops the wait. Whatever the host already started
    /// keeps running, and a reply that arrives afterwards is ignored.
    pub async fn execute<A: Serialize>(
        &self,
        command: &str,
        args: A,
        opts: CommandOptions,
    ) -> Result<Response, CommandError> {
        let peer = self
            .peer
            .get()
            .filter(|p| p.is_live())
            .ok_or_else(|| CommandError::Transport("no live peer".into()))?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let cmd = Command::new(command, args).with_request_id(request_id.clone());

        let (tx, rx) = oneshot::channel();
        // Queue before sending so an immediate reply cannot be missed.
        self.pending.lock().push_back(PendingRequest {
            request_id: request_id.clone(),
            command: command.to_string(),
            expect: opts.expect.clone(),
            created_at: Instant::now(),
            reply: tx,
        });

        if !peer.send(&cmd) {
            self.remove(&request_id);
            return Err(CommandError::Transport("write failed".into()));
        }

        let result = match tokio::time::timeout(opts.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(CommandError::Transport("connection closed".into())),
            Err(_) => {
                self.remove(&request_id);
                tracing::info!(
                    connection = %self.connection_id,
                    command,
                    timeout_ms = opts.timeout.as_millis() as u64,
                    "command timed out"
                );
                Err(CommandError::Timeout(opts.timeout))
            }
        };

        if let Some(ref refresh) = opts.refresh {
            if !matches!(result, Err(CommandError::Transport(_))) {
                self.peer.send(&Command::bare(refresh));
            }
        }

        result
    }

    /// Offer an inbound envelope. Returns true if it settled a request.
    pub fn offer(&self, envelope: &Envelope) -> bool {
        let mut pending = self.pending.lock();

        let index = if let Some(ref id) = envelope.request_id {
            // Tagged replies only ever settle their own request, and progress
            // lines that miss the expectation leave it waiting.
            pending
                .iter()
                .position(|p| &p.request_id == id && (envelope.is_failure() || p.expect.matches(envelope)))
        } else if envelope.route() == Route::Legacy && envelope.is_failure() {
            pending.iter().position(|p| p.expect.is_legacy())
        } else {
            pending.iter().position(|p| p.expect.matches(envelope))
        };

        match index.and_then(|i| pending.remove(i)) {
            Some(request) => {
                drop(pending);
                request.settle(envelope);
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with `error`.
    pub fn reject_all(&self, error: CommandError) {
        let drained: Vec<PendingRequest> = self.pending.lock().drain(..).collect();
        if !drained.is_empty() {
            tracing::debug!(connection = %self.connection_id, count = drained.len(), "rejecting pending requests");
        }
        for request in drained {
            let _ = request.reply.send(Err(error.clone()));
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn remove(&self, request_id: &str) {
        self.pending.lock().retain(|p| p.request_id != request_id);
    }
}
