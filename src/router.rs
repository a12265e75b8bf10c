use std::sync::Arc;

use crate::correlator::Correlator;
use crate::error::{classify_remote_error, sanitize_message};
use crate::events::{ClientEvent, EventBus};
use crate::listing::ListingStore;
use crate::mux::Multiplexer;
use crate::protocol::{BroadcastKind, Envelope, Route};
use crate::stats::{parse_samples, StatsAggregator};

/// Inbound dispatch for one Connection.
///
/// Called by the peer's reader task for every decoded envelope, in arrival
/// order:
///
/// 1. An `error` is classified and published, then dispatch continues.
/// 2. Broadcast kinds update the listing cache or the stats aggregator, and
///    may also settle a request that expects that type.
/// 3. Terminal/exec output goes to the multiplexer.
/// 4. Legacy frames are offered to the correlator.
pub struct Router {
    connection_id: String,
    correlator: Arc<Correlator>,
    mux: Arc<Multiplexer>,
    stats: Arc<StatsAggregator>,
    listings: Arc<ListingStore>,
    events: EventBus,
}

impl Router {
    pub fn new(
        connection_id: &str,
        correlator: Arc<Correlator>,
        mux: Arc<Multiplexer>,
        stats: Arc<StatsAggregator>,
        listings: Arc<ListingStore>,
        events: EventBus,
    ) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            correlator,
            mux,
            stats,
            listings,
            events,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn route(&self, envelope: Envelope) {
        if let Some(text) = envelope.error_text() {
            let kind = classify_remote_error(&text);
            let message = sanitize_message(&text);
            tracing::warn!(connection = %self.connection_id, ?kind, %message, "remote error");
            self.events.publish(ClientEvent::RemoteError {
                connection_id: self.connection_id.clone(),
                kind,
                message,
            });
        }

        match envelope.route() {
            Route::Broadcast(kind) => {
                self.broadcast(kind, &envelope);
                self.correlator.offer(&envelope);
            }
            Route::Stream(kind) => self.mux.handle_output(kind, &envelope),
            Route::Legacy => {
                if !self.correlator.offer(&envelope) {
                    tracing::debug!(
                        connection = %self.connection_id,
                        message = envelope.message_text().unwrap_or(""),
                        "unmatched response"
                    );
                }
            }
        }
    }

    fn broadcast(&self, kind: BroadcastKind, envelope: &Envelope) {
        if envelope.data.is_null() {
            return;
        }

        if kind.is_stats() {
            for (subject_id, sample) in parse_samples(&envelope.data) {
                self.stats.ingest(&subject_id, sample);
                self.events.publish(ClientEvent::StatsUpdated {
                    connection_id: self.connection_id.clone(),
                    subject_id,
                });
            }
            return;
        }

        if let BroadcastKind::Other(ref name) = kind {
            self.events.publish(ClientEvent::Broadcast {
                connection_id: self.connection_id.clone(),
                kind: name.clone(),
                data: envelope.data.clone(),
            });
            return;
        }

        self.listings.update(kind.clone(), envelope.data.clone());
        if kind == BroadcastKind::Containers {
            self.stats.gc(&self.listings.subject_ids());
        }
        self.events.publish(ClientEvent::Listing {
            connection_id: self.connection_id.clone(),
            kind: kind.as_str().to_string(),
        });
    }
}
