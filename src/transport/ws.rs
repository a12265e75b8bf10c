//! WebSocket relay transport.
//!
//! Joining a topic dials `{relay}/topics/{topic}`. While joined, the dial
//! loop keeps going: when a stream drops it waits with exponential backoff
//! (1s..60s, jittered) and dials again, handing each new stream to the
//! consumer as a fresh peer.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;

use super::{Discovery, PeerLink};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Validate a relay base URL. Must be `ws://` or `wss://` with a host.
pub fn validate_relay_url(url: &str) -> Result<(), String> {
    let rest = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"))
        .ok_or_else(|| "relay URL must start with ws:// or wss://".to_string())?;
    let host = rest.split('/').next().unwrap_or("");
    if host.is_empty() {
        return Err("relay URL has empty host".into());
    }
    Ok(())
}

/// Discovery through a WebSocket relay that pairs clients with hosts by topic.
pub struct RelayDiscovery {
    relay: String,
    joined: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl RelayDiscovery {
    pub fn new(relay: &str) -> Result<Self, String> {
        validate_relay_url(relay)?;
        Ok(Self {
            relay: relay.trim_end_matches('/').to_string(),
            joined: Mutex::new(HashMap::new()),
        })
    }

    pub fn topic_url(&self, topic: &str) -> String {
        format!("{}/topics/{}", self.relay, topic)
    }
}

impl Discovery for RelayDiscovery {
    fn join(&self, topic: &str) -> mpsc::Receiver<PeerLink> {
        let (peer_tx, peer_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if let Some(previous) = self.joined.lock().insert(topic.to_string(), shutdown_tx) {
            let _ = previous.send(true);
        }

        tokio::spawn(dial_loop(
            self.topic_url(topic),
            topic.to_string(),
            peer_tx,
            shutdown_rx,
        ));
        peer_rx
    }

    fn leave(&self, topic: &str) {
        if let Some(shutdown_tx) = self.joined.lock().remove(topic) {
            let _ = shutdown_tx.send(true);
        }
    }
}

impl Drop for RelayDiscovery {
    fn drop(&mut self) {
        for (_, shutdown_tx) in self.joined.lock().drain() {
            let _ = shutdown_tx.send(true);
        }
    }
}

async fn dial_loop(
    url: String,
    topic: String,
    peer_tx: mpsc::Sender<PeerLink>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = MIN_BACKOFF;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => {
                backoff = MIN_BACKOFF;
                tracing::debug!(topic = %topic, "relay stream established");

                let (local, bridge) = PeerLink::pair(&topic);
                if peer_tx.send(local).await.is_err() {
                    // Nobody is listening for peers on this topic any more.
                    return;
                }

                pump(ws_stream, bridge, &mut shutdown_rx).await;

                if *shutdown_rx.borrow() {
                    return;
                }
                tracing::info!(topic = %topic, "relay stream lost, redialing");
            }
            Err(e) => {
                tracing::debug!(topic = %topic, error = %e, "relay dial failed");
            }
        }

        let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
        tokio::select! {
            _ = tokio::time::sleep(backoff + Duration::from_millis(jitter)) => {}
            _ = shutdown_rx.changed() => { return; }
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Shuttle frames between the WebSocket and the bridge end of a link until
/// either side closes.
async fn pump(ws_stream: WsStream, bridge: PeerLink, shutdown_rx: &mut watch::Receiver<bool>) {
    let PeerLink {
        outbound,
        mut inbound,
        closed,
        ..
    } = bridge;
    let (mut sink, mut stream) = ws_stream.split();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await; // Skip the first immediate tick.

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if outbound.send(Bytes::copy_from_slice(text.as_bytes())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if outbound.send(data).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "relay stream error");
                        break;
                    }
                }
            }
            frame = inbound.recv() => {
                let Some(frame) = frame else { break };
                let msg = match std::str::from_utf8(&frame) {
                    Ok(text) => Message::Text(text.to_owned().into()),
                    Err(_) => Message::Binary(frame),
                };
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            _ = closed.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            _ = shutdown_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    closed.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    /// Spawn a relay stub that echoes every text frame it receives.
    async fn spawn_echo_relay() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        let (mut tx, mut rx) = ws.split();
                        while let Some(Ok(msg)) = rx.next().await {
                            if msg.is_text() && tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[test]
    fn relay_url_validation() {
        assert!(validate_relay_url("ws://relay.example:9000").is_ok());
        assert!(validate_relay_url("wss://relay.example/base").is_ok());
        assert!(validate_relay_url("http://relay.example").is_err());
        assert!(validate_relay_url("ws://").is_err());
    }

    #[test]
    fn topic_url_strips_trailing_slash() {
        let discovery = RelayDiscovery::new("ws://relay.example/").unwrap();
        assert_eq!(
            discovery.topic_url("abcd"),
            "ws://relay.example/topics/abcd"
        );
    }

    #[tokio::test]
    async fn join_yields_working_link() {
        let addr = spawn_echo_relay().await;
        let discovery = RelayDiscovery::new(&format!("ws://{addr}")).unwrap();

        let mut peers = discovery.join("deadbeef");
        let mut link = timeout(Duration::from_secs(5), peers.recv())
            .await
            .expect("peer within 5s")
            .expect("peer channel open");

        link.outbound.send(Bytes::from(r#"{"x":1}"#)).await.unwrap();
        let echoed = timeout(Duration::from_secs(5), link.inbound.recv())
            .await
            .expect("echo within 5s")
            .unwrap();
        assert_eq!(echoed, Bytes::from(r#"{"x":1}"#));

        discovery.leave("deadbeef");
        timeout(Duration::from_secs(5), link.closed.cancelled())
            .await
            .expect("link closes after leave");
    }

    #[tokio::test]
    async fn leave_stops_dialing_unreachable_relay() {
        // Port 9 on loopback is almost never open; the loop keeps failing.
        let discovery = RelayDiscovery::new("ws://127.0.0.1:9").unwrap();
        let mut peers = discovery.join("cafe");
        discovery.leave("cafe");
        let next = timeout(Duration::from_secs(5), peers.recv())
            .await
            .expect("dial loop exits after leave");
        assert!(next.is_none());
    }
}
