//! Terminal sessions and telemetry over a live peer.

mod common;

use std::time::Duration;

use common::*;
use peerdock::events::ClientEvent;
use peerdock::protocol::{Command, Envelope, TerminalInputArgs, TerminalResizeArgs};
use peerdock::session::{SessionState, TerminalSize};
use peerdock::transport::memory::RemoteEnd;
use serde_json::json;

/// Collect every command the host receives within `wait`.
async fn drain(host: &mut RemoteEnd, wait: Duration) -> Vec<Command> {
    let mut out = Vec::new();
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        match host.recv_command_within(left).await {
            Some(cmd) => out.push(cmd),
            None => return out,
        }
    }
}

fn named<'a>(cmds: &'a [Command], name: &str) -> Vec<&'a Command> {
    cmds.iter().filter(|c| c.command == name).collect()
}

#[tokio::test]
async fn reopening_a_session_reuses_it() {
    let h = Harness::new();
    let (id, mut host) = h.connect(TOPIC_A).await;
    let mux = h.manager.remote(&id).unwrap().mux();

    assert_eq!(mux.open("c1", "web").unwrap(), SessionState::Opening);
    mux.open("c2", "db").unwrap();
    assert_eq!(mux.open("c1", "web").unwrap(), SessionState::Opening);

    let cmds = drain(&mut host, Duration::from_millis(150)).await;
    let starts = named(&cmds, "startTerminal");
    assert_eq!(starts.len(), 2);
    assert_eq!(h.factory.created(), 2);
    assert_eq!(mux.focused().as_deref(), Some("c1"));
}

#[tokio::test]
async fn first_output_activates_session() {
    let h = Harness::new();
    let (id, host) = h.connect(TOPIC_A).await;
    let mux = h.manager.remote(&id).unwrap().mux();
    let mut events = h.manager.subscribe();

    mux.open("c1", "web").unwrap();
    host.send(&Envelope::terminal_output("c1", b"$ ")).await;

    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::SessionChanged { session_id, state: SessionState::Active, .. } if session_id == "c1")
    })
    .await
    .expect("session became active");
    assert_eq!(h.factory.capture("c1").unwrap().text(), "$ ");
}

#[tokio::test]
async fn output_and_input_stay_in_their_session() {
    let h = Harness::new();
    let (id, mut host) = h.connect(TOPIC_A).await;
    let mux = h.manager.remote(&id).unwrap().mux();

    mux.open("c1", "web").unwrap();
    mux.open("c2", "db").unwrap();

    host.send(&Envelope::terminal_output("c1", b"from one")).await;
    host.send(&Envelope::terminal_output("c2", b"from two")).await;
    host.send(&Envelope::terminal_output("ghost", b"dropped")).await;

    assert!(eventually(|| h.factory.capture("c2").is_some_and(|c| !c.output.is_empty())).await);
    assert_eq!(h.factory.capture("c1").unwrap().text(), "from one");
    assert_eq!(h.factory.capture("c2").unwrap().text(), "from two");
    assert!(h.factory.capture("ghost").is_none());

    mux.input("c2", b"ls -la\r").unwrap();
    let cmd = host.expect_command("terminalInput", WAIT).await.unwrap();
    let args: TerminalInputArgs = cmd.args_as().unwrap();
    assert_eq!(args.session_id, "c2");
    assert_eq!(args.data, b"ls -la\r");
    assert_eq!(args.encoding, "base64");
}

#[tokio::test]
async fn resize_burst_sends_last_size_once() {
    let h = Harness::new();
    let (id, mut host) = h.connect(TOPIC_A).await;
    let mux = h.manager.remote(&id).unwrap().mux();

    mux.open("c1", "web").unwrap();
    for (cols, rows) in [(100, 30), (120, 40), (132, 43)] {
        mux.resize("c1", TerminalSize::new(cols, rows)).unwrap();
    }

    let cmds = drain(&mut host, Duration::from_millis(200)).await;
    let resizes = named(&cmds, "terminalResize");
    assert_eq!(resizes.len(), 1, "burst collapses to one resize: {resizes:?}");
    let args: TerminalResizeArgs = resizes[0].args_as().unwrap();
    assert_eq!((args.cols, args.rows), (132, 43));

    // Same size again: nothing new goes out.
    mux.resize("c1", TerminalSize::new(132, 43)).unwrap();
    let cmds = drain(&mut host, Duration::from_millis(100)).await;
    assert!(named(&cmds, "terminalResize").is_empty());
}

#[tokio::test]
async fn zero_size_is_never_sent() {
    let h = Harness::new();
    h.factory.set_geometry(None);
    let (id, mut host) = h.connect(TOPIC_A).await;
    let mux = h.manager.remote(&id).unwrap().mux();

    mux.open("c1", "web").unwrap();
    mux.resize("c1", TerminalSize::new(0, 24)).unwrap();

    let cmds = drain(&mut host, Duration::from_millis(100)).await;
    assert!(named(&cmds, "terminalResize").is_empty());
}

#[tokio::test]
async fn kill_sends_and_closes_locally() {
    let h = Harness::new();
    let (id, mut host) = h.connect(TOPIC_A).await;
    let mux = h.manager.remote(&id).unwrap().mux();

    mux.open("c1", "web").unwrap();
    assert!(mux.kill("c1"));
    assert!(host.expect_command("killTerminal", WAIT).await.is_some());
    assert!(mux.state("c1").is_none());
    assert!(h.factory.capture("c1").unwrap().disposed);
    assert!(!mux.kill("c1"));
}

#[tokio::test]
async fn peer_loss_closes_sessions() {
    let h = Harness::new();
    let (id, host) = h.connect(TOPIC_A).await;
    let mux = h.manager.remote(&id).unwrap().mux();
    mux.open("c1", "web").unwrap();

    let mut events = h.manager.subscribe();
    host.close();
    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::SessionChanged { session_id, state: SessionState::Closed, .. } if session_id == "c1")
    })
    .await
    .expect("session closed");
    assert!(mux.sessions().is_empty());
}

#[tokio::test]
async fn stats_follow_container_listing() {
    let h = Harness::new();
    let (id, host) = h.connect(TOPIC_A).await;
    let stats = h.manager.remote(&id).unwrap().stats();

    host.send(&Envelope::typed(
        "allStats",
        json!([
            {"id": "c1", "cpuPercent": 10.0, "memoryBytes": 1024},
            {"id": "c2", "cpuPercent": "50%", "memoryBytes": 2048}
        ]),
    ))
    .await;
    assert!(eventually(|| stats.subjects() == vec!["c1".to_string(), "c2".to_string()]).await);

    host.send(&containers(&["c1"])).await;
    assert!(eventually(|| stats.subjects() == vec!["c1".to_string()]).await);
    assert!(stats.get("c2").is_none());
}
