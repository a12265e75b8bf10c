//! Request/response correlation against a scripted host.

mod common;

use std::time::Duration;

use common::*;
use peerdock::correlator::{CommandOptions, Expect};
use peerdock::error::{CommandError, RemoteErrorKind};
use peerdock::events::ClientEvent;
use peerdock::protocol::{BroadcastKind, Envelope};
use serde_json::json;

#[tokio::test]
async fn tagged_replies_settle_their_own_requests() {
    let h = Harness::new();
    let (id, mut host) = h.connect(TOPIC_A).await;
    host.expect_command("listContainers", WAIT).await.unwrap();
    let remote = h.manager.remote(&id).unwrap();

    let r1 = remote.clone();
    let first = tokio::spawn(async move {
        r1.execute_short("startContainer", json!({"id": "c1"}), Expect::Any).await
    });
    let first_cmd = host.expect_command("startContainer", WAIT).await.unwrap();

    let r2 = remote.clone();
    let second = tokio::spawn(async move {
        r2.execute_short("stopContainer", json!({"id": "c2"}), Expect::Any).await
    });
    let second_cmd = host.expect_command("stopContainer", WAIT).await.unwrap();

    // Reply in reverse order.
    host.send(&Envelope::success("stopped c2").with_request_id(second_cmd.request_id.unwrap()))
        .await;
    host.send(&Envelope::success("started c1").with_request_id(first_cmd.request_id.unwrap()))
        .await;

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.message(), Some("started c1"));
    assert_eq!(second.message(), Some("stopped c2"));
    assert_eq!(remote.correlator().pending_len(), 0);
}

#[tokio::test]
async fn untagged_replies_settle_in_send_order() {
    let h = Harness::new();
    let (id, mut host) = h.connect(TOPIC_A).await;
    host.expect_command("listContainers", WAIT).await.unwrap();
    let remote = h.manager.remote(&id).unwrap();

    let r1 = remote.clone();
    let first = tokio::spawn(async move { r1.execute_short("pruneImages", json!({}), Expect::Any).await });
    host.expect_command("pruneImages", WAIT).await.unwrap();
    let r2 = remote.clone();
    let second = tokio::spawn(async move { r2.execute_short("pruneVolumes", json!({}), Expect::Any).await });
    host.expect_command("pruneVolumes", WAIT).await.unwrap();

    host.send(&Envelope::success("one")).await;
    host.send(&Envelope::success("two")).await;

    assert_eq!(first.await.unwrap().unwrap().message(), Some("one"));
    assert_eq!(second.await.unwrap().unwrap().message(), Some("two"));
}

#[tokio::test]
async fn fragment_skips_unrelated_progress() {
    let h = Harness::new();
    let (id, mut host) = h.connect(TOPIC_A).await;
    let remote = h.manager.remote(&id).unwrap();

    let r = remote.clone();
    let pull = tokio::spawn(async move {
        r.execute_long("pullImage", json!({"image": "alpine"}), Expect::fragment("Pull complete"))
            .await
    });
    host.expect_command("pullImage", WAIT).await.unwrap();

    host.send(&Envelope::success("Downloading layer 1/3")).await;
    host.send(&Envelope::success("alpine: Pull complete")).await;

    let response = pull.await.unwrap().unwrap();
    assert_eq!(response.message(), Some("alpine: Pull complete"));
}

#[tokio::test]
async fn typed_expectation_settles_and_updates_cache() {
    let h = Harness::new();
    let (id, mut host) = h.connect(TOPIC_A).await;
    let remote = h.manager.remote(&id).unwrap();

    let r = remote.clone();
    let list = tokio::spawn(async move {
        r.execute_short("listImages", json!({}), Expect::kind(BroadcastKind::Images))
            .await
    });
    host.expect_command("listImages", WAIT).await.unwrap();
    host.send(&Envelope::typed("images", json!([{"Id": "sha256:abc"}])))
        .await;

    let response = list.await.unwrap().unwrap();
    assert_eq!(response.envelope.data, json!([{"Id": "sha256:abc"}]));
    assert_eq!(
        remote.listings().get(&BroadcastKind::Images),
        Some(json!([{"Id": "sha256:abc"}]))
    );
}

#[tokio::test]
async fn timeout_then_late_reply_is_ignored() {
    let h = Harness::new();
    let (id, mut host) = h.connect(TOPIC_A).await;
    host.expect_command("listContainers", WAIT).await.unwrap();
    let remote = h.manager.remote(&id).unwrap();

    let opts = CommandOptions::new(Expect::Any, Duration::from_millis(50));
    let r = remote.clone();
    let slow = tokio::spawn(async move { r.correlator().execute("restartContainer", json!({}), opts).await });
    let slow_cmd = host.expect_command("restartContainer", WAIT).await.unwrap();

    let err = slow.await.unwrap().unwrap_err();
    assert!(matches!(err, CommandError::Timeout(_)));
    assert!(err.is_recoverable());
    assert_eq!(remote.correlator().pending_len(), 0);

    // The host finishes anyway; nobody is waiting for it.
    host.send(&Envelope::success("restarted").with_request_id(slow_cmd.request_id.unwrap()))
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let r = remote.clone();
    let next = tokio::spawn(async move { r.execute_short("inspectContainer", json!({}), Expect::Any).await });
    let next_cmd = host.expect_command("inspectContainer", WAIT).await.unwrap();
    host.send(&Envelope::success("inspected").with_request_id(next_cmd.request_id.unwrap()))
        .await;
    assert_eq!(next.await.unwrap().unwrap().message(), Some("inspected"));
}

#[tokio::test]
async fn remote_failure_is_classified() {
    let h = Harness::new();
    let (id, mut host) = h.connect(TOPIC_A).await;
    let remote = h.manager.remote(&id).unwrap();
    let mut events = h.manager.subscribe();

    let r = remote.clone();
    let remove = tokio::spawn(async move {
        r.execute_short("removeImage", json!({"id": "alpine"}), Expect::Any).await
    });
    let cmd = host.expect_command("removeImage", WAIT).await.unwrap();
    host.send(
        &Envelope::failure("image is being used by running container 1234")
            .with_request_id(cmd.request_id.unwrap()),
    )
    .await;

    match remove.await.unwrap().unwrap_err() {
        CommandError::Remote { kind, message } => {
            assert_eq!(kind, RemoteErrorKind::ResourceInUse);
            assert!(message.contains("is being used"));
        }
        other => panic!("expected remote error, got {other:?}"),
    }

    let event = wait_for(&mut events, |e| matches!(e, ClientEvent::RemoteError { .. })).await;
    assert!(event.is_some(), "remote errors are published too");
}

#[tokio::test]
async fn refresh_follows_settled_command() {
    let h = Harness::new();
    let (id, mut host) = h.connect(TOPIC_A).await;
    host.expect_command("listContainers", WAIT).await.unwrap();
    let remote = h.manager.remote(&id).unwrap();

    let opts = CommandOptions::new(Expect::Any, Duration::from_secs(2)).refresh("listContainers");
    let r = remote.clone();
    let stop = tokio::spawn(async move { r.correlator().execute("stopContainer", json!({"id": "c1"}), opts).await });
    let cmd = host.expect_command("stopContainer", WAIT).await.unwrap();
    host.send(&Envelope::success("stopped").with_request_id(cmd.request_id.unwrap()))
        .await;

    stop.await.unwrap().unwrap();
    assert!(host.expect_command("listContainers", WAIT).await.is_some());
}

#[tokio::test]
async fn peer_loss_fails_pending_requests() {
    let h = Harness::new();
    let (id, mut host) = h.connect(TOPIC_A).await;
    let remote = h.manager.remote(&id).unwrap();

    let r = remote.clone();
    let pending = tokio::spawn(async move { r.execute_long("buildImage", json!({}), Expect::Any).await });
    host.expect_command("buildImage", WAIT).await.unwrap();
    host.close();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, CommandError::Transport(_)));
}

#[tokio::test]
async fn execute_without_peer_is_transport_error() {
    let h = Harness::new();
    let id = h.manager.add_connection(TOPIC_A, None).unwrap();
    let remote = h.manager.remote(&id).unwrap();

    let err = remote
        .execute_short("listImages", json!({}), Expect::Any)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::Transport(_)));
    assert_eq!(err.code(), "transport");
}

#[tokio::test]
async fn manager_execute_targets_active_connection() {
    let h = Harness::new();
    let (_a, mut host_a) = h.connect(TOPIC_A).await;
    let (b, mut host_b) = h.connect(TOPIC_B).await;
    h.manager.switch_active(&b).unwrap();

    let manager = h.manager.clone();
    let call = tokio::spawn(async move {
        manager
            .execute("listNetworks", json!({}), CommandOptions::new(Expect::Any, WAIT))
            .await
    });
    let cmd = host_b.expect_command("listNetworks", WAIT).await.unwrap();
    host_b
        .send(&Envelope::success("networks").with_request_id(cmd.request_id.unwrap()))
        .await;
    assert_eq!(call.await.unwrap().unwrap().message(), Some("networks"));

    assert!(host_a
        .expect_command("listNetworks", Duration::from_millis(100))
        .await
        .is_none());
}

#[tokio::test]
async fn tagged_progress_does_not_settle_fragment_request() {
    let h = Harness::new();
    let (id, mut host) = h.connect(TOPIC_A).await;
    let remote = h.manager.remote(&id).unwrap();

    let r = remote.clone();
    let pull = tokio::spawn(async move {
        r.execute_long("pullImage", json!({"image": "alpine"}), Expect::fragment("Pull complete"))
            .await
    });
    let cmd = host.expect_command("pullImage", WAIT).await.unwrap();
    let request_id = cmd.request_id.unwrap();

    host.send(&Envelope::success("Downloading layer 1/3").with_request_id(request_id.clone()))
        .await;
    host.send(&Envelope::success("alpine: Pull complete").with_request_id(request_id))
        .await;

    let response = pull.await.unwrap().unwrap();
    assert_eq!(response.message(), Some("alpine: Pull complete"));
}

#[tokio::test]
async fn shutdown_fails_pending_requests() {
    let h = Harness::new();
    let (id, mut host) = h.connect(TOPIC_A).await;
    let remote = h.manager.remote(&id).unwrap();

    let r = remote.clone();
    let pending = tokio::spawn(async move { r.execute_long("buildImage", json!({}), Expect::Any).await });
    host.expect_command("buildImage", WAIT).await.unwrap();
    h.manager.shutdown();

    let err = tokio::time::timeout(WAIT, pending)
        .await
        .expect("settled before the long timeout")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, CommandError::Transport(_)));
    assert_eq!(remote.correlator().pending_len(), 0);
}
