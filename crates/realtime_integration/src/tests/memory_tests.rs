use super::*;
use shared::domain::UserId;
use std::time::Duration;

fn options(topic: &str, key: &str) -> PresenceChannelOptions {
    PresenceChannelOptions {
        topic: topic.to_string(),
        presence_key: key.to_string(),
    }
}

fn payload(user_id: &str, user_name: &str, is_muted: bool) -> PresencePayload {
    PresencePayload {
        user_id: UserId::new(user_id),
        user_name: user_name.to_string(),
        is_muted,
    }
}

async fn next_sync(rx: &mut broadcast::Receiver<PresenceEvent>) -> PresenceState {
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let PresenceEvent::Sync(state) = rx.recv().await.expect("event") {
                break state;
            }
        }
    })
    .await
    .expect("sync timeout")
}

#[tokio::test]
async fn track_broadcasts_join_then_full_sync_to_other_subscribers() {
    let hub = InMemoryPresenceHub::new();
    let observer = hub
        .subscribe(options("voice:general", "u2"))
        .await
        .expect("observer");
    let mut rx = observer.subscribe_events();

    let alice = hub
        .subscribe(options("voice:general", "u1"))
        .await
        .expect("alice");
    alice
        .track(payload("u1", "Alice", false))
        .await
        .expect("track");

    match rx.recv().await.expect("join") {
        PresenceEvent::Join(diff) => {
            assert_eq!(diff.key, "u1");
            assert_eq!(diff.presences.len(), 1);
        }
        other => panic!("expected join, got {other:?}"),
    }
    let state = next_sync(&mut rx).await;
    let metas = state.metas().collect::<Vec<_>>();
    assert_eq!(metas.len(), 1);
    assert_eq!(metas[0].payload, payload("u1", "Alice", false));
}

#[tokio::test]
async fn retracking_replaces_own_entry_instead_of_duplicating() {
    let hub = InMemoryPresenceHub::new();
    let alice = hub
        .subscribe(options("voice:general", "u1"))
        .await
        .expect("alice");

    alice.track(payload("u1", "Alice", false)).await.expect("track");
    alice.track(payload("u1", "Alice", true)).await.expect("retrack");

    let state = hub.presence_state("voice:general").await;
    let metas = state.metas().collect::<Vec<_>>();
    assert_eq!(metas.len(), 1);
    assert!(metas[0].payload.is_muted);
}

#[tokio::test]
async fn same_key_from_two_clients_keeps_both_entries_until_one_untracks() {
    let hub = InMemoryPresenceHub::new();
    let laptop = hub.subscribe(options("voice:general", "u1")).await.expect("laptop");
    let phone = hub.subscribe(options("voice:general", "u1")).await.expect("phone");

    laptop.track(payload("u1", "Alice", false)).await.expect("laptop track");
    phone.track(payload("u1", "Alice", true)).await.expect("phone track");
    assert_eq!(hub.presence_state("voice:general").await.0["u1"].len(), 2);

    phone.untrack().await.expect("untrack");
    let state = hub.presence_state("voice:general").await;
    assert_eq!(state.0["u1"].len(), 1);
    assert!(!state.0["u1"][0].payload.is_muted);
}

#[tokio::test]
async fn unsubscribe_removes_entry_and_rejects_later_tracks() {
    let hub = InMemoryPresenceHub::new();
    let alice = hub.subscribe(options("voice:general", "u1")).await.expect("alice");
    let mut rx = alice.subscribe_events();

    alice.track(payload("u1", "Alice", false)).await.expect("track");
    let _ = next_sync(&mut rx).await;

    alice.unsubscribe().await.expect("unsubscribe");
    match rx.recv().await.expect("leave") {
        PresenceEvent::Leave(diff) => assert_eq!(diff.key, "u1"),
        other => panic!("expected leave, got {other:?}"),
    }
    assert!(next_sync(&mut rx).await.is_empty());
    assert!(alice.track(payload("u1", "Alice", false)).await.is_err());
}

#[tokio::test]
async fn topics_are_isolated() {
    let hub = InMemoryPresenceHub::new();
    let general = hub.subscribe(options("voice:general", "u1")).await.expect("general");
    let _lounge = hub.subscribe(options("voice:lounge", "u2")).await.expect("lounge");

    general.track(payload("u1", "Alice", false)).await.expect("track");

    assert!(hub.presence_state("voice:lounge").await.is_empty());
    assert!(hub.presence_state("voice:unknown").await.is_empty());
}

#[tokio::test]
async fn unreachable_hub_rejects_subscriptions() {
    let hub = InMemoryPresenceHub::new();
    hub.set_unreachable(true);
    assert!(hub.subscribe(options("voice:general", "u1")).await.is_err());

    hub.set_unreachable(false);
    assert!(hub.subscribe(options("voice:general", "u1")).await.is_ok());
}

#[tokio::test]
async fn dropped_topic_closes_event_streams() {
    let hub = InMemoryPresenceHub::new();
    let alice = hub.subscribe(options("voice:general", "u1")).await.expect("alice");
    let mut rx = alice.subscribe_events();

    hub.drop_topic("voice:general").await;

    assert!(matches!(
        rx.recv().await,
        Err(broadcast::error::RecvError::Closed)
    ));
    assert!(alice.track(payload("u1", "Alice", false)).await.is_err());
    assert!(alice.untrack().await.is_ok());
}

#[tokio::test]
async fn simulated_microphone_records_constraints_and_issues_tracks() {
    let devices = SimulatedAudioDevices::granting();
    let stream = devices
        .get_user_audio(AudioConstraints::voice())
        .await
        .expect("stream");

    assert_eq!(devices.requests().await, vec![AudioConstraints::voice()]);
    let issued = devices.issued_tracks().await;
    assert_eq!(issued.len(), 1);
    assert!(stream.is_enabled());

    stream.set_enabled(false);
    assert!(!issued[0].is_enabled());
    stream.stop_all();
    assert!(issued[0].is_stopped());
}

#[tokio::test]
async fn denying_microphone_returns_configured_error() {
    let devices = SimulatedAudioDevices::denying(MediaError::PermissionDenied);
    let err = devices
        .get_user_audio(AudioConstraints::voice())
        .await
        .expect_err("denied");

    assert_eq!(err, MediaError::PermissionDenied);
    assert!(devices.issued_tracks().await.is_empty());
}
