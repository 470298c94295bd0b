#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use broadcastd::Error;
use broadcastd::broadcast::{Broadcast, ChannelSubscriber};
use broadcastd::client::Comment;
use broadcastd::config::RelayConfig;
use broadcastd::stream::StreamState;
use common::*;

const WAIT: Duration = Duration::from_secs(10);

fn broadcast(dir: &std::path::Path, remote: Arc<MockRemote>) -> Broadcast {
    let credentials = MockCredentials::with_account("alice", "pw", None);
    credentials.add_account("bob", "pw", None);

    Broadcast::new(
        ["alice".to_string(), "bob".to_string()],
        settings(&idle_encoder(dir), fast_timings()),
        &RelayConfig::default(),
        Arc::new(MockConnector(remote)),
        credentials,
        None,
    )
}

#[tokio::test]
async fn test_start_all_and_stop_all() {
    let dir = tempfile::tempdir().unwrap();
    let remote = MockRemote::new(PasswordMode::Accept);
    let broadcast = broadcast(dir.path(), remote.clone());

    assert!(!broadcast.is_live());
    assert!(matches!(
        broadcast.stop_all().await,
        Err(Error::AlreadyStopped(_))
    ));

    broadcast.start_all().await.unwrap();
    assert!(broadcast.is_live());
    assert!(matches!(
        broadcast.start_all().await,
        Err(Error::AlreadyStarted(_))
    ));

    assert!(
        wait_for(WAIT, || broadcast
            .statuses()
            .iter()
            .all(|s| s.state == StreamState::Streaming))
        .await
    );
    let names: Vec<String> = broadcast.statuses().into_iter().map(|s| s.name).collect();
    assert_eq!(names, ["alice", "bob"]);

    broadcast.stop_all().await.unwrap();
    assert!(!broadcast.is_live());
    for status in broadcast.statuses() {
        assert!(!status.running);
        assert_eq!(status.state, StreamState::Ready);
    }
    // Both broadcasts were ended during the drain.
    for id in remote.created() {
        assert_eq!(remote.count(&format!("end:{id}")), 1);
    }
    assert_eq!(remote.created().len(), 2);
}

#[tokio::test]
async fn test_unknown_stream_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let broadcast = broadcast(dir.path(), MockRemote::new(PasswordMode::Accept));

    assert!(matches!(
        broadcast.start_stream("carol").await,
        Err(Error::StreamNotFound(name)) if name == "carol"
    ));
    assert!(matches!(
        broadcast.put_security_code("carol", "1"),
        Err(Error::StreamNotFound(_))
    ));
    assert!(matches!(broadcast.status("carol"), Err(Error::StreamNotFound(_))));
    assert!(!broadcast.put_security_code("bob", "1").unwrap());
}

#[tokio::test]
async fn test_single_stream_control_is_independent() {
    let dir = tempfile::tempdir().unwrap();
    let broadcast = broadcast(dir.path(), MockRemote::new(PasswordMode::Accept));

    broadcast.start_stream("bob").await.unwrap();
    assert!(broadcast.status("bob").unwrap().running);
    assert!(!broadcast.status("alice").unwrap().running);
    assert!(!broadcast.is_live());

    broadcast.stop_stream("bob").await.unwrap();
    assert!(!broadcast.status("bob").unwrap().running);
}

#[tokio::test]
async fn test_relay_through_aggregate() {
    let dir = tempfile::tempdir().unwrap();
    let broadcast = broadcast(dir.path(), MockRemote::new(PasswordMode::Accept));
    let (subscriber, mut rx) = ChannelSubscriber::channel(4);
    let id = broadcast.subscribe(Arc::new(subscriber));

    let comment = Comment {
        id: "c1".to_string(),
        broadcast_id: 7,
        author: "viewer".to_string(),
        text: "hello".to_string(),
        created_at: 1,
    };
    assert!(broadcast.relay_comment("bob", comment.clone()).is_fresh());
    assert!(!broadcast.relay_comment("alice", comment).is_fresh());

    let relayed = rx.try_recv().unwrap();
    assert_eq!(relayed.account, "bob");
    assert!(rx.try_recv().is_err());
    assert_eq!(broadcast.recent_comments().len(), 1);

    assert!(broadcast.unsubscribe(id));
    assert!(!broadcast.unsubscribe(id));
}

#[tokio::test]
async fn test_status_readable_while_stopping_all() {
    let dir = tempfile::tempdir().unwrap();
    let broadcast = broadcast(dir.path(), MockRemote::new(PasswordMode::Accept));

    broadcast.start_all().await.unwrap();
    assert!(wait_for(WAIT, || encoder_runs(dir.path()) == 2).await);

    // The idle encoders ignore the quit sequence, so the drain lasts at
    // least the grace period.
    let drain = broadcast.stop_all();
    tokio::pin!(drain);
    let during = tokio::select! {
        _ = &mut drain => panic!("drain finished before the grace period"),
        _ = tokio::time::sleep(Duration::from_millis(100)) => {
            (broadcast.is_live(), broadcast.statuses().len())
        }
    };
    assert_eq!(during, (false, 2));

    drain.await.unwrap();
    assert!(!broadcast.is_live());
}
