mod common;

use common::{object, wait_until, TestServer};
use concave_client::{LiveQuery, LiveQueryOptions, NoopCoordinator, QueryStatus};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn catch_up_replays_missed_events_after_stream_drop() {
    let server = TestServer::new();
    let client = Arc::new(server.client("todos"));
    let (online_tx, online_rx) = concave_client::online_channel(true);
    let query = LiveQuery::new(client.clone(), LiveQueryOptions::new("todos"), Arc::new(NoopCoordinator), online_rx);
    let _online = online_tx;

    let first = server.seed("todos", object(json!({"title": "first"}))).await;
    wait_until(|| query.get_snapshot().items.len() == 1).await;

    // connection dies; mutations happen while we're away
    client.drop_stream();
    let second = server.seed("todos", object(json!({"title": "second"}))).await;
    server.server_update("todos", &first, object(json!({"title": "first (edited)"}))).await;

    // the pump reconnects with resume_from and replays exactly the gap
    wait_until(|| query.get_snapshot().items.len() == 2).await;
    let items = query.get_snapshot().items.clone();
    let edited = items.iter().find(|i| i["id"] == first.as_str()).unwrap();
    assert_eq!(edited["title"], "first (edited)");
    assert!(items.iter().any(|i| i["id"] == second.as_str()));

    query.destroy();
}

#[tokio::test]
async fn truncated_log_invalidates_and_resnapshots() {
    // retention of 2 guarantees the cursor falls off during the outage
    let server = TestServer::with_retention(2);
    let client = Arc::new(server.client("todos"));
    let (online_tx, online_rx) = concave_client::online_channel(true);
    let query = LiveQuery::new(client.clone(), LiveQueryOptions::new("todos"), Arc::new(NoopCoordinator), online_rx);
    let _online = online_tx;

    server.seed("todos", object(json!({"title": "t1"}))).await;
    wait_until(|| query.get_snapshot().items.len() == 1).await;

    client.drop_stream();
    for i in 2..=6 {
        server.seed("todos", object(json!({"title": format!("t{i}")}))).await;
    }

    // reconnect lands past the retained window: invalidate, then a full
    // refetch rebuilds the cache from the authoritative store
    wait_until(|| query.get_snapshot().items.len() == 6).await;
    assert_eq!(query.get_snapshot().status, QueryStatus::Live);

    query.destroy();
}

#[tokio::test]
async fn offline_to_online_transition_flushes_queued_mutations() {
    let server = TestServer::new();
    let client = Arc::new(server.client("todos"));
    let (online_tx, online_rx) = concave_client::online_channel(false);
    let query = LiveQuery::new(client, LiveQueryOptions::new("todos"), Arc::new(NoopCoordinator), online_rx);

    wait_until(|| query.get_snapshot().status == QueryStatus::Offline).await;

    // queued while offline
    let optimistic_id = query.create(object(json!({"title": "queued"}))).await.unwrap();
    query.update(&optimistic_id, object(json!({"starred": true}))).await.unwrap();
    assert_eq!(query.get_snapshot().items.len(), 1);

    online_tx.send(true).unwrap();
    wait_until(|| query.get_snapshot().status == QueryStatus::Live).await;

    // the create and the dependent update both reached the server
    wait_until(|| {
        let objects = server.bus.changelog().get_since(Some("todos"), 0);
        objects.len() >= 2
    })
    .await;
    wait_until(|| {
        let items = query.get_snapshot().items.clone();
        items.len() == 1 && items[0]["id"].as_str().unwrap_or("").starts_with("srv_") && items[0]["starred"] == true
    })
    .await;

    query.destroy();
}
