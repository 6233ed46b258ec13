mod common;

use common::{object, wait_until, TestServer};
use concave_client::{LiveQuery, LiveQueryOptions, NoopCoordinator, QueryStatus};
use serde_json::json;
use std::sync::Arc;

fn query(server: &Arc<TestServer>, resource: &str) -> (LiveQuery, tokio::sync::watch::Sender<bool>) {
    let (online_tx, online_rx) = concave_client::online_channel(true);
    let client = Arc::new(server.client(resource));
    let query = LiveQuery::new(client, LiveQueryOptions::new(resource), Arc::new(NoopCoordinator), online_rx);
    (query, online_tx)
}

#[tokio::test]
async fn snapshot_then_live_updates_reach_all_observers() {
    let server = TestServer::new();
    server.seed("todos", object(json!({"title": "pre-existing", "completed": false}))).await;

    let (alice, _a_online) = query(&server, "todos");
    let (bob, _b_online) = query(&server, "todos");

    wait_until(|| alice.get_snapshot().status == QueryStatus::Live).await;
    wait_until(|| bob.get_snapshot().status == QueryStatus::Live).await;
    wait_until(|| alice.get_snapshot().items.len() == 1).await;
    wait_until(|| bob.get_snapshot().items.len() == 1).await;

    // a server-side mutation fans out to both
    let id = alice.get_snapshot().items[0]["id"].as_str().unwrap().to_string();
    server.server_update("todos", &id, object(json!({"completed": true}))).await;
    wait_until(|| alice.get_snapshot().items[0]["completed"] == true).await;
    wait_until(|| bob.get_snapshot().items[0]["completed"] == true).await;

    server.server_delete("todos", &id).await;
    wait_until(|| alice.get_snapshot().items.is_empty()).await;
    wait_until(|| bob.get_snapshot().items.is_empty()).await;

    alice.destroy();
    bob.destroy();
}

#[tokio::test]
async fn optimistic_create_settles_without_ghosts() {
    let server = TestServer::new();
    let (alice, _a_online) = query(&server, "todos");
    let (bob, _b_online) = query(&server, "todos");
    wait_until(|| alice.get_snapshot().status == QueryStatus::Live).await;
    wait_until(|| bob.get_snapshot().status == QueryStatus::Live).await;

    let optimistic_id = alice.create(object(json!({"title": "from alice"}))).await.unwrap();
    assert!(optimistic_id.starts_with("optimistic_"));

    // alice converges on exactly one item under the server identity
    wait_until(|| {
        let items = alice.get_snapshot().items.clone();
        items.len() == 1 && items[0]["id"].as_str().unwrap_or("").starts_with("srv_")
    })
    .await;

    // bob sees the same single item via plain fan-out
    wait_until(|| bob.get_snapshot().items.len() == 1).await;
    assert_eq!(bob.get_snapshot().items[0]["title"], "from alice");

    alice.destroy();
    bob.destroy();
}

#[tokio::test]
async fn filtered_subscription_only_sees_matches() {
    let server = TestServer::new();
    let (online_tx, online_rx) = concave_client::online_channel(true);
    let client = Arc::new(server.client("todos"));
    let done_only = LiveQuery::new(
        client,
        LiveQueryOptions::new("todos").filter(r#"{"completed": true}"#),
        Arc::new(NoopCoordinator),
        online_rx,
    );
    let _online = online_tx;
    wait_until(|| done_only.get_snapshot().status == QueryStatus::Live).await;

    let open = server.seed("todos", object(json!({"title": "open", "completed": false}))).await;
    let done = server.seed("todos", object(json!({"title": "done", "completed": true}))).await;

    wait_until(|| done_only.get_snapshot().items.len() == 1).await;
    assert_eq!(done_only.get_snapshot().items[0]["id"], done.as_str());

    // the open item enters the filter on update
    server.server_update("todos", &open, object(json!({"completed": true}))).await;
    wait_until(|| done_only.get_snapshot().items.len() == 2).await;

    // and leaves it again
    server.server_update("todos", &done, object(json!({"completed": false}))).await;
    wait_until(|| done_only.get_snapshot().items.len() == 1).await;
    assert_eq!(done_only.get_snapshot().items[0]["id"], open.as_str());

    done_only.destroy();
}
