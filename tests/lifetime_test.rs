//! Group, user and exclusion fan-out across live connections.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use common::TestClient;
use hubwire::connection::ConnectionInfo;
use hubwire::{DefaultHubLifetimeManager, HubMethods, HubReturn, HubServer, MethodSpec, ParamType};

const QUIET: Duration = Duration::from_millis(150);

fn group_arg(args: &[Value]) -> String {
    args[0].as_str().unwrap_or_default().to_string()
}

fn server(lifetime: Arc<DefaultHubLifetimeManager>) -> HubServer {
    let methods = HubMethods::builder()
        .method("Join", MethodSpec::new(vec![ParamType::String]), |ctx, args| async move {
            ctx.groups().add_to_group(ctx.connection_id(), &group_arg(&args)).await?;
            Ok(HubReturn::Void)
        })
        .method("Leave", MethodSpec::new(vec![ParamType::String]), |ctx, args| async move {
            ctx.groups().remove_from_group(ctx.connection_id(), &group_arg(&args)).await?;
            Ok(HubReturn::Void)
        })
        .method("Shout", MethodSpec::new(vec![ParamType::String]), |ctx, args| async move {
            ctx.clients().others().send("Shout", args).await?;
            Ok(HubReturn::Void)
        })
        .method("Reply", MethodSpec::new(vec![ParamType::String]), |ctx, args| async move {
            ctx.clients().caller().send("Reply", args).await?;
            Ok(HubReturn::Void)
        })
        .build();
    HubServer::builder()
        .methods(methods)
        .lifetime(lifetime)
        .build()
        .unwrap()
}

async fn connect(server: &HubServer, info: ConnectionInfo) -> TestClient {
    let mut client = TestClient::connect_as(server.handler(), info, "json").await;
    client.ready().await;
    client
}

#[tokio::test]
async fn test_group_send_stops_after_removal() {
    let lifetime = Arc::new(DefaultHubLifetimeManager::new());
    let server = server(Arc::clone(&lifetime));
    let mut c1 = connect(&server, ConnectionInfo::default().with_connection_id("c1")).await;
    let hub = server.context();

    hub.groups().add_to_group("c1", "g").await.unwrap();
    hub.clients().group("g").send("M", vec![json!("before")]).await.unwrap();
    let received = c1.invocation().await;
    assert_eq!(received.target, "M");
    assert_eq!(received.arguments, vec![json!("before")]);

    hub.groups().remove_from_group("c1", "g").await.unwrap();
    hub.clients().group("g").send("M", vec![json!("after")]).await.unwrap();
    assert!(c1.is_quiet(QUIET).await);
    assert!(!lifetime.registry().has_group("g"));
}

#[tokio::test]
async fn test_join_and_leave_from_hub_method() {
    let lifetime = Arc::new(DefaultHubLifetimeManager::new());
    let server = server(Arc::clone(&lifetime));
    let mut c1 = connect(&server, ConnectionInfo::default().with_connection_id("c1")).await;

    c1.invoke("1", "Join", vec![json!("room")]).await;
    c1.completion().await;
    assert_eq!(lifetime.registry().group_member_ids("room"), vec!["c1".to_string()]);

    c1.invoke("2", "Leave", vec![json!("room")]).await;
    c1.completion().await;
    assert!(!lifetime.registry().has_group("room"));
}

#[tokio::test]
async fn test_disconnect_leaves_every_group() {
    let lifetime = Arc::new(DefaultHubLifetimeManager::new());
    let server = server(Arc::clone(&lifetime));
    let mut c1 = connect(&server, ConnectionInfo::for_user("alice").with_connection_id("c1")).await;
    let hub = server.context();
    hub.groups().add_to_group("c1", "a").await.unwrap();
    hub.groups().add_to_group("c1", "b").await.unwrap();

    c1.hang_up().await;
    c1.finished().await;

    let registry = lifetime.registry();
    assert!(!registry.contains("c1"));
    assert!(!registry.has_group("a"));
    assert!(!registry.has_group("b"));
    assert!(!registry.has_user("alice"));
}

#[tokio::test]
async fn test_all_except_skips_excluded_connection() {
    let lifetime = Arc::new(DefaultHubLifetimeManager::new());
    let server = server(lifetime);
    let mut c1 = connect(&server, ConnectionInfo::default().with_connection_id("c1")).await;
    let mut c2 = connect(&server, ConnectionInfo::default().with_connection_id("c2")).await;
    let hub = server.context();

    hub.clients()
        .all_except(vec!["c1".to_string()])
        .send("M", vec![json!(1)])
        .await
        .unwrap();

    assert_eq!(c2.invocation().await.arguments, vec![json!(1)]);
    assert!(c1.is_quiet(QUIET).await);
}

#[tokio::test]
async fn test_all_except_holds_during_concurrent_disconnects() {
    let lifetime = Arc::new(DefaultHubLifetimeManager::new());
    let server = server(lifetime);
    let mut c1 = connect(&server, ConnectionInfo::default().with_connection_id("c1")).await;
    let mut others = Vec::new();
    for i in 0..8 {
        others.push(connect(&server, ConnectionInfo::default().with_connection_id(format!("o{i}"))).await);
    }
    let hub = server.context();

    let sender = {
        let hub = hub.clone();
        tokio::spawn(async move {
            for i in 0..50 {
                hub.clients()
                    .all_except(vec!["c1".to_string()])
                    .send("M", vec![json!(i)])
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    for mut other in others {
        other.hang_up().await;
        tokio::spawn(other.finished());
    }
    sender.await.unwrap();

    assert!(c1.is_quiet(QUIET).await);
}

#[tokio::test]
async fn test_user_send_reaches_every_connection_of_user() {
    let lifetime = Arc::new(DefaultHubLifetimeManager::new());
    let server = server(lifetime);
    let mut a1 = connect(&server, ConnectionInfo::for_user("alice")).await;
    let mut a2 = connect(&server, ConnectionInfo::for_user("alice")).await;
    let mut b1 = connect(&server, ConnectionInfo::for_user("bob")).await;

    server
        .context()
        .clients()
        .user("alice")
        .send("Hi", vec![])
        .await
        .unwrap();

    assert_eq!(a1.invocation().await.target, "Hi");
    assert_eq!(a2.invocation().await.target, "Hi");
    assert!(b1.is_quiet(QUIET).await);
}

#[tokio::test]
async fn test_multi_group_send_delivers_once() {
    let lifetime = Arc::new(DefaultHubLifetimeManager::new());
    let server = server(lifetime);
    let mut c1 = connect(&server, ConnectionInfo::default().with_connection_id("c1")).await;
    let hub = server.context();
    hub.groups().add_to_group("c1", "g1").await.unwrap();
    hub.groups().add_to_group("c1", "g2").await.unwrap();

    hub.clients()
        .groups(vec!["g1".to_string(), "g2".to_string()])
        .send("M", vec![])
        .await
        .unwrap();

    assert_eq!(c1.invocation().await.target, "M");
    assert!(c1.is_quiet(QUIET).await);
}

#[tokio::test]
async fn test_caller_and_others() {
    let lifetime = Arc::new(DefaultHubLifetimeManager::new());
    let server = server(lifetime);
    let mut c1 = connect(&server, ConnectionInfo::default().with_connection_id("c1")).await;
    let mut c2 = connect(&server, ConnectionInfo::default().with_connection_id("c2")).await;

    c1.invoke("1", "Shout", vec![json!("hey")]).await;
    assert!(c1.completion().await.error().is_none());
    assert_eq!(c2.invocation().await.arguments, vec![json!("hey")]);
    assert!(c1.is_quiet(QUIET).await);

    c2.invoke("2", "Reply", vec![json!("me")]).await;
    // The reply is queued before the completion.
    let reply = c2.invocation().await;
    assert_eq!(reply.target, "Reply");
    assert!(c2.completion().await.error().is_none());
    assert!(c1.is_quiet(QUIET).await);
}
