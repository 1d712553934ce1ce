//! Two hub servers joined through an in-memory backplane.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::TestClient;
use hubwire::connection::ConnectionInfo;
use hubwire::{
    BackplaneHubLifetimeManager, BackplaneOptions, HubMethods, HubReturn, HubServer,
    InMemoryBackplane, LifetimeError, MethodSpec, ParamType, ProtocolRegistry,
};

const QUIET: Duration = Duration::from_millis(150);

struct Node {
    server: HubServer,
    lifetime: BackplaneHubLifetimeManager,
}

async fn node(bus: &InMemoryBackplane, name: &str) -> Node {
    let lifetime = BackplaneHubLifetimeManager::new(
        Arc::new(bus.client()),
        ProtocolRegistry::from_names(&["json", "messagepack"]).unwrap(),
        BackplaneOptions {
            prefix: "chat".to_string(),
            server_name: name.to_string(),
            ack_timeout: Duration::from_millis(300),
        },
    )
    .await
    .unwrap();

    let methods = HubMethods::builder()
        .method("Broadcast", MethodSpec::new(vec![ParamType::String]), |ctx, args| async move {
            ctx.clients().all().send("Broadcast", args).await?;
            Ok(HubReturn::Void)
        })
        .method(
            "AddOther",
            MethodSpec::new(vec![ParamType::String, ParamType::String]),
            |ctx, args| async move {
                let connection_id = args[0].as_str().unwrap_or_default().to_string();
                let group = args[1].as_str().unwrap_or_default().to_string();
                ctx.groups().add_to_group(&connection_id, &group).await?;
                ctx.clients().group(group).send("Added", vec![json!(connection_id)]).await?;
                Ok(HubReturn::Void)
            },
        )
        .build();
    let server = HubServer::builder()
        .methods(methods)
        .lifetime(Arc::new(lifetime.clone()))
        .build()
        .unwrap();
    Node { server, lifetime }
}

async fn connect(node: &Node, id: &str, protocol: &str) -> TestClient {
    let info = ConnectionInfo::for_user(format!("user-{id}")).with_connection_id(id);
    let mut client = TestClient::connect_as(node.server.handler(), info, protocol).await;
    client.ready().await;
    client
}

#[tokio::test]
async fn test_remote_group_add_is_visible_to_next_group_send() {
    let bus = InMemoryBackplane::new();
    let a = node(&bus, "a").await;
    let b = node(&bus, "b").await;
    let mut c1 = connect(&b, "c1", "json").await;

    // c1 lives on b; the add from a must be acked before it returns.
    let hub = a.server.context();
    hub.groups().add_to_group("c1", "g").await.unwrap();
    assert_eq!(a.lifetime.pending_acks(), 0);
    assert_eq!(b.lifetime.registry().group_member_ids("g"), vec!["c1".to_string()]);

    hub.clients().group("g").send("M", vec![json!("hello")]).await.unwrap();
    let received = c1.invocation().await;
    assert_eq!(received.target, "M");
    assert_eq!(received.arguments, vec![json!("hello")]);

    hub.groups().remove_from_group("c1", "g").await.unwrap();
    hub.clients().group("g").send("M", vec![json!("gone")]).await.unwrap();
    assert!(c1.is_quiet(QUIET).await);
}

#[tokio::test]
async fn test_hub_method_adds_connection_on_other_server() {
    let bus = InMemoryBackplane::new();
    let a = node(&bus, "a").await;
    let b = node(&bus, "b").await;
    let mut c1 = connect(&b, "c1", "json").await;
    let mut c2 = connect(&a, "c2", "messagepack").await;

    c2.invoke("1", "AddOther", vec![json!("c1"), json!("room")]).await;
    assert!(c2.completion().await.error().is_none());

    let added = c1.invocation().await;
    assert_eq!(added.target, "Added");
    assert_eq!(added.arguments, vec![json!("c1")]);
}

#[tokio::test]
async fn test_broadcast_reaches_both_servers_in_each_protocol() {
    let bus = InMemoryBackplane::new();
    let a = node(&bus, "a").await;
    let b = node(&bus, "b").await;
    let mut c1 = connect(&b, "c1", "json").await;
    let mut c2 = connect(&a, "c2", "messagepack").await;

    c2.invoke("1", "Broadcast", vec![json!("hi all")]).await;

    // c2 gets its own broadcast and the completion, in either order.
    let mut saw_broadcast = false;
    let mut saw_completion = false;
    while !(saw_broadcast && saw_completion) {
        match c2.next().await {
            Some(hubwire::HubMessage::Invocation(inv)) => {
                assert_eq!(inv.arguments, vec![json!("hi all")]);
                saw_broadcast = true;
            }
            Some(hubwire::HubMessage::Completion(completion)) => {
                assert!(completion.error().is_none());
                saw_completion = true;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(c1.invocation().await.arguments, vec![json!("hi all")]);
}

#[tokio::test]
async fn test_user_and_connection_sends_cross_servers() {
    let bus = InMemoryBackplane::new();
    let a = node(&bus, "a").await;
    let b = node(&bus, "b").await;
    let mut c1 = connect(&b, "c1", "json").await;
    let hub = a.server.context();

    hub.clients().user("user-c1").send("ToUser", vec![]).await.unwrap();
    assert_eq!(c1.invocation().await.target, "ToUser");

    hub.clients().client("c1").send("ToConnection", vec![]).await.unwrap();
    assert_eq!(c1.invocation().await.target, "ToConnection");
}

#[tokio::test]
async fn test_all_except_crosses_servers() {
    let bus = InMemoryBackplane::new();
    let a = node(&bus, "a").await;
    let b = node(&bus, "b").await;
    let mut c1 = connect(&b, "c1", "json").await;
    let mut c2 = connect(&b, "c2", "json").await;

    a.server
        .context()
        .clients()
        .all_except(vec!["c1".to_string()])
        .send("M", vec![])
        .await
        .unwrap();

    assert_eq!(c2.invocation().await.target, "M");
    assert!(c1.is_quiet(QUIET).await);
}

#[tokio::test]
async fn test_disconnect_drops_remote_group_membership() {
    let bus = InMemoryBackplane::new();
    let a = node(&bus, "a").await;
    let b = node(&bus, "b").await;
    let mut c1 = connect(&b, "c1", "json").await;
    a.server.context().groups().add_to_group("c1", "g").await.unwrap();

    c1.hang_up().await;
    c1.finished().await;

    assert!(!b.lifetime.registry().has_group("g"));
    // The connection is gone, so nobody acks a change for it.
    let err = a
        .server
        .context()
        .groups()
        .add_to_group("c1", "g")
        .await
        .unwrap_err();
    assert!(matches!(err, LifetimeError::Backplane(_)), "got {err:?}");
}
