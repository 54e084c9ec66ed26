use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::{
    body::{to_bytes, Body, BodyDataStream},
    http::{header::AUTHORIZATION, header::CONTENT_TYPE, Method, Request, StatusCode},
    Router,
};
use dispatch_orders::{DispatchConfig, DispatchService, LocalStore};
use dispatch_server::{
    build_router,
    config::{HttpAuthConfig, ServerConfig},
    ACTOR_HEADER,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::time::timeout;
use tower::ServiceExt;

fn server_config(tokens: &[&str]) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        sse_enabled: true,
        auth: if tokens.is_empty() {
            None
        } else {
            Some(HttpAuthConfig {
                tokens: tokens.iter().map(|t| t.to_string()).collect::<HashSet<_>>(),
            })
        },
        cors: None,
    }
}

fn app(tokens: &[&str]) -> Router {
    app_with(tokens, &DispatchConfig::default())
}

fn app_with(tokens: &[&str], config: &DispatchConfig) -> Router {
    let service = DispatchService::new(Arc::new(LocalStore::new()), config);
    build_router(service, &server_config(tokens))
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    actor: Option<&str>,
    body: Option<Value>,
) -> Result<(StatusCode, Value)> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(actor) = actor {
        builder = builder.header(ACTOR_HEADER, actor);
    }
    let request = match body {
        Some(body) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))?,
        None => builder.body(Body::empty())?,
    };

    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, value))
}

async fn register(app: &Router, actor: &str, role: &str, name: &str) -> Result<Value> {
    let (status, body) = call(
        app,
        Method::POST,
        "/profiles",
        Some(actor),
        Some(json!({ "role": role, "displayName": name })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    Ok(body)
}

async fn create(app: &Router, actor: &str) -> Result<String> {
    let (status, order) = call(
        app,
        Method::POST,
        "/orders",
        Some(actor),
        Some(json!({
            "pickupAddress": "1 Main St",
            "deliveryAddress": "9 Elm St",
            "description": "documents",
            "recipientName": "Bea",
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED, "{order}");
    Ok(order["id"].as_str().unwrap_or_default().to_string())
}

async fn open_events(app: &Router, actor: &str, interest: &str) -> Result<BodyDataStream> {
    let request = Request::builder()
        .uri(format!("/events?interest={interest}"))
        .header(ACTOR_HEADER, actor)
        .body(Body::empty())?;
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(response.into_body().into_data_stream())
}

/// Reads frames until one contains every needle; returns the text read so far.
async fn read_until(events: &mut BodyDataStream, needles: &[&str]) -> Result<String> {
    let mut seen = String::new();
    while !needles.iter().all(|needle| seen.contains(needle)) {
        let chunk = timeout(Duration::from_secs(2), events.next())
            .await
            .map_err(|_| anyhow!("timed out waiting for {needles:?}, got: {seen}"))?
            .ok_or_else(|| anyhow!("event stream ended before {needles:?}"))??;
        seen.push_str(std::str::from_utf8(&chunk)?);
    }
    Ok(seen)
}

#[tokio::test]
async fn test_health_is_open() -> Result<()> {
    let app = app(&["secret"]);
    let (status, body) = call(&app, Method::GET, "/health", None, None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn test_full_delivery_over_http() -> Result<()> {
    let app = app(&[]);
    register(&app, "req", "requester", "Acme").await?;
    let bea = register(&app, "bea", "recipient", "Bea").await?;
    register(&app, "g1", "agent", "Gus").await?;
    register(&app, "g2", "agent", "Gil").await?;

    let order_id = create(&app, "req").await?;

    let (status, pending) = call(&app, Method::GET, "/orders/pending", Some("g2"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending.as_array().map(Vec::len), Some(1));

    let claim_uri = format!("/orders/{order_id}/claim");
    let (status, claimed) = call(&app, Method::POST, &claim_uri, Some("g1"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claimed["status"], "accepted");

    let (status, loser) = call(&app, Method::POST, &claim_uri, Some("g2"), None).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(loser["error"], "already_claimed");

    let complete_uri = format!("/orders/{order_id}/complete");
    let (status, body) = call(&app, Method::POST, &complete_uri, Some("g2"), None).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "not_your_order");

    let (status, delivered) = call(&app, Method::POST, &complete_uri, Some("g1"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(delivered["status"], "delivered");
    assert_eq!(delivered["recipientProfileId"], bea["id"]);

    let (status, mine) = call(&app, Method::GET, "/orders/mine", Some("bea"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(mine[0]["id"], order_id.as_str());

    let (status, body) = call(&app, Method::POST, &complete_uri, Some("g1"), None).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");
    Ok(())
}

#[tokio::test]
async fn test_errors_map_to_statuses() -> Result<()> {
    let app = app(&[]);
    register(&app, "req", "requester", "Acme").await?;
    register(&app, "g1", "agent", "Gus").await?;

    let (status, body) = call(&app, Method::GET, "/orders/pending", None, None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "missing_actor");

    let (status, body) = call(&app, Method::GET, "/orders/mine", Some("ghost"), None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "profile_required");

    let (status, body) = call(&app, Method::GET, "/orders/pending", Some("req"), None).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "authorization_error");

    let (status, body) = call(
        &app,
        Method::POST,
        "/orders",
        Some("req"),
        Some(json!({ "pickupAddress": "", "deliveryAddress": "x", "description": "y" })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, body) = call(&app, Method::GET, "/orders/not-a-uuid", Some("g1"), None).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let missing = format!("/orders/{}", dispatch_orders::OrderId::generate());
    let (status, body) = call(&app, Method::GET, &missing, Some("g1"), None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, body) = call(
        &app,
        Method::POST,
        "/profiles",
        Some("req"),
        Some(json!({ "role": "agent", "displayName": "Again" })),
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "duplicate_profile");
    Ok(())
}

#[tokio::test]
async fn test_session_checks_declared_role() -> Result<()> {
    let app = app(&[]);
    register(&app, "g1", "agent", "Gus").await?;

    let (status, profile) = call(&app, Method::GET, "/session?role=agent", Some("g1"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(profile["displayName"], "Gus");

    let (status, body) =
        call(&app, Method::GET, "/session?role=requester", Some("g1"), None).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "role_mismatch");

    let (status, _) = call(&app, Method::GET, "/session", Some("g1"), None).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_bearer_gate() -> Result<()> {
    let app = app(&["secret"]);

    let (status, body) = call(&app, Method::GET, "/orders/pending", Some("g1"), None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/profiles")
        .header(AUTHORIZATION, "Bearer secret")
        .header(ACTOR_HEADER, "g1")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "role": "agent", "displayName": "Gus" }).to_string(),
        ))?;
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    Ok(())
}

#[tokio::test]
async fn test_event_stream_requires_authorized_interest() -> Result<()> {
    let app = app(&[]);
    register(&app, "req", "requester", "Acme").await?;

    let (status, body) =
        call(&app, Method::GET, "/events?interest=pending", Some("req"), None).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "authorization_error");

    let (status, body) =
        call(&app, Method::GET, "/events?interest=everything", Some("req"), None).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
    Ok(())
}

#[tokio::test]
async fn test_event_stream_delivers_new_orders() -> Result<()> {
    let app = app(&[]);
    register(&app, "req", "requester", "Acme").await?;
    register(&app, "g1", "agent", "Gus").await?;

    let mut events = open_events(&app, "g1", "pending").await?;
    read_until(&mut events, &["ready"]).await?;

    let order_id = create(&app, "req").await?;
    let frame = read_until(&mut events, &["order", order_id.as_str()]).await?;
    assert!(frame.contains("\"kind\":\"created\""), "{frame}");
    Ok(())
}

#[tokio::test]
async fn test_lagging_event_stream_is_told_to_resync() -> Result<()> {
    let mut config = DispatchConfig::default();
    config.notifier.channel_capacity = 1;
    let app = app_with(&[], &config);
    register(&app, "req", "requester", "Acme").await?;
    register(&app, "g1", "agent", "Gus").await?;

    let mut events = open_events(&app, "g1", "pending").await?;
    read_until(&mut events, &["ready"]).await?;

    let first = create(&app, "req").await?;
    create(&app, "req").await?;
    create(&app, "req").await?;

    read_until(&mut events, &["resync", "\"missed\":2"]).await?;
    read_until(&mut events, &["order", first.as_str()]).await?;
    Ok(())
}
