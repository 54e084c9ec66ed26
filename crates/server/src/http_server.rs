use std::{convert::Infallible, net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{Extension, Path, Query},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    },
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use dispatch_orders::{
    ActorId, DispatchError, DispatchService, NewOrderInput, NewProfileInput, Order, OrderEvent,
    OrderId, Profile, Role, Subscription, WatchRequest,
};
use futures_core::Stream;
use futures_util::stream::{self, once, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    auth::{actor_from_headers, declared_role, AuthManager, ACTOR_HEADER, ROLE_HEADER},
    config::{HttpCorsConfig, ServerConfig},
};

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

#[derive(Clone)]
struct HttpState {
    inner: Arc<HttpStateInner>,
}

struct HttpStateInner {
    service: DispatchService,
    auth: Option<AuthManager>,
}

impl HttpState {
    fn new(service: DispatchService, config: &ServerConfig) -> Self {
        let auth = config
            .auth
            .as_ref()
            .map(|cfg| AuthManager::new(cfg.tokens.clone()));
        Self {
            inner: Arc::new(HttpStateInner { service, auth }),
        }
    }

    fn service(&self) -> &DispatchService {
        &self.inner.service
    }

    /// Checks the bearer gate, then returns the actor asserted upstream.
    fn caller(&self, headers: &HeaderMap) -> Result<ActorId, ApiError> {
        if let Some(auth) = &self.inner.auth {
            if !auth.validate(headers.get(AUTHORIZATION)) {
                return Err(ApiError::Unauthorized);
            }
        }
        actor_from_headers(headers).ok_or(ApiError::MissingActor)
    }
}

#[derive(Debug)]
pub(crate) enum ApiError {
    Unauthorized,
    MissingActor,
    Dispatch(DispatchError),
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        Self::Dispatch(err)
    }
}

pub(crate) fn status_for(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
        DispatchError::Authorization { .. } | DispatchError::RoleMismatch { .. } => {
            StatusCode::FORBIDDEN
        }
        DispatchError::ProfileRequired => StatusCode::UNAUTHORIZED,
        DispatchError::NotFound { .. } => StatusCode::NOT_FOUND,
        DispatchError::AlreadyClaimed(_)
        | DispatchError::InvalidTransition { .. }
        | DispatchError::NotYourOrder(_)
        | DispatchError::DuplicateProfile
        | DispatchError::Conflict { .. } => StatusCode::CONFLICT,
        DispatchError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthorized", "message": "missing or invalid token" })),
            )
                .into_response(),
            ApiError::MissingActor => (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "missing_actor",
                    "message": format!("the {ACTOR_HEADER} header is required"),
                })),
            )
                .into_response(),
            ApiError::Dispatch(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    tracing::error!("request failed: {err}");
                } else {
                    tracing::debug!(kind = err.kind(), "request rejected: {err}");
                }
                (
                    status,
                    Json(json!({ "error": err.kind(), "message": err.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

pub fn build_router(service: DispatchService, config: &ServerConfig) -> Router {
    let state = HttpState::new(service, config);

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/profiles", post(register_profile))
        .route("/session", get(session))
        .route("/orders", post(create_order))
        .route("/orders/pending", get(list_pending))
        .route("/orders/mine", get(list_mine))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/claim", post(claim_order))
        .route("/orders/:id/complete", post(complete_order));

    if config.sse_enabled {
        router = router.route("/events", get(events));
    }

    router
        .layer(Extension(state))
        .layer(build_cors_layer(config.cors.as_ref()))
        .layer(TraceLayer::new_for_http())
}

pub async fn run_http_server(service: DispatchService, config: ServerConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.host, config.port))?;

    let router = build_router(service, &config);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind dispatch server to {addr}"))?;

    tracing::info!("dispatch HTTP server listening on {addr}");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server encountered an unrecoverable error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

fn parse_order_id(raw: &str) -> Result<OrderId, ApiError> {
    raw.parse::<OrderId>().map_err(ApiError::from)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "build": dispatch_build_info::build_id(),
    }))
}

async fn register_profile(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Json(input): Json<NewProfileInput>,
) -> Result<(StatusCode, Json<Profile>), ApiError> {
    let actor = state.caller(&headers)?;
    let profile = state.service().register_profile(&actor, input).await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    role: Option<String>,
}

async fn session(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Profile>, ApiError> {
    let actor = state.caller(&headers)?;
    let declared = match query.role.as_deref() {
        Some(raw) => raw.parse::<Role>()?,
        None => declared_role(&headers).ok_or_else(|| {
            DispatchError::Validation(format!("declare a role with ?role= or {ROLE_HEADER}"))
        })??,
    };
    Ok(Json(state.service().sign_in(&actor, declared).await?))
}

async fn create_order(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Json(input): Json<NewOrderInput>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let actor = state.caller(&headers)?;
    let order = state.service().create_order(&actor, input).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn list_pending(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Order>>, ApiError> {
    let actor = state.caller(&headers)?;
    Ok(Json(state.service().list_pending(&actor).await?))
}

async fn list_mine(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Order>>, ApiError> {
    let actor = state.caller(&headers)?;
    Ok(Json(state.service().list_own(&actor).await?))
}

async fn get_order(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let actor = state.caller(&headers)?;
    let order_id = parse_order_id(&id)?;
    Ok(Json(state.service().get_order(&actor, order_id).await?))
}

async fn claim_order(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let actor = state.caller(&headers)?;
    let order_id = parse_order_id(&id)?;
    Ok(Json(state.service().claim(&actor, order_id).await?))
}

async fn complete_order(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let actor = state.caller(&headers)?;
    let order_id = parse_order_id(&id)?;
    Ok(Json(state.service().complete(&actor, order_id).await?))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    interest: Option<String>,
}

pub(crate) fn parse_interest(raw: Option<&str>) -> Result<WatchRequest, DispatchError> {
    match raw.map(str::trim).unwrap_or("mine") {
        "pending" => Ok(WatchRequest::PendingPool),
        "mine" => Ok(WatchRequest::Mine),
        other => match other.strip_prefix("order:") {
            Some(id) => Ok(WatchRequest::Order(id.parse()?)),
            None => Err(DispatchError::Validation(format!(
                "unknown interest '{other}', expected pending, mine or order:<id>"
            ))),
        },
    }
}

async fn events(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<EventStream>, ApiError> {
    let actor = state.caller(&headers)?;
    let request = parse_interest(query.interest.as_deref())?;
    let subscription = state.service().watch(&actor, request).await?;
    tracing::debug!(%actor, ?request, "event stream opened");

    let ready = once(async { Ok::<Event, Infallible>(Event::default().event("ready").data("{}")) });
    let stream: EventStream = Box::pin(ready.chain(subscription_events(subscription)));

    let keep_alive = KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keep-alive");

    Ok(Sse::new(stream).keep_alive(keep_alive))
}

/// Turns a subscription into SSE frames. A `resync` frame tells the client
/// it missed events and must re-list before trusting further updates.
fn subscription_events(
    subscription: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    stream::unfold(subscription, |mut subscription| async move {
        let missed = subscription.take_missed();
        if missed > 0 {
            return Some((Ok(resync_event(missed)), subscription));
        }

        let change = subscription.recv().await?;
        Some((Ok(order_event(&change)), subscription))
    })
}

fn resync_event(missed: u64) -> Event {
    Event::default()
        .event("resync")
        .data(json!({ "missed": missed }).to_string())
}

fn order_event(change: &OrderEvent) -> Event {
    match serde_json::to_string(change) {
        Ok(data) => Event::default().event("order").data(data),
        Err(err) => {
            tracing::error!("Failed to serialize order event: {err}");
            resync_event(1)
        }
    }
}

fn build_cors_layer(config: Option<&HttpCorsConfig>) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            HeaderName::from_static(ACTOR_HEADER),
            HeaderName::from_static(ROLE_HEADER),
        ]);

    if let Some(cors) = config {
        let origins: Vec<HeaderValue> = cors
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        if !origins.is_empty() {
            return layer.allow_origin(AllowOrigin::list(origins));
        }
    }

    layer
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_orders::OrderStatus;

    #[test]
    fn lifecycle_errors_map_to_conflict() {
        let id = OrderId::generate();
        assert_eq!(
            status_for(&DispatchError::AlreadyClaimed(id)),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&DispatchError::InvalidTransition {
                order_id: id,
                from: OrderStatus::Delivered,
                to: OrderStatus::Delivered,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&DispatchError::denied(Role::Agent, "create orders")),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&DispatchError::ProfileRequired),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&DispatchError::Unavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn interest_parsing() {
        assert_eq!(parse_interest(None).unwrap(), WatchRequest::Mine);
        assert_eq!(
            parse_interest(Some("pending")).unwrap(),
            WatchRequest::PendingPool
        );
        let id = OrderId::generate();
        assert_eq!(
            parse_interest(Some(&format!("order:{id}"))).unwrap(),
            WatchRequest::Order(id)
        );
        assert!(parse_interest(Some("everything")).is_err());
        assert!(parse_interest(Some("order:not-a-uuid")).is_err());
    }
}
