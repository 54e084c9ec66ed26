use std::collections::HashSet;

use axum::http::{HeaderMap, HeaderValue};
use dispatch_orders::{ActorId, Role};

/// Header carrying the identity asserted by the upstream identity provider.
pub const ACTOR_HEADER: &str = "x-actor-id";
/// Header carrying the role the caller declares when signing in.
pub const ROLE_HEADER: &str = "x-actor-role";

/// Gate in front of the API: callers must present one of the configured
/// bearer tokens. The identity provider sits behind this gate and is trusted.
#[derive(Clone)]
pub(crate) struct AuthManager {
    tokens: HashSet<String>,
}

impl AuthManager {
    pub(crate) fn new(tokens: HashSet<String>) -> Self {
        Self { tokens }
    }

    pub(crate) fn validate(&self, header: Option<&HeaderValue>) -> bool {
        let Some(raw) = header.and_then(|value| value.to_str().ok()) else {
            return false;
        };

        let raw = raw.trim();
        let token = raw
            .strip_prefix("Bearer ")
            .or_else(|| raw.strip_prefix("bearer "))
            .unwrap_or(raw)
            .trim();

        self.tokens.contains(token)
    }
}

pub(crate) fn actor_from_headers(headers: &HeaderMap) -> Option<ActorId> {
    headers
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ActorId::new)
}

pub(crate) fn declared_role(headers: &HeaderMap) -> Option<Result<Role, dispatch_orders::DispatchError>> {
    headers
        .get(ROLE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.parse::<Role>())
}
