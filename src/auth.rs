use std::sync::Arc;

use axum::{
    http::{header, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::config::{AuthConfig, ADMIN_ROLE};

/// Authenticated caller identity, available to handlers via request extensions.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub name: String,
    pub role: String,
}

impl CallerIdentity {
    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }
}

#[derive(Serialize)]
struct AuthError {
    success: bool,
    error: String,
}

fn reject(status: StatusCode, error: &str) -> Response {
    (status, Json(AuthError {
        success: false,
        error: error.to_string(),
    })).into_response()
}

fn is_read(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

/// Resolves the caller from `X-API-Key` or `Authorization: Bearer`; anything
/// other than a read needs the admin role.
pub async fn auth_middleware<B>(
    Extension(config): Extension<Arc<AuthConfig>>,
    mut req: Request<B>,
    next: Next<B>,
) -> Response {
    if !config.enabled {
        req.extensions_mut().insert(CallerIdentity {
            name: "anonymous".to_string(),
            role: ADMIN_ROLE.to_string(),
        });
        return next.run(req).await;
    }

    let api_key = req.headers()
        .get("X-API-Key")
        .or_else(|| req.headers().get(header::AUTHORIZATION))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

    let Some(key) = api_key else {
        return reject(
            StatusCode::UNAUTHORIZED,
            "Missing API key. Provide X-API-Key header or Authorization: Bearer <key>",
        );
    };

    let Some(entry) = config.api_keys.iter().find(|entry| {
        entry.key.as_bytes().ct_eq(key.as_bytes()).into()
    }) else {
        tracing::warn!("Invalid API key presented");
        return reject(StatusCode::UNAUTHORIZED, "Invalid API key");
    };

    let caller = CallerIdentity {
        name: entry.name.clone(),
        role: entry.role.clone(),
    };
    if !is_read(req.method()) && !caller.is_admin() {
        tracing::warn!(caller = %caller.name, method = %req.method(), path = %req.uri().path(), "Write refused for non-admin caller");
        return reject(StatusCode::FORBIDDEN, "This operation requires the admin role");
    }

    tracing::debug!(caller = %caller.name, role = %caller.role, "Authenticated request");
    req.extensions_mut().insert(caller);
    next.run(req).await
}
