//! In-process request injection — how a tunneled call reaches the router.
//!
//! The front door and the relay client depend on each other (the relay needs
//! somewhere to inject requests; the front door hands the relay its auth
//! token for `welcome` frames). These two small traits break the cycle; both
//! sides are wired at startup.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use tracing::warn;

use crate::credentials::CredentialManager;
use crate::http::auth::INTERNAL_MARKER;

/// Response captured from an injected request — exactly what goes back over
/// the relay in an `api-response` frame.
#[derive(Debug, Clone)]
pub struct InjectedResponse {
    pub ok: bool,
    pub status: u16,
    pub data: Value,
}

#[async_trait]
pub trait RequestInjector: Send + Sync {
    /// Run an HTTP-style request through the local router, preserving
    /// method, path, and query, and capture the full response. Never
    /// errors — router failures map to a 500-shaped response.
    async fn inject(&self, method: &str, url: &str, body: Option<&Value>) -> InjectedResponse;
}

#[async_trait]
pub trait AuthTokenSource: Send + Sync {
    /// The active token a welcomed peer should present on tunneled calls.
    async fn active_token(&self) -> String;
}

#[async_trait]
impl AuthTokenSource for CredentialManager {
    async fn active_token(&self) -> String {
        self.access_token().await
    }
}

// ─── Router-backed injector ──────────────────────────────────────────────────

pub struct RouterInjector {
    router: Router,
    /// Per-process secret the auth hook recognizes as relay authority.
    marker: String,
}

impl RouterInjector {
    pub fn new(router: Router, marker: String) -> Self {
        Self { router, marker }
    }

    async fn try_inject(
        &self,
        method: &str,
        url: &str,
        body: Option<&Value>,
    ) -> anyhow::Result<InjectedResponse> {
        let method = Method::from_bytes(method.as_bytes())?;

        let mut builder = Request::builder()
            .method(method)
            .uri(url)
            .header(&*INTERNAL_MARKER, &self.marker);

        let request = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                builder.body(Body::from(serde_json::to_vec(value)?))?
            }
            None => builder.body(Body::empty())?,
        };

        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let data = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        Ok(InjectedResponse {
            ok: status.is_success(),
            status: status.as_u16(),
            data,
        })
    }
}

#[async_trait]
impl RequestInjector for RouterInjector {
    async fn inject(&self, method: &str, url: &str, body: Option<&Value>) -> InjectedResponse {
        match self.try_inject(method, url, body).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(err = %e, url, "request injection failed");
                InjectedResponse {
                    ok: false,
                    status: 500,
                    data: json!({ "error": e.to_string() }),
                }
            }
        }
    }
}
