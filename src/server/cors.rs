// Cross-origin policy for the HTTP and WebSocket endpoints

//! # CORS
//!
//! Two pieces work together:
//!
//! - [`CorsConfig::layer`] builds the tower-http `CorsLayer` that writes the
//!   `Access-Control-*` response headers and answers preflight requests.
//! - [`origin_guard`] rejects cross-origin requests whose `Origin` the policy
//!   does not allow with `404 Not Found`, including WebSocket upgrades.
//!
//! ## Origin Rules
//!
//! 1. `allow_origin == "*"` allows everything.
//! 2. A request without `Origin` or `Host` (scripts, curl) is allowed.
//! 3. A same-origin request (origin `host[:port]` equals `Host`) is allowed.
//! 4. Otherwise a non-empty `allow_origin` must equal the origin exactly; if it
//!    is empty, `allow_origin_pat` must match at the start of the origin.
//! 5. With neither configured, cross-origin requests are denied.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use regex::Regex;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;
use url::Url;

/// Cross-origin settings
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Value for `Access-Control-Allow-Origin`; `"*"` allows any origin, empty disables
    pub allow_origin: String,
    /// Used when `allow_origin` is empty
    pub allow_origin_pat: Option<Regex>,
    /// Send `Access-Control-Allow-Credentials: true`
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origin: "*".to_string(),
            allow_origin_pat: None,
            allow_credentials: true,
        }
    }
}

impl CorsConfig {
    /// Build a config, compiling `allow_origin_pat` when it is non-empty
    pub fn new(
        allow_origin: impl Into<String>,
        allow_origin_pat: Option<&str>,
        allow_credentials: bool,
    ) -> crate::Result<Self> {
        let allow_origin_pat = match allow_origin_pat.filter(|pat| !pat.is_empty()) {
            Some(pat) => Some(Regex::new(pat).map_err(|e| {
                crate::JobsError::InvalidInput(format!("allow_origin_pat '{}': {}", pat, e))
            })?),
            None => None,
        };

        Ok(Self {
            allow_origin: allow_origin.into(),
            allow_origin_pat,
            allow_credentials,
        })
    }

    /// Whether `origin` passes the configured allow list
    pub fn allows(&self, origin: &str) -> bool {
        if self.allow_origin == "*" {
            return true;
        }
        if !self.allow_origin.is_empty() {
            return self.allow_origin == origin;
        }
        match &self.allow_origin_pat {
            Some(pat) => pat.find(origin).map_or(false, |m| m.start() == 0),
            None => false,
        }
    }

    /// Decide whether a request with these headers may proceed
    pub fn check_origin(&self, origin: Option<&str>, host: Option<&str>) -> bool {
        if self.allow_origin == "*" {
            return true;
        }

        let (origin, host) = match (origin, host) {
            (Some(origin), Some(host)) => (origin.to_lowercase(), host),
            _ => return true,
        };

        if origin_netloc(&origin).as_deref() == Some(host) {
            return true;
        }

        self.allows(&origin)
    }

    /// Response header layer for this policy
    pub fn layer(&self) -> CorsLayer {
        let allow_origin = if self.allow_origin == "*" {
            // a literal `*` cannot be combined with credentials
            if self.allow_credentials {
                AllowOrigin::mirror_request()
            } else {
                AllowOrigin::any()
            }
        } else {
            let config = self.clone();
            AllowOrigin::predicate(move |origin: &HeaderValue, _| {
                origin.to_str().map_or(false, |origin| config.allows(origin))
            })
        };

        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([
                Method::GET,
                Method::PUT,
                Method::POST,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([header::ACCEPT, header::CONTENT_TYPE, header::AUTHORIZATION])
            .allow_credentials(self.allow_credentials)
    }
}

/// `host[:port]` of an origin URL
fn origin_netloc(origin: &str) -> Option<String> {
    let url = Url::parse(origin).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Middleware rejecting disallowed cross-origin requests with 404
pub async fn origin_guard<B>(
    State(cors): State<Arc<CorsConfig>>,
    request: Request<B>,
    next: Next<B>,
) -> Response {
    let headers = request.headers();
    let origin = headers
        .get(header::ORIGIN)
        .or_else(|| headers.get("sec-websocket-origin"))
        .and_then(|value| value.to_str().ok());
    let host = headers.get(header::HOST).and_then(|value| value.to_str().ok());

    if !cors.check_origin(origin, host) {
        warn!(
            "Blocking Cross Origin API request for {}. Origin: {}, Host: {}",
            request.uri().path(),
            origin.unwrap_or_default(),
            host.unwrap_or_default()
        );
        return StatusCode::NOT_FOUND.into_response();
    }

    next.run(request).await
}
