//! The HTTP front door: peer/service discovery endpoints plus the
//! catch-all redirect route every other path falls through to.

use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderValue, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::redirect::{Entry, RedirectTable};
use crate::server::PortalState;

#[derive(Debug, Deserialize)]
pub struct NameFilter {
    name: Option<String>,
}

#[derive(Serialize)]
struct RedirectView {
    path: String,
    service: Option<String>,
    target: String,
    hide: bool,
    active: bool,
    expire: i64,
    start: i64,
}

impl From<Entry> for RedirectView {
    fn from(e: Entry) -> Self {
        RedirectView {
            path: e.path,
            service: e.service,
            target: e.target,
            hide: e.hide,
            active: e.expiration != 1,
            expire: e.expiration,
            start: e.start,
        }
    }
}

/// `GET /portal/peers` — every peer this portal currently knows about,
/// as bare `host[:port]` strings, for the discovery client's first
/// phase.
async fn peers(State(state): State<Arc<PortalState>>) -> Json<serde_json::Value> {
    let hosts: Vec<String> = state.peers.list().into_iter().map(|p| p.host).collect();
    Json(json!({
        "host": state.config.host,
        "timestamp": crate::server::now(),
        "portal": { "peers": hosts },
    }))
}

/// `GET /portal/list[?name=X]` — every registered path, optionally
/// filtered to one service name. This is what the discovery client's
/// second phase polls every 120s.
async fn list(
    State(state): State<Arc<PortalState>>,
    Query(filter): Query<NameFilter>,
) -> Json<serde_json::Value> {
    let entries = match filter.name {
        Some(name) => state.redirects.by_service(&name),
        None => state.redirects.list(),
    };

    let redirect: Vec<RedirectView> = entries.into_iter().map(RedirectView::from).collect();
    Json(json!({
        "host": state.config.host,
        "timestamp": crate::server::now(),
        "portal": { "redirect": redirect },
    }))
}

/// `GET /portal/service?name=X` — every absolute URL this portal would
/// dispatch requests for the named service to. An unrecognized name is
/// not an error: it answers with an empty `url` list.
async fn service(
    State(state): State<Arc<PortalState>>,
    Query(filter): Query<NameFilter>,
) -> Response {
    let Some(name) = filter.name else {
        return (StatusCode::BAD_REQUEST, "missing name").into_response();
    };

    let urls: Vec<String> = state
        .redirects
        .by_service(&name)
        .into_iter()
        .map(|e| format!("http://{}{}", state.config.host, e.path))
        .collect();

    Json(json!({
        "host": state.config.host,
        "timestamp": crate::server::now(),
        "portal": { "service": { "name": name, "url": urls } },
    }))
    .into_response()
}

/// The catch-all route: resolve the request path against the
/// redirection table and answer with a 301/302 to the matched target,
/// or HTTP 500 "Unresolvable redirection." if nothing matches.
async fn dispatch(State(state): State<Arc<PortalState>>, uri: Uri) -> Response {
    let path = uri.path();
    let query = uri.query().unwrap_or("");

    let Some(entry) = state.redirects.resolve(path) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Unresolvable redirection.").into_response();
    };

    let (status, location) = RedirectTable::dispatch(&entry, path, query);
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::FOUND);

    let mut response = status.into_response();
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(axum::http::header::LOCATION, value);
    }
    response
}

/// Cross-origin requests never get to touch the redirection table: a
/// preflight `OPTIONS` is answered directly with 204 + `ACAO: *`, and
/// any other cross-origin method is rejected with 403 before it reaches
/// a handler.
async fn cors_guard(req: Request, next: Next) -> Response {
    let is_cross_origin = req.headers().contains_key(header::ORIGIN);

    if is_cross_origin && req.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        response
            .headers_mut()
            .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        return response;
    }

    if is_cross_origin && req.method() != Method::GET {
        return (StatusCode::FORBIDDEN, "Forbidden Cross-Domain").into_response();
    }

    next.run(req).await
}

pub fn router(state: Arc<PortalState>) -> Router {
    Router::new()
        .route("/portal/peers", get(peers))
        .route("/portal/list", get(list))
        .route("/portal/service", get(service))
        .fallback(dispatch)
        .layer(middleware::from_fn(cors_guard))
        .with_state(state)
}

/// Serves the HTTP front door until the process is killed.
pub async fn start(state: Arc<PortalState>) -> anyhow::Result<()> {
    let addr = state.config.http_listen;
    let app = router(state);

    log::info!("http front door listening: {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
