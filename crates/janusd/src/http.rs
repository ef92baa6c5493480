//! HTTP(S) front-end for the control protocol.
//!
//! The transport stays thin: it decodes the URL into a request scope, ships
//! bodies to the dispatcher, and maps the handful of transport-level
//! outcomes (404 for malformed paths, 302 for GET on a handle path, 501 for
//! unsupported methods, CORS echo everywhere). Every protocol-level outcome,
//! errors included, is a 200 with a JSON body.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{Path as UrlPath, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use janus_gateway_core::{ApiError, Dispatcher, RequestScope};

pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub base_path: String,
}

/// Build the application router under the configured base path.
pub fn router(state: Arc<AppState>) -> Router {
    let base = state.base_path.clone();
    let api = Router::new()
        .route("/", any(root_scope))
        .route("/:session", any(session_scope))
        .route("/:session/:handle", any(handle_scope))
        .with_state(state);
    let app = if base.is_empty() {
        api
    } else {
        Router::new().nest(&base, api)
    };
    app.layer(middleware::from_fn(cors_headers))
}

async fn root_scope(state: State<Arc<AppState>>, method: Method, body: String) -> Response {
    match method {
        Method::OPTIONS => StatusCode::OK.into_response(),
        Method::GET => json_reply(ApiError::UsePost.envelope(None).to_string()),
        Method::POST => {
            json_reply(state.dispatcher.handle_post(RequestScope::Root, &body).await)
        }
        _ => StatusCode::NOT_IMPLEMENTED.into_response(),
    }
}

async fn session_scope(
    state: State<Arc<AppState>>,
    UrlPath(session): UrlPath<String>,
    method: Method,
    body: String,
) -> Response {
    let Some(session_id) = parse_id(&session) else {
        debug!(session = %session, "invalid session path component");
        return StatusCode::NOT_FOUND.into_response();
    };
    match method {
        Method::OPTIONS => StatusCode::OK.into_response(),
        Method::GET => json_reply(state.dispatcher.long_poll(session_id).await),
        Method::POST => json_reply(
            state
                .dispatcher
                .handle_post(RequestScope::Session(session_id), &body)
                .await,
        ),
        _ => StatusCode::NOT_IMPLEMENTED.into_response(),
    }
}

async fn handle_scope(
    state: State<Arc<AppState>>,
    UrlPath((session, handle)): UrlPath<(String, String)>,
    method: Method,
    body: String,
) -> Response {
    let (Some(session_id), Some(handle_id)) = (parse_id(&session), parse_id(&handle)) else {
        debug!(session = %session, handle = %handle, "invalid handle path component");
        return StatusCode::NOT_FOUND.into_response();
    };
    match method {
        Method::OPTIONS => StatusCode::OK.into_response(),
        Method::GET => {
            // Long polls belong on the session path.
            let location = format!("{}/{}", state.base_path, session_id);
            (
                StatusCode::FOUND,
                [(header::LOCATION, location)],
            )
                .into_response()
        }
        Method::POST => json_reply(
            state
                .dispatcher
                .handle_post(
                    RequestScope::Handle {
                        session: session_id,
                        handle: handle_id,
                    },
                    &body,
                )
                .await,
        ),
        _ => StatusCode::NOT_IMPLEMENTED.into_response(),
    }
}

fn parse_id(component: &str) -> Option<u64> {
    component.parse::<u64>().ok().filter(|id| *id >= 1)
}

fn json_reply(payload: String) -> Response {
    (
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        payload,
    )
        .into_response()
}

/// Allow any origin and echo the requested methods/headers back, on every
/// response rather than only on preflights.
async fn cors_headers(request: Request, next: Next) -> Response {
    let requested_method = request
        .headers()
        .get(header::ACCESS_CONTROL_REQUEST_METHOD)
        .cloned();
    let requested_headers = request
        .headers()
        .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .cloned();
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    if let Some(methods) = requested_method {
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, methods);
    }
    if let Some(names) = requested_headers {
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, names);
    }
    response
}

pub async fn serve_http(
    addr: SocketAddr,
    app: Router,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("couldn't start webserver on {addr}"))?;
    info!(%addr, "HTTP webserver started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
        .context("HTTP webserver failed")?;
    Ok(())
}

pub async fn serve_https(
    addr: SocketAddr,
    app: Router,
    cert_pem: PathBuf,
    cert_key: PathBuf,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    let tls = RustlsConfig::from_pem_file(&cert_pem, &cert_key)
        .await
        .with_context(|| {
            format!(
                "couldn't load certificates ({}, {})",
                cert_pem.display(),
                cert_key.display()
            )
        })?;
    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            stop.cancelled().await;
            handle.graceful_shutdown(Some(Duration::from_secs(5)));
        });
    }
    info!(%addr, "HTTPS webserver started");
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .with_context(|| format!("couldn't start secure webserver on {addr}"))?;
    Ok(())
}
