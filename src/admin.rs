use crate::backend::{BackendRegistry, ReloadResult, StaticRegistry};
use crate::config::Config;
use crate::coordinator::WakeCoordinator;
use crate::error::{json_error_response, AdminErrorCode};
use crate::router::InitialRouter;
use crate::session::{SessionId, WebhookSubstrate};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: &impl serde::Serialize) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static header")
}

/// Everything the admin API operates on
pub struct AdminState {
    pub coordinator: Arc<WakeCoordinator>,
    pub router: Arc<InitialRouter>,
    pub registry: Arc<StaticRegistry>,
    pub substrate: Arc<WebhookSubstrate>,
    /// Configuration file re-read on reload; `None` disables reload
    pub config_path: Option<PathBuf>,
}

impl AdminState {
    /// Re-read the configuration file and apply backends, wake timings and
    /// the fallback order. Running poll tasks keep their old timings.
    pub fn reload(&self) -> anyhow::Result<ReloadResult> {
        let path = self
            .config_path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("gateway was started without a configuration file"))?;
        let config = Config::load(path)?;

        let result = self.registry.apply(config.backends, config.wake.clone());
        self.coordinator.apply_timings(config.wake.timings());
        self.router.set_fallback_order(config.server.fallback_order);

        info!(
            added = result.added.len(),
            removed = result.removed.len(),
            updated = result.updated.len(),
            "Configuration reloaded"
        );
        Ok(result)
    }
}

/// Admin API server the proxy reports client sessions to
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        state: Arc<AdminState>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let state = Arc::clone(&state);
                                    let token = Arc::clone(&auth_token);
                                    async move { handle_admin_request(req, state, token).await }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// Value of `key` in the query string
fn query_param<'a>(uri: &'a Uri, key: &str) -> Option<&'a str> {
    uri.query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

/// Split `/sessions/{id}/{action}[/{backend}]`
fn session_route(path: &str) -> Option<(&str, &str, Option<&str>)> {
    let rest = path.strip_prefix("/sessions/")?;
    let mut parts = rest.splitn(3, '/');
    let id = parts.next()?;
    let action = parts.next().unwrap_or("");
    let backend = parts.next().filter(|b| !b.is_empty());
    Some((id, action, backend))
}

async fn handle_admin_request<B>(
    req: Request<B>,
    state: Arc<AdminState>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    let response = match (method, path) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        _ if !check_auth(&req, &auth_token) => {
            warn!(%path, "Unauthorized admin API request");
            json_error_response(AdminErrorCode::Unauthorized, "missing or invalid bearer token")
        }

        // Pending poll tasks: GET /tasks
        (&Method::GET, "/tasks") => {
            let tasks = state.coordinator.pending_tasks();
            json_response(
                StatusCode::OK,
                &serde_json::json!({ "count": tasks.len(), "tasks": tasks }),
            )
        }

        // Live wake records: GET /throttle
        (&Method::GET, "/throttle") => {
            let records = state.coordinator.throttled_backends();
            json_response(
                StatusCode::OK,
                &serde_json::json!({ "count": records.len(), "records": records }),
            )
        }

        // Configured backends: GET /backends
        (&Method::GET, "/backends") => {
            let backends: Vec<_> = state
                .registry
                .names()
                .iter()
                .filter_map(|name| state.registry.resolve(name))
                .collect();
            json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "backends": backends,
                    "fallback_order": state.router.fallback_order(),
                }),
            )
        }

        // Re-read the configuration file: POST /reload
        (&Method::POST, "/reload") => match state.reload() {
            Ok(result) => json_response(StatusCode::OK, &result),
            Err(e) => {
                warn!(error = %e, "Configuration reload failed");
                json_error_response(AdminErrorCode::ReloadFailed, e.to_string())
            }
        },

        (method, path) if path.starts_with("/sessions/") => {
            handle_session_request(method, req.uri(), &state).await
        }

        _ => json_error_response(AdminErrorCode::NotFound, "not found"),
    };

    Ok(response)
}

async fn handle_session_request(
    method: &Method,
    uri: &Uri,
    state: &AdminState,
) -> Response<Full<Bytes>> {
    let Some((id, action, backend)) = session_route(uri.path()) else {
        return json_error_response(AdminErrorCode::NotFound, "not found");
    };
    let session: SessionId = match id.parse() {
        Ok(session) => session,
        Err(_) => {
            return json_error_response(
                AdminErrorCode::InvalidSession,
                format!("'{}' is not a session id", id),
            )
        }
    };

    match (method, action, backend) {
        // Snapshot of the session's poll task: GET /sessions/{id}
        (&Method::GET, "", None) => match state.coordinator.task(session) {
            Some(task) => json_response(StatusCode::OK, &task),
            None => json_error_response(AdminErrorCode::NotFound, "session has no poll task"),
        },

        // A client is choosing its first backend: POST /sessions/{id}/connect/{backend}
        (&Method::POST, "connect", Some(backend)) => {
            if state.registry.resolve(backend).is_none() {
                return unknown_backend(backend);
            }
            let version = query_param(uri, "protocol_version").and_then(|v| v.parse().ok());
            state.substrate.register(session);
            let decision = state
                .router
                .select_initial_route(session, Some(backend), version)
                .await;
            json_response(StatusCode::OK, &decision)
        }

        // Hold the client until the backend is up: POST /sessions/{id}/start/{backend}
        (&Method::POST, "start", Some(backend)) => {
            let Some(target) = state.registry.resolve(backend) else {
                return unknown_backend(backend);
            };
            state.substrate.register(session);
            let dispatch = state.coordinator.ensure_started(session, target).await;
            json_response(StatusCode::OK, &dispatch)
        }

        // The client left the proxy: POST /sessions/{id}/disconnect
        (&Method::POST, "disconnect", None) => {
            let cancelled = state.coordinator.on_disconnect(session);
            state.substrate.remove(session);
            json_response(StatusCode::OK, &serde_json::json!({ "cancelled": cancelled }))
        }

        // The client was routed elsewhere: POST /sessions/{id}/route-changed
        (&Method::POST, "route-changed", None) => {
            let cancelled = state.coordinator.on_route_changed(session);
            json_response(StatusCode::OK, &serde_json::json!({ "cancelled": cancelled }))
        }

        // The client moved to `backend`: POST /sessions/{id}/switch/{backend}?from={previous}
        (&Method::POST, "switch", Some(backend)) => {
            let cancelled = state
                .router
                .on_server_switch(session, query_param(uri, "from"));
            state.substrate.set_backend(session, backend);
            json_response(StatusCode::OK, &serde_json::json!({ "cancelled": cancelled }))
        }

        _ => json_error_response(AdminErrorCode::NotFound, "not found"),
    }
}

fn unknown_backend(name: &str) -> Response<Full<Bytes>> {
    json_error_response(
        AdminErrorCode::UnknownBackend,
        format!("backend '{}' is not configured", name),
    )
}
