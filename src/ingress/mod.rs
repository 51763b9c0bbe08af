//! Host-based HTTP ingress.
//!
//! An in-memory host → app table is refreshed by a watch on the
//! `http_route` kind; requests dispatch to a backend resolved through the
//! app-lookup collaborator and are proxied through. Unknown hosts fall back
//! to the default route, then to `404 no route`; an unreachable backend is
//! `502 backend unavailable`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Request, Response, StatusCode, header};
use axum::routing::any;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::entity::Id;
use crate::error::Result;
use crate::metrics;
use crate::model::Kinded;
use crate::model::ingress::HttpRoute;
use crate::reconcile::{self, Controller, ControllerHandle, Meta};
use crate::store::EntityStore;

/* ============================= ROUTE TABLE ============================= */

/// Host → app dispatch state, rebuilt from route entities on every change.
#[derive(Default)]
pub struct RouteTable {
    inner: RwLock<Tables>,
}

#[derive(Default)]
struct Tables {
    routes: HashMap<Id, HttpRoute>,
    by_host: HashMap<String, Id>,
    default_app: Option<Id>,
}

impl Tables {
    fn rebuild(&mut self) {
        self.by_host.clear();
        self.default_app = None;
        for route in self.routes.values() {
            let Some(app) = &route.app else { continue };
            if !route.host.is_empty() {
                self.by_host.insert(route.host.to_lowercase(), app.clone());
            }
            if route.default {
                self.default_app = Some(app.clone());
            }
        }
    }
}

/// Case-insensitive host normalization: lowercase, port stripped. IPv6
/// literals keep their bracketed form.
fn normalize_host(raw: &str) -> String {
    let raw = raw.trim().to_lowercase();
    if let Some(end) = raw.find(']') {
        return raw[..=end].to_string();
    }
    match raw.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => raw,
    }
}

impl RouteTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn apply(&self, route: HttpRoute) {
        let mut tables = self.inner.write().expect("route table lock");
        tables.routes.insert(route.entity_id(), route);
        tables.rebuild();
    }

    pub fn remove(&self, route_id: &Id) {
        let mut tables = self.inner.write().expect("route table lock");
        tables.routes.remove(route_id);
        tables.rebuild();
    }

    /// Resolve a request host to an app id, falling back to the default
    /// route when no host matches.
    pub fn lookup(&self, host: &str) -> Option<Id> {
        let tables = self.inner.read().expect("route table lock");
        tables
            .by_host
            .get(&normalize_host(host))
            .cloned()
            .or_else(|| tables.default_app.clone())
    }

    pub fn hosts(&self) -> Vec<String> {
        let tables = self.inner.read().expect("route table lock");
        tables.by_host.keys().cloned().collect()
    }
}

/* ============================= ROUTE WATCH ============================= */

struct RouteTableController {
    table: Arc<RouteTable>,
}

#[async_trait]
impl Controller<HttpRoute> for RouteTableController {
    async fn create(&self, _ctx: &Context, obj: HttpRoute, _meta: Meta) -> Result<()> {
        debug!(route = %obj.entity_id(), host = %obj.host, default = obj.default, "route_applied");
        self.table.apply(obj);
        Ok(())
    }

    async fn delete(&self, _ctx: &Context, id: Id) -> Result<()> {
        debug!(route = %id, "route_removed");
        self.table.remove(&id);
        Ok(())
    }
}

/// Keep `table` refreshed from the `http_route` kind.
pub fn watch_routes(
    table: Arc<RouteTable>,
    store: &EntityStore,
    ctx: &Context,
) -> Result<ControllerHandle> {
    reconcile::run::<HttpRoute, _>(store, Arc::new(RouteTableController { table }), ctx)
}

/* ============================= BACKEND LOOKUP ============================= */

/// The app-lookup collaborator: maps an app id to a healthy backend
/// authority (`host:port`). The router does not itself own backends.
#[async_trait]
pub trait BackendResolver: Send + Sync + 'static {
    async fn resolve(&self, ctx: &Context, app: &Id) -> Result<Option<String>>;
}

/// Fixed app → authority table; the dev and test resolver.
#[derive(Default)]
pub struct StaticBackends {
    backends: RwLock<HashMap<Id, String>>,
}

impl StaticBackends {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, app: Id, authority: String) {
        self.backends
            .write()
            .expect("backends lock")
            .insert(app, authority);
    }
}

#[async_trait]
impl BackendResolver for StaticBackends {
    async fn resolve(&self, _ctx: &Context, app: &Id) -> Result<Option<String>> {
        Ok(self.backends.read().expect("backends lock").get(app).cloned())
    }
}

/// Resolves an app through its Endpoints projection: the route's app ref
/// names a Service entity, and the first projected `(ip, port)` becomes the
/// backend authority.
pub struct ServiceBackends {
    store: EntityStore,
}

impl ServiceBackends {
    pub fn new(store: EntityStore) -> Arc<Self> {
        Arc::new(Self { store })
    }
}

#[async_trait]
impl BackendResolver for ServiceBackends {
    async fn resolve(&self, ctx: &Context, app: &Id) -> Result<Option<String>> {
        let projections = self.store.list(
            ctx,
            &Id::new(crate::model::network::ENDPOINTS_SERVICE),
            &crate::entity::Value::Ref(app.clone()),
        )?;
        for (entity, _) in projections {
            let endpoints = crate::model::network::Endpoints::decode(&entity)?;
            if let Some((ip, port)) = endpoints.endpoints.first() {
                return Ok(Some(format!("{ip}:{port}")));
            }
        }
        Ok(None)
    }
}

/* ============================= HTTP SURFACE ============================= */

pub struct IngressState {
    pub table: Arc<RouteTable>,
    pub resolver: Arc<dyn BackendResolver>,
    client: reqwest::Client,
    ctx: Context,
}

impl IngressState {
    pub fn new(table: Arc<RouteTable>, resolver: Arc<dyn BackendResolver>, ctx: Context) -> Arc<Self> {
        Arc::new(Self {
            table,
            resolver,
            client: reqwest::Client::new(),
            ctx,
        })
    }
}

/// The ingress router: every method, every path, dispatched by host.
pub fn router(state: Arc<IngressState>) -> Router {
    Router::new()
        .route("/", any(dispatch))
        .route("/*path", any(dispatch))
        .with_state(state)
}

fn request_host(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
}

async fn dispatch(State(state): State<Arc<IngressState>>, req: Request<Body>) -> Response<Body> {
    let Some(host) = request_host(&req) else {
        metrics::INGRESS_REQUESTS.with_label_values(&["no_route"]).inc();
        return plain(StatusCode::NOT_FOUND, "no route");
    };

    let Some(app) = state.table.lookup(&host) else {
        metrics::INGRESS_REQUESTS.with_label_values(&["no_route"]).inc();
        info!(host = %host, "ingress_no_route");
        return plain(StatusCode::NOT_FOUND, "no route");
    };

    let backend = match state.resolver.resolve(&state.ctx, &app).await {
        Ok(Some(authority)) => authority,
        Ok(None) => {
            metrics::INGRESS_REQUESTS
                .with_label_values(&["backend_unavailable"])
                .inc();
            warn!(host = %host, app = %app, "ingress_backend_unavailable");
            return plain(StatusCode::BAD_GATEWAY, "backend unavailable");
        }
        Err(err) => {
            metrics::INGRESS_REQUESTS
                .with_label_values(&["backend_unavailable"])
                .inc();
            warn!(host = %host, app = %app, error = %err, "ingress_backend_lookup_failed");
            return plain(StatusCode::BAD_GATEWAY, "backend unavailable");
        }
    };

    let _timer = metrics::INGRESS_PROXY_DURATION.start_timer();
    match proxy(&state.client, &backend, req).await {
        Ok(response) => {
            metrics::INGRESS_REQUESTS.with_label_values(&["proxied"]).inc();
            response
        }
        Err(err) => {
            metrics::INGRESS_REQUESTS
                .with_label_values(&["backend_error"])
                .inc();
            warn!(host = %host, backend = %backend, error = %err, "ingress_proxy_failed");
            plain(StatusCode::BAD_GATEWAY, "backend unavailable")
        }
    }
}

/// Hop-by-hop headers never forwarded in either direction.
fn is_hop_by_hop(name: &header::HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

async fn proxy(
    client: &reqwest::Client,
    backend: &str,
    req: Request<Body>,
) -> anyhow::Result<Response<Body>> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_string();
    let url = format!("http://{backend}{path_and_query}");
    let method = req.method().clone();
    let headers = forwardable(req.headers());
    let body = to_bytes(req.into_body(), usize::MAX).await?;

    let upstream = client
        .request(method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await?;

    let status = upstream.status();
    let headers = forwardable(upstream.headers());
    let bytes = upstream.bytes().await?;

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    Ok(builder.body(Body::from(bytes))?)
}

fn plain(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .expect("static response builds")
}

/* ============================= TESTS ============================= */
