use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::container::{Arena, Direction, NodeId};
use crate::embodiment::{self, deliver_reply, Embodiment, ReplyTarget};
use crate::error::{RxError, ServeError};
use crate::filter::{run_filters, Filter, FiltersData};
use crate::resource::{Context, Handler, Resource, ResourceResponse};
use crate::route::Route;
use crate::view::{serve_static, ViewEngine};

/// A pathname shortcut straight to a resolved resource: the target node and
/// the consumed path that goes with it.
struct CacheEntry {
    resource: NodeId,
    path: Vec<String>,
}

/// Tree state shared by every in-flight request.  The lock is held only for
/// short, await-free critical sections: resolution and snapshotting under a
/// read lock, mutation under a write lock, never across a handler future.
struct SiteInner {
    arena: Arena,
    root: NodeId,
    cache: HashMap<String, CacheEntry>,
}

/// The root of a resource tree and the entry point for dispatch.
///
/// A site is an explicitly constructed value, not a process-wide singleton:
/// several independent sites can coexist (and be tested) in one process.
/// It owns the resource arena, the path cache, and the request-filter
/// registry, and it turns raw HTTP requests into served replies.
///
/// # Examples
/// ```rust,no_run
/// use resin::{Resource, ResourceResponse};
///
/// #[tokio::main]
/// async fn main() -> Result<(), resin::ServeError> {
///     let site = resin::site("demo");
///     site.add(Resource::new("hello").on_get(|_cx: resin::Context| async {
///         Ok(ResourceResponse::ok(serde_json::json!({ "hello": "world" })))
///     }));
///     site.listen("0.0.0.0:8080").await
/// }
/// ```
pub struct Site {
    name: String,
    inner: RwLock<SiteInner>,
    filters: HashMap<String, Arc<dyn Filter>>,
    filters_enabled: bool,
    home: String,
    allow_cors: bool,
    error_view: Option<String>,
    asset_base: Option<PathBuf>,
    engine: Option<Arc<dyn ViewEngine>>,
}

/// What dispatch needs to know about a target resource, cloned out of the
/// arena so no lock is held while the handler runs.
struct TargetSnapshot {
    name: String,
    data: Value,
    parameter_names: Vec<String>,
    out_format: Option<String>,
    handler: Option<Arc<dyn Handler>>,
    reply: ReplyTarget,
}

enum StepOutcome {
    Descend(Direction),
    Target,
}

impl Site {
    /// Creates a site with an empty resource tree rooted at `"site"`.
    pub fn new<N: Into<String>>(name: N) -> Self {
        let name = name.into();
        let (arena, root) = Arena::new(&name);
        Site {
            name,
            inner: RwLock::new(SiteInner {
                arena,
                root,
                cache: HashMap::new(),
            }),
            filters: HashMap::new(),
            filters_enabled: false,
            home: "/".to_owned(),
            allow_cors: false,
            error_view: None,
            asset_base: None,
            engine: None,
        }
    }

    /// The name this site was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a resource (and, recursively, its nested descriptors) at
    /// the root of the tree.
    pub fn add(&self, resource: Resource) {
        let mut inner = self.inner.write().unwrap();
        let root = inner.root;
        inner.arena.add(root, resource);
    }

    /// Registers a resource under the resource addressed by `pathname`.
    ///
    /// # Errors
    /// Fails with a resolution error when the pathname does not address a
    /// registered resource.
    pub fn add_at(&self, pathname: &str, resource: Resource) -> Result<(), RxError> {
        let mut inner = self.inner.write().unwrap();
        let root = inner.root;
        let parent = inner
            .arena
            .resolve_full(root, pathname)
            .ok_or_else(|| RxError::not_found(pathname))?;
        inner.arena.add(parent, resource);
        Ok(())
    }

    /// Detaches the resource addressed by `pathname` from the tree,
    /// dropping any path-cache entries for it or its descendants.  Returns
    /// `false` when the pathname does not resolve (idempotent).
    pub fn remove(&self, pathname: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        let root = inner.root;
        match inner.arena.resolve_full(root, pathname) {
            Some(node) if node != root => detach(&mut inner, node),
            _ => false,
        }
    }

    /// Resolves `pathname` through the tree (never the cache) and returns a
    /// snapshot of the addressed resource's data.
    pub fn lookup_data(&self, pathname: &str) -> Option<Value> {
        let inner = self.inner.read().unwrap();
        let node = inner.arena.resolve_full(inner.root, pathname)?;
        Some(inner.arena.node(node).data.clone())
    }

    /// Number of children in the named group of the resource addressed by
    /// `pathname` (`"/"` for the root).
    pub fn child_count(&self, pathname: &str, type_name: &str) -> usize {
        let inner = self.inner.read().unwrap();
        match inner.arena.resolve_full(inner.root, pathname) {
            Some(node) => inner.arena.child_type_count(node, type_name),
            None => 0,
        }
    }

    /// Total number of children of the resource addressed by `pathname`.
    pub fn children_count(&self, pathname: &str) -> usize {
        let inner = self.inner.read().unwrap();
        match inner.arena.resolve_full(inner.root, pathname) {
            Some(node) => inner.arena.children_count(node),
            None => 0,
        }
    }

    /// Sets the home target: GET/HEAD of `/` answers with a 303 to this
    /// path whenever it is not `"/"` itself.
    pub fn set_home<P: Into<String>>(&mut self, path: P) {
        self.home = path.into();
    }

    /// Enables positive responses to OPTIONS preflight requests, and
    /// attaches `Access-Control-Allow-Origin` to every successful reply.
    pub fn allow_cors(&mut self, flag: bool) {
        self.allow_cors = flag;
    }

    /// Overrides HTML error output with a custom view rendered through the
    /// configured engine.
    pub fn set_error_view<V: Into<String>>(&mut self, view: V) {
        self.error_view = Some(view.into());
    }

    /// Configures the template-rendering collaborator.
    pub fn set_view_engine<E: ViewEngine>(&mut self, engine: E) {
        self.engine = Some(Arc::new(engine));
    }

    /// Configures the directory literal file paths are served from.
    pub fn set_asset_base<P: Into<PathBuf>>(&mut self, base: P) {
        self.asset_base = Some(base.into());
    }

    /// Turns the filter pipeline on or off.  Registered filters are skipped
    /// entirely while disabled.
    pub fn enable_filters(&mut self, flag: bool) {
        self.filters_enabled = flag;
    }

    /// Registers a request filter under the given name, replacing any
    /// previous filter with that name.
    pub fn add_filter<N: Into<String>, F: Filter>(&mut self, name: N, filter: F) {
        self.filters.insert(name.into(), Arc::new(filter));
        log::info!("filters: {:?}", self.filters.keys().collect::<Vec<_>>());
    }

    /// Removes the named filter; returns whether it existed.
    pub fn remove_filter(&mut self, name: &str) -> bool {
        self.filters.remove(name).is_some()
    }

    /// Drops every registered filter.
    pub fn clear_filters(&mut self) {
        self.filters.clear();
    }

    /// The top-level per-request pipeline: parse the route, check the verb,
    /// parse the body, run the filters, dispatch, and assemble the reply.
    /// Failures at any stage come back as an error body in the request's
    /// negotiated format; this function itself never fails.
    pub async fn handle(&self, request: http::Request<hyper::Body>) -> http::Response<hyper::Body> {
        let (parts, body) = request.into_parts();
        let route = Route::from_parts(parts.method.clone(), &parts.uri, &parts.headers);
        log::info!(">> {} {} (accept {})", route.verb, route.pathname, route.out_format);
        let out_format = route.out_format.clone();

        match self.serve_route(route, body).await {
            Ok(mut reply) => {
                if parts.method == http::Method::HEAD {
                    reply.strip_body();
                }
                if self.allow_cors {
                    let _ = reply.set_header("Access-Control-Allow-Origin", "*");
                }
                log::info!("<< {} {}: {}", parts.method, parts.uri.path(), reply.status);
                reply.into()
            }
            Err(error) => {
                if error.status().as_u16() >= 300 {
                    log::error!(
                        "{} {} failed: {} ({})",
                        parts.method,
                        parts.uri.path(),
                        error.status(),
                        error
                    );
                }
                self.error_reply(&error, &out_format).await.into()
            }
        }
    }

    async fn serve_route(
        &self,
        route: Route,
        body: hyper::Body,
    ) -> Result<Embodiment, RxError> {
        if !is_supported(&route.verb) {
            if route.verb == http::Method::OPTIONS && self.allow_cors {
                let mut reply = Embodiment::empty("application/json", http::StatusCode::OK);
                let _ = reply.set_header("Access-Control-Allow-Origin", "*");
                let _ = reply.set_header(
                    "Access-Control-Allow-Methods",
                    "POST, GET, OPTIONS, PATCH, DELETE",
                );
                return Ok(reply);
            }
            return Err(RxError::verb_not_allowed(&route.verb));
        }

        let bytes = hyper::body::to_bytes(body)
            .await
            .map_err(|err| RxError::handler(format!("could not read request body: {}", err)))?;
        let body = parse_body(&bytes, &route.in_format)?;

        let filters = self.check_filters(&route, &body).await?;
        self.dispatch(route, body, filters).await
    }

    async fn check_filters(&self, route: &Route, body: &Value) -> Result<FiltersData, RxError> {
        if !self.filters_enabled || self.filters.is_empty() {
            log::trace!("no filters executed");
            return Ok(FiltersData::new());
        }
        let filters = self
            .filters
            .iter()
            .map(|(name, filter)| (name.clone(), filter.clone()))
            .collect();
        run_filters(filters, route, body).await
    }

    /// Dispatches an already parsed request against the resource tree.
    pub(crate) async fn dispatch(
        &self,
        route: Route,
        body: Value,
        filters: FiltersData,
    ) -> Result<Embodiment, RxError> {
        if route.is_static {
            return match route.verb {
                http::Method::GET | http::Method::HEAD => match &self.asset_base {
                    Some(base) => serve_static(base, &route.pathname).await,
                    None => Err(RxError::not_found(&route.pathname)),
                },
                _ => Err(RxError::verb_not_allowed(&route.verb)),
            };
        }

        if route.remaining() <= 1 {
            return match route.verb {
                http::Method::GET | http::Method::HEAD => self.serve_home(&route).await,
                _ => Err(RxError::not_found(&route.pathname)),
            };
        }

        let direction = self
            .get_direction(&route)
            .ok_or_else(|| RxError::not_found(&route.pathname))?;
        self.player(direction, body, filters).await
    }

    /// Resolution toward the resource named by the route: the path cache
    /// answers exact-pathname repeats in one lookup, anything else walks a
    /// step from the root.
    fn get_direction(&self, route: &Route) -> Option<Direction> {
        let inner = self.inner.read().unwrap();
        if let Some(entry) = inner.cache.get(&route.pathname) {
            if !inner.arena.node(entry.resource).detached {
                log::info!("{} path cache hit for {:?}", route.verb, route.pathname);
                let mut cached = route.clone();
                cached.path = entry.path.clone();
                return Some(Direction {
                    resource: entry.resource,
                    route: cached,
                });
            }
        }
        log::trace!("{} stepping into {:?}", route.verb, route.pathname);
        inner.arena.resolve_step(inner.root, route)
    }

    /// The shared per-verb shape: descend while segments outnumber the
    /// declared parameters, bind parameters positionally, register the GET
    /// path cache entry, then run the user handler or the default verb
    /// behavior and assemble the reply.
    async fn player(
        &self,
        direction: Direction,
        body: Value,
        filters: FiltersData,
    ) -> Result<Embodiment, RxError> {
        let mut node = direction.resource;
        let mut route = direction.route;

        loop {
            match self.descend_once(node, &route)? {
                StepOutcome::Descend(next) => {
                    node = next.resource;
                    route = next.route;
                }
                StepOutcome::Target => break,
            }
        }

        let snapshot = self.snapshot(node, &route.verb);
        log::info!(
            "{} target found: {} (requires {} parameters)",
            route.verb,
            snapshot.name,
            snapshot.parameter_names.len()
        );

        let (params, bound) = bind_parameters(&snapshot.parameter_names, &route.path);
        // POST treats parameters as optional context rather than addressing
        let strict = route.verb != http::Method::POST;
        if strict && bound < snapshot.parameter_names.len() {
            return Err(RxError::parameters(&route.verb, &snapshot.name));
        }

        if route.verb == http::Method::GET {
            let mut inner = self.inner.write().unwrap();
            inner.cache.insert(
                route.pathname.clone(),
                CacheEntry {
                    resource: node,
                    path: route.path.clone(),
                },
            );
        }

        let out_format = snapshot
            .out_format
            .clone()
            .unwrap_or_else(|| route.out_format.clone());
        let deliver_any = snapshot.out_format.is_some();

        let response = match &snapshot.handler {
            Some(handler) => {
                log::info!("invoking {} on {} ({})", route.verb, snapshot.name, out_format);
                let context = Context {
                    query: route.query.clone(),
                    params,
                    body,
                    data: snapshot.data.clone(),
                    filters,
                    headers: route.headers.clone(),
                    cookies: route.cookies.clone(),
                };
                let response = handler.call(context).await?;
                if write_back(&route.verb) && !response.data.is_null() {
                    let mut inner = self.inner.write().unwrap();
                    inner.arena.node_mut(node).data = response.data.clone();
                }
                response
            }
            None => self.default_behavior(node, &route, body, &snapshot)?,
        };

        deliver_reply(
            &snapshot.reply,
            response,
            &out_format,
            deliver_any,
            self.engine.as_ref(),
        )
        .await
    }

    /// Built-in verb behavior for resources without a user handler.
    fn default_behavior(
        &self,
        node: NodeId,
        route: &Route,
        body: Value,
        snapshot: &TargetSnapshot,
    ) -> Result<ResourceResponse, RxError> {
        match route.verb {
            http::Method::GET => {
                log::trace!("returning static data from {}", snapshot.name);
                Ok(ResourceResponse::ok(snapshot.data.clone()))
            }
            http::Method::POST | http::Method::PATCH => {
                let mut inner = self.inner.write().unwrap();
                let data = &mut inner.arena.node_mut(node).data;
                merge_data(data, body);
                Ok(ResourceResponse::ok(data.clone()))
            }
            http::Method::DELETE => {
                let mut inner = self.inner.write().unwrap();
                let data = inner.arena.node(node).data.clone();
                detach(&mut inner, node);
                Ok(ResourceResponse::ok(data))
            }
            _ => Err(RxError::not_implemented(&route.verb)),
        }
    }

    async fn serve_home(&self, route: &Route) -> Result<Embodiment, RxError> {
        if self.home != "/" {
            log::info!("{} redirecting to home {:?}", route.verb, self.home);
            return deliver_reply(
                &ReplyTarget::bare(),
                ResourceResponse::redirect(self.home.clone()),
                &route.out_format,
                false,
                self.engine.as_ref(),
            )
            .await;
        }
        let data = {
            let inner = self.inner.read().unwrap();
            let root = inner.root;
            inner.arena.node(root).data.clone()
        };
        deliver_reply(
            &ReplyTarget::bare(),
            ResourceResponse::ok(data),
            &route.out_format,
            false,
            self.engine.as_ref(),
        )
        .await
    }

    fn descend_once(&self, node: NodeId, route: &Route) -> Result<StepOutcome, RxError> {
        let inner = self.inner.read().unwrap();
        let current = inner.arena.node(node);
        if route.remaining() <= 1 + current.parameter_names.len() {
            return Ok(StepOutcome::Target);
        }
        match inner.arena.resolve_step(node, route) {
            Some(direction) => Ok(StepOutcome::Descend(direction)),
            None if !current.has_children() => {
                Err(RxError::no_child(&current.name, &route.pathname))
            }
            None => Err(RxError::not_found(&route.pathname)),
        }
    }

    fn snapshot(&self, node: NodeId, verb: &http::Method) -> TargetSnapshot {
        let inner = self.inner.read().unwrap();
        let n = inner.arena.node(node);
        TargetSnapshot {
            name: n.name.clone(),
            data: n.data.clone(),
            parameter_names: n.parameter_names.clone(),
            out_format: n.out_format.clone(),
            handler: n.handlers.for_verb(verb),
            reply: ReplyTarget {
                view: n.view.clone(),
                layout: n.layout.clone(),
                headers: n.headers.clone(),
                cookies: n.cookies.clone(),
            },
        }
    }

    async fn error_reply(&self, error: &RxError, out_format: &str) -> Embodiment {
        let wants_html = out_format
            .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
            .any(|token| token == "text/html");
        if wants_html {
            if let (Some(view), Some(engine)) = (&self.error_view, &self.engine) {
                log::info!("custom error view [{}]", view);
                match engine
                    .render(view, None, &embodiment::error_object(error))
                    .await
                {
                    Ok(mut reply) => {
                        reply.status = error.status();
                        return reply;
                    }
                    Err(render_error) => {
                        log::error!("custom error view failed: {}", render_error);
                    }
                }
            }
        }
        embodiment::error_body(error, out_format)
    }

    /// Binds this site to the given address and serves it until the process
    /// ends.
    ///
    /// # Errors
    /// Fails when the address cannot be parsed or the listener cannot bind.
    pub async fn listen(self, address: &str) -> Result<(), ServeError> {
        let address: SocketAddr = address
            .parse()
            .map_err(|_| ServeError::InvalidAddress(address.to_owned()))?;

        log::info!("listen({})", address);

        let this = SiteService(Arc::new(self));

        hyper::server::Server::bind(&address)
            .serve(hyper::service::make_service_fn(|_| {
                let site = this.clone();
                async move { Ok::<_, std::convert::Infallible>(site) }
            }))
            .await
            .map_err(ServeError::HyperServer)?;

        Ok(())
    }
}

impl std::fmt::Debug for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Site")
            .field("name", &self.name)
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .field("filters_enabled", &self.filters_enabled)
            .field("home", &self.home)
            .finish()
    }
}

/// Detaches the node, dropping cache entries for it and its whole subtree
/// first so a stale pathname can never resolve to a detached resource.
fn detach(inner: &mut SiteInner, node: NodeId) -> bool {
    let doomed = inner.arena.subtree(node);
    inner.cache.retain(|_, entry| !doomed.contains(&entry.resource));
    inner.arena.remove(node)
}

fn is_supported(verb: &http::Method) -> bool {
    matches!(
        *verb,
        http::Method::GET
            | http::Method::POST
            | http::Method::PUT
            | http::Method::PATCH
            | http::Method::DELETE
            | http::Method::HEAD
    )
}

// GET/PATCH/DELETE handler results are written back into the node, so a
// later default GET observes what the handler last produced.
fn write_back(verb: &http::Method) -> bool {
    matches!(
        *verb,
        http::Method::GET | http::Method::PATCH | http::Method::DELETE
    )
}

/// Consumes up to `names.len()` path segments positionally into a parameter
/// map; returns the map and how many were actually bound.
fn bind_parameters(names: &[String], path: &[String]) -> (HashMap<String, String>, usize) {
    let mut params = HashMap::new();
    let mut bound = 0;
    for (idx, name) in names.iter().enumerate() {
        match path.get(idx + 1) {
            Some(segment) => {
                params.insert(name.clone(), segment.clone());
                bound += 1;
            }
            None => break,
        }
    }
    (params, bound)
}

/// Shallow merge of a request body into resource data: object keys
/// overwrite one by one, anything else replaces the data wholesale.  Null
/// bodies leave the data alone.
fn merge_data(data: &mut Value, body: Value) {
    match body {
        Value::Null => {}
        Value::Object(incoming) => match data.as_object_mut() {
            Some(target) => {
                for (key, value) in incoming {
                    target.insert(key, value);
                }
            }
            None => *data = Value::Object(incoming),
        },
        other => *data = other,
    }
}

fn parse_body(bytes: &[u8], in_format: &mime::Mime) -> Result<Value, RxError> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    // Match on essence only; parameters like `charset=utf-8` never decide
    // the parser.
    if in_format.type_() == mime::APPLICATION && in_format.subtype() == mime::JSON {
        serde_json::from_slice(bytes).map_err(|err| RxError::bad_body(&err.to_string()))
    } else if in_format.type_() == mime::APPLICATION
        && in_format.subtype() == mime::WWW_FORM_URLENCODED
    {
        let pairs: HashMap<String, String> = serde_urlencoded::from_bytes(bytes)
            .map_err(|err| RxError::bad_body(&err.to_string()))?;
        Ok(Value::Object(
            pairs
                .into_iter()
                .map(|(key, value)| (key, Value::String(value)))
                .collect(),
        ))
    } else if in_format.type_() == mime::TEXT {
        Ok(Value::String(
            String::from_utf8_lossy(bytes).into_owned(),
        ))
    } else {
        // Other body formats (multipart and friends) are collaborator
        // territory; the raw bytes are not surfaced to handlers.
        Ok(Value::Null)
    }
}

#[derive(Clone)]
struct SiteService(Arc<Site>);

impl tower::Service<hyper::Request<hyper::Body>> for SiteService {
    type Response = hyper::Response<hyper::Body>;
    type Error = std::convert::Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: hyper::Request<hyper::Body>) -> Self::Future {
        let site = self.0.clone();
        Box::pin(async move { Ok(site.handle(request).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(method: http::Method, path: &str) -> http::Request<hyper::Body> {
        http::Request::builder()
            .method(method)
            .uri(path)
            .body(hyper::Body::empty())
            .unwrap()
    }

    fn request_with(
        method: http::Method,
        path: &str,
        accept: &str,
        body: Option<Value>,
    ) -> http::Request<hyper::Body> {
        let mut builder = http::Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::ACCEPT, accept);
        let body = match body {
            Some(value) => {
                builder = builder.header(http::header::CONTENT_TYPE, "application/json");
                hyper::Body::from(serde_json::to_vec(&value).unwrap())
            }
            None => hyper::Body::empty(),
        };
        builder.body(body).unwrap()
    }

    async fn body_json(response: http::Response<hyper::Body>) -> Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: http::Response<hyper::Body>) -> String {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    struct ErrorPageEngine;

    #[async_trait]
    impl ViewEngine for ErrorPageEngine {
        async fn render(
            &self,
            view: &str,
            _layout: Option<&str>,
            data: &Value,
        ) -> Result<Embodiment, RxError> {
            Ok(Embodiment::buffered(
                "text/html",
                http::StatusCode::OK,
                format!("<p>{}: {}</p>", view, data["error"]["message"]),
            ))
        }
    }

    struct BrokenEngine;

    #[async_trait]
    impl ViewEngine for BrokenEngine {
        async fn render(
            &self,
            _view: &str,
            _layout: Option<&str>,
            _data: &Value,
        ) -> Result<Embodiment, RxError> {
            Err(RxError::handler("template exploded"))
        }
    }

    #[tokio::test]
    async fn default_get_returns_resource_data() {
        let site = Site::new("test");
        site.add(Resource::new("users").data(serde_json::json!({ "count": 3 })));

        let response = site.handle(request(http::Method::GET, "/users")).await;
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(
            response.headers()[http::header::CONTENT_TYPE],
            "application/json"
        );
        assert_eq!(body_json(response).await, serde_json::json!({ "count": 3 }));
    }

    #[tokio::test]
    async fn cache_miss_then_hit_yield_identical_payloads() {
        let site = Site::new("test");
        site.add(
            Resource::new("users").child(
                Resource::new("detail")
                    .parameter("id")
                    .on_get(|cx: Context| async move {
                        Ok(ResourceResponse::ok(serde_json::json!({
                            "id": cx.param("id").unwrap(),
                        })))
                    }),
            ),
        );

        let first = site.handle(request(http::Method::GET, "/users/detail/7")).await;
        assert!(site.inner.read().unwrap().cache.contains_key("/users/detail/7"));
        let second = site.handle(request(http::Method::GET, "/users/detail/7")).await;
        assert_eq!(body_json(first).await, body_json(second).await);
    }

    #[tokio::test]
    async fn sibling_index_dispatches_to_that_exact_node() {
        // tree: site -> "items"[2] -> "detail"(param: id)
        let hits = Arc::new(AtomicUsize::new(0));
        let site = Site::new("test");
        site.add(Resource::new("items").child(
            Resource::new("detail").parameter("id").on_get(|_cx: Context| async {
                Ok(ResourceResponse::ok(serde_json::json!({ "node": 0 })))
            }),
        ));
        let second_hits = hits.clone();
        site.add(Resource::new("items").child(
            Resource::new("detail").parameter("id").on_get(move |cx: Context| {
                let hits = second_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(ResourceResponse::ok(serde_json::json!({
                        "node": 1,
                        "id": cx.param("id").unwrap(),
                    })))
                }
            }),
        ));

        let response = site
            .handle(request(http::Method::GET, "/items/1/detail/42"))
            .await;
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "node": 1, "id": "42" })
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_with_missing_parameters_never_reaches_the_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let handler_hits = hits.clone();
        let site = Site::new("test");
        site.add(
            Resource::new("users")
                .parameter("id")
                .parameter("page")
                .on_get(move |_cx: Context| {
                    let hits = handler_hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(ResourceResponse::ok(Value::Null))
                    }
                }),
        );

        let response = site.handle(request(http::Method::GET, "/users/42")).await;
        assert_eq!(response.status(), http::StatusCode::NOT_FOUND);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn post_tolerates_missing_parameters() {
        let site = Site::new("test");
        site.add(
            Resource::new("users")
                .parameter("id")
                .on_post(|cx: Context| async move {
                    assert!(cx.param("id").is_none());
                    Ok(ResourceResponse::ok(serde_json::json!({ "created": true })))
                }),
        );

        let response = site
            .handle(request_with(
                http::Method::POST,
                "/users",
                "*/*",
                Some(serde_json::json!({ "name": "amy" })),
            ))
            .await;
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({ "created": true }));
    }

    #[tokio::test]
    async fn unsupported_accept_is_a_415() {
        let site = Site::new("test");
        site.add(Resource::new("users").on_get(|_cx: Context| async {
            Ok(ResourceResponse::ok(serde_json::json!({ "plain": true })))
        }));

        let ok = site
            .handle(request_with(http::Method::GET, "/users", "application/json", None))
            .await;
        assert_eq!(ok.status(), http::StatusCode::OK);

        let bad = site
            .handle(request_with(http::Method::GET, "/users", "image/png", None))
            .await;
        assert_eq!(bad.status(), http::StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn rejecting_filter_blocks_dispatch() {
        let hits = Arc::new(AtomicUsize::new(0));
        let handler_hits = hits.clone();
        let mut site = Site::new("test");
        site.add(Resource::new("users").on_get(move |_cx: Context| {
            let hits = handler_hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(ResourceResponse::ok(Value::Null))
            }
        }));
        site.add_filter("pass", |_route: Route, _body: Value| async {
            Ok(serde_json::json!({ "seen": true }))
        });
        site.add_filter("deny", |_route: Route, _body: Value| async {
            Err(RxError::handler("no token").with_status(http::StatusCode::UNAUTHORIZED))
        });
        site.enable_filters(true);

        let response = site.handle(request(http::Method::GET, "/users")).await;
        assert_eq!(response.status(), http::StatusCode::UNAUTHORIZED);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        let error = body_json(response).await;
        assert_eq!(error["result"], "error");
        assert!(error["error"]["message"].as_str().unwrap().contains("no token"));

        // disabled filters are skipped entirely
        site.enable_filters(false);
        let response = site.handle(request(http::Method::GET, "/users")).await;
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn filter_data_reaches_the_handler() {
        let mut site = Site::new("test");
        site.add(Resource::new("users").on_get(|cx: Context| async move {
            Ok(ResourceResponse::ok(
                cx.filter_data("auth").cloned().unwrap_or(Value::Null),
            ))
        }));
        site.add_filter("auth", |_route: Route, _body: Value| async {
            Ok(serde_json::json!({ "user": "amy" }))
        });
        site.enable_filters(true);

        let response = site.handle(request(http::Method::GET, "/users")).await;
        assert_eq!(body_json(response).await, serde_json::json!({ "user": "amy" }));
    }

    #[tokio::test]
    async fn add_then_remove_shrinks_the_group_and_unresolves_the_path() {
        let site = Site::new("test");
        site.add(Resource::new("users"));
        site.add(Resource::new("users"));
        assert_eq!(site.child_count("/", "users"), 2);

        assert!(site.remove("/users/1"));
        assert_eq!(site.child_count("/", "users"), 1);

        assert!(site.remove("/users"));
        assert_eq!(site.child_count("/", "users"), 0);
        assert!(site.lookup_data("/users").is_none());
        assert!(!site.remove("/users"));
    }

    #[tokio::test]
    async fn removal_invalidates_cached_paths() {
        let site = Site::new("test");
        site.add(Resource::new("users").data(serde_json::json!({ "a": 1 })));

        let response = site.handle(request(http::Method::GET, "/users")).await;
        assert_eq!(response.status(), http::StatusCode::OK);
        assert!(site.inner.read().unwrap().cache.contains_key("/users"));

        assert!(site.remove("/users"));
        assert!(!site.inner.read().unwrap().cache.contains_key("/users"));
        let response = site.handle(request(http::Method::GET, "/users")).await;
        assert_eq!(response.status(), http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn default_delete_detaches_the_node() {
        let site = Site::new("test");
        site.add(Resource::new("users"));

        let response = site.handle(request(http::Method::DELETE, "/users")).await;
        assert_eq!(response.status(), http::StatusCode::OK);
        assert!(site.lookup_data("/users").is_none());

        let again = site.handle(request(http::Method::GET, "/users")).await;
        assert_eq!(again.status(), http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn default_post_merges_the_body() {
        let site = Site::new("test");
        site.add(Resource::new("prefs").data(serde_json::json!({ "a": 1, "b": 2 })));

        let response = site
            .handle(request_with(
                http::Method::POST,
                "/prefs",
                "*/*",
                Some(serde_json::json!({ "b": 3, "c": 4 })),
            ))
            .await;
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "a": 1, "b": 3, "c": 4 })
        );
        assert_eq!(
            site.lookup_data("/prefs").unwrap(),
            serde_json::json!({ "a": 1, "b": 3, "c": 4 })
        );
    }

    #[tokio::test]
    async fn parameterized_content_types_still_parse_the_body() {
        let site = Site::new("test");
        site.add(Resource::new("prefs").data(serde_json::json!({ "a": 1 })));

        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri("/prefs")
            .header(http::header::CONTENT_TYPE, "application/json; charset=utf-8")
            .body(hyper::Body::from(r#"{ "b": 2 }"#))
            .unwrap();
        let response = site.handle(request).await;
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "a": 1, "b": 2 })
        );

        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri("/prefs")
            .header(
                http::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded; charset=utf-8",
            )
            .body(hyper::Body::from("c=3"))
            .unwrap();
        let response = site.handle(request).await;
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(
            site.lookup_data("/prefs").unwrap(),
            serde_json::json!({ "a": 1, "b": 2, "c": "3" })
        );
    }

    #[tokio::test]
    async fn put_without_handler_is_not_implemented() {
        let site = Site::new("test");
        site.add(Resource::new("users"));

        let response = site.handle(request(http::Method::PUT, "/users")).await;
        assert_eq!(response.status(), http::StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn unsupported_verb_is_forbidden() {
        let site = Site::new("test");
        let response = site.handle(request(http::Method::TRACE, "/users")).await;
        assert_eq!(response.status(), http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn cors_preflight_when_enabled() {
        let mut site = Site::new("test");
        let denied = site.handle(request(http::Method::OPTIONS, "/users")).await;
        assert_eq!(denied.status(), http::StatusCode::FORBIDDEN);

        site.allow_cors(true);
        let response = site.handle(request(http::Method::OPTIONS, "/users")).await;
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.headers()["Access-Control-Allow-Origin"], "*");
        assert!(response.headers().contains_key("Access-Control-Allow-Methods"));
    }

    #[tokio::test]
    async fn custom_error_view_renders_for_html_requests() {
        let mut site = Site::new("test");
        site.set_error_view("oops");
        site.set_view_engine(ErrorPageEngine);

        let response = site
            .handle(request_with(http::Method::GET, "/missing", "text/html", None))
            .await;
        // the error's status rides on the rendered page
        assert_eq!(response.status(), http::StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[http::header::CONTENT_TYPE], "text/html");
        let body = body_text(response).await;
        assert!(body.contains("<p>oops:"));
        assert!(body.contains("not found"));

        // non-html requests keep the structured error body
        let response = site
            .handle(request_with(
                http::Method::GET,
                "/missing",
                "application/json",
                None,
            ))
            .await;
        assert_eq!(response.status(), http::StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["result"], "error");
    }

    #[tokio::test]
    async fn error_view_render_failure_falls_back_to_the_builtin_page() {
        let mut site = Site::new("test");
        site.set_error_view("oops");
        site.set_view_engine(BrokenEngine);

        let response = site
            .handle(request_with(http::Method::GET, "/missing", "text/html", None))
            .await;
        assert_eq!(response.status(), http::StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[http::header::CONTENT_TYPE], "text/html");
        let body = body_text(response).await;
        assert!(body.contains("resin:"));
        assert!(body.contains("resource not found"));
    }

    #[tokio::test]
    async fn resource_view_renders_through_the_site_engine() {
        let mut site = Site::new("test");
        site.set_view_engine(ErrorPageEngine);
        site.add(
            Resource::new("page")
                .view("page")
                .data(serde_json::json!({ "error": { "message": "none" } })),
        );

        let response = site
            .handle(request_with(http::Method::GET, "/page", "text/html", None))
            .await;
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.headers()[http::header::CONTENT_TYPE], "text/html");
        assert!(body_text(response).await.contains("<p>page:"));
    }

    #[tokio::test]
    async fn home_redirect() {
        let mut site = Site::new("test");
        site.set_home("/app");
        let response = site.handle(request(http::Method::GET, "/")).await;
        assert_eq!(response.status(), http::StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[http::header::LOCATION], "/app");
    }

    #[tokio::test]
    async fn root_get_delivers_site_data_when_home_is_root() {
        let site = Site::new("test");
        let response = site.handle(request(http::Method::GET, "/")).await;
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({}));
    }

    #[tokio::test]
    async fn head_strips_the_body() {
        let site = Site::new("test");
        site.add(Resource::new("users").on_head(|_cx: Context| async {
            Ok(ResourceResponse::ok(serde_json::json!({ "never": "sent" })))
        }));

        let response = site.handle(request(http::Method::HEAD, "/users")).await;
        assert_eq!(response.status(), http::StatusCode::OK);
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn missing_child_errors_name_the_condition() {
        let site = Site::new("test");
        site.add(Resource::new("leaf"));
        site.add(Resource::new("parent").child(Resource::new("known")));

        // a resource with no children at all
        let response = site.handle(request(http::Method::GET, "/leaf/below")).await;
        assert_eq!(response.status(), http::StatusCode::NOT_FOUND);
        let error = body_json(response).await;
        assert!(error["error"]["message"]
            .as_str()
            .unwrap()
            .contains("no child resource available"));

        // a resource with children, none matching
        let response = site
            .handle(request(http::Method::GET, "/parent/unknown"))
            .await;
        assert_eq!(response.status(), http::StatusCode::NOT_FOUND);
        let error = body_json(response).await;
        assert!(!error["error"]["message"]
            .as_str()
            .unwrap()
            .contains("no child resource available"));
    }

    #[tokio::test]
    async fn handler_error_status_is_honored() {
        let site = Site::new("test");
        site.add(Resource::new("users").on_get(|_cx: Context| async {
            Err(RxError::handler("cannot comply").with_status(http::StatusCode::CONFLICT))
        }));

        let response = site.handle(request(http::Method::GET, "/users")).await;
        assert_eq!(response.status(), http::StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn patch_handler_result_is_written_back() {
        let site = Site::new("test");
        site.add(
            Resource::new("prefs")
                .data(serde_json::json!({ "old": true }))
                .on_patch(|_cx: Context| async {
                    Ok(ResourceResponse::ok(serde_json::json!({ "new": true })))
                }),
        );

        let response = site
            .handle(request_with(http::Method::PATCH, "/prefs", "*/*", Some(Value::Null)))
            .await;
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(
            site.lookup_data("/prefs").unwrap(),
            serde_json::json!({ "new": true })
        );
    }

    #[tokio::test]
    async fn add_at_attaches_a_subtree_at_runtime() {
        let site = Site::new("test");
        site.add(Resource::new("users"));
        site.add_at("/users", Resource::new("posts").data(serde_json::json!({ "n": 1 })))
            .unwrap();

        assert_eq!(
            site.lookup_data("/users/posts").unwrap(),
            serde_json::json!({ "n": 1 })
        );
        assert!(site.add_at("/missing", Resource::new("x")).is_err());
    }

    #[tokio::test]
    async fn resource_headers_and_cookies_ride_along() {
        let site = Site::new("test");
        site.add(
            Resource::new("users")
                .header("x-powered-by", "resin")
                .unwrap()
                .cookie("session=abc"),
        );

        let response = site.handle(request(http::Method::GET, "/users")).await;
        assert_eq!(response.headers()["x-powered-by"], "resin");
        assert_eq!(response.headers()[http::header::SET_COOKIE], "session=abc");
    }

    #[tokio::test]
    async fn forced_out_format_delivers_verbatim() {
        let site = Site::new("test");
        site.add(
            Resource::new("report")
                .out_format("text/csv")
                .on_get(|_cx: Context| async {
                    Ok(ResourceResponse::ok(serde_json::json!("a,b\n1,2")))
                }),
        );

        let response = site
            .handle(request_with(http::Method::GET, "/report", "image/png", None))
            .await;
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.headers()[http::header::CONTENT_TYPE], "text/csv");
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&bytes[..], b"a,b\n1,2");
    }
}
