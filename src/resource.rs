use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::error::RxError;
use crate::filter::FiltersData;

/// What a handler invocation sees: the request broken down into the pieces a
/// resource cares about.  Everything is owned, so handler futures can move
/// freely across await points and tasks.
#[derive(Debug, Clone)]
pub struct Context {
    /// Parsed query-string pairs.
    pub query: HashMap<String, String>,
    /// URL parameters bound positionally from the path, keyed by the names
    /// the resource declared.
    pub params: HashMap<String, String>,
    /// The parsed request body; `Null` for body-less verbs.
    pub body: Value,
    /// Snapshot of the resource's data at dispatch time.
    pub data: Value,
    /// Data contributed by request filters, keyed by filter name.
    pub filters: FiltersData,
    /// The request headers.
    pub headers: http::HeaderMap,
    /// Cookies received with the request.
    pub cookies: Vec<cookie::Cookie<'static>>,
}

impl Context {
    /// Looks up a bound URL parameter by its declared name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Looks up the data contributed by the named filter.
    pub fn filter_data(&self, name: &str) -> Option<&Value> {
        self.filters.get(name)
    }
}

/// The handler-facing result envelope: payload, status, optional redirect
/// location, and the outgoing cookies/headers to attach to the reply.
#[derive(Debug, Clone)]
#[must_use]
pub struct ResourceResponse {
    /// The response payload, serialized during reply assembly.
    pub data: Value,
    /// The HTTP status to respond with.
    pub status: http::StatusCode,
    /// Redirect target; set by [`ResourceResponse::redirect`].
    pub location: Option<String>,
    /// Serialized `Set-Cookie` values.
    pub cookies: Vec<String>,
    /// Additional outgoing headers.
    pub headers: http::HeaderMap,
}

impl ResourceResponse {
    /// A successful response carrying the given payload, status 200.
    pub fn ok<V: Into<Value>>(data: V) -> Self {
        ResourceResponse {
            data: data.into(),
            status: http::StatusCode::OK,
            location: None,
            cookies: vec![],
            headers: http::HeaderMap::new(),
        }
    }

    /// A 303 redirect to the given location.
    pub fn redirect<L: Into<String>>(location: L) -> Self {
        let mut response = ResourceResponse::ok(Value::Null);
        response.status = http::StatusCode::SEE_OTHER;
        response.location = Some(location.into());
        response
    }

    /// Replaces the status code.
    pub fn with_status(mut self, status: http::StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Appends a serialized `Set-Cookie` value.
    pub fn with_cookie<C: Into<String>>(mut self, cookie: C) -> Self {
        self.cookies.push(cookie.into());
        self
    }

    /// Sets an outgoing header.
    ///
    /// # Errors
    /// Fails if the given value cannot be converted into a header value.
    pub fn with_header<H, V>(mut self, key: H, value: V) -> Result<Self, http::Error>
    where
        H: http::header::IntoHeaderName,
        V: TryInto<http::HeaderValue>,
        http::Error: From<<V as TryInto<http::HeaderValue>>::Error>,
    {
        self.headers.insert(key, value.try_into()?);
        Ok(self)
    }
}

#[async_trait]
/// A per-verb request handler attached to a resource.
///
/// This is automatically implemented for
/// `Fn(Context) -> impl Future<Output = Result<ResourceResponse, RxError>>`
/// types, but it may be useful to implement it yourself.  The dispatcher
/// awaits the returned future, so a handler may settle arbitrarily later;
/// failures travel through the `Err` side rather than crashing dispatch.
pub trait Handler: Send + Sync + 'static {
    #[must_use]
    /// Produces the resource's answer for one request.
    async fn call(&self, context: Context) -> Result<ResourceResponse, RxError>;

    #[doc(hidden)]
    fn describe(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", std::any::type_name::<Self>())
    }
}

impl std::fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.describe(f)
    }
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ResourceResponse, RxError>> + Send + 'static,
{
    async fn call(&self, context: Context) -> Result<ResourceResponse, RxError> {
        self(context).await
    }
}

/// The optional user handlers of a resource, one slot per supported verb.
#[derive(Default, Clone)]
pub(crate) struct VerbHandlers {
    pub get: Option<Arc<dyn Handler>>,
    pub post: Option<Arc<dyn Handler>>,
    pub put: Option<Arc<dyn Handler>>,
    pub patch: Option<Arc<dyn Handler>>,
    pub delete: Option<Arc<dyn Handler>>,
    pub head: Option<Arc<dyn Handler>>,
}

impl VerbHandlers {
    pub fn for_verb(&self, verb: &http::Method) -> Option<Arc<dyn Handler>> {
        match *verb {
            http::Method::GET => self.get.clone(),
            http::Method::POST => self.post.clone(),
            http::Method::PUT => self.put.clone(),
            http::Method::PATCH => self.patch.clone(),
            http::Method::DELETE => self.delete.clone(),
            http::Method::HEAD => self.head.clone(),
            _ => None,
        }
    }
}

impl std::fmt::Debug for VerbHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerbHandlers")
            .field("get", &self.get.is_some())
            .field("post", &self.post.is_some())
            .field("put", &self.put.is_some())
            .field("patch", &self.patch.is_some())
            .field("delete", &self.delete.is_some())
            .field("head", &self.head.is_some())
            .finish()
    }
}

/// A declarative resource descriptor.  Built with the methods below and
/// handed to [`crate::Site::add`], which instantiates one tree node per
/// descriptor, recursively, preserving the declared nesting order.
///
/// # Examples
/// ```rust
/// use resin::{Resource, ResourceResponse};
///
/// let users = Resource::new("users")
///     .data(serde_json::json!({ "count": 0 }))
///     .child(
///         Resource::new("detail")
///             .parameter("id")
///             .on_get(|cx: resin::Context| async move {
///                 let id = cx.param("id").unwrap_or("?").to_owned();
///                 Ok(ResourceResponse::ok(serde_json::json!({ "id": id })))
///             }),
///     );
/// ```
#[derive(Debug)]
pub struct Resource {
    pub(crate) name: String,
    pub(crate) view: Option<String>,
    pub(crate) layout: Option<String>,
    pub(crate) data: Value,
    pub(crate) children: Vec<Resource>,
    pub(crate) parameters: Vec<String>,
    pub(crate) out_format: Option<String>,
    pub(crate) headers: http::HeaderMap,
    pub(crate) cookies: Vec<String>,
    pub(crate) handlers: VerbHandlers,
}

macro_rules! handler_setter {
    ($($(#[$m:meta])* $name:ident => $slot:ident;)+) => {
        $(
            $(#[$m])*
            pub fn $name<H: Handler>(mut self, handler: H) -> Self {
                self.handlers.$slot = Some(Arc::new(handler));
                self
            }
        )+
    };
}

impl Resource {
    /// Starts a descriptor for a resource with the given name.  The name is
    /// slugified into its routing token when the resource is registered.
    pub fn new<N: Into<String>>(name: N) -> Self {
        Resource {
            name: name.into(),
            view: None,
            layout: None,
            data: Value::Object(Default::default()),
            children: vec![],
            parameters: vec![],
            out_format: None,
            headers: http::HeaderMap::new(),
            cookies: vec![],
            handlers: VerbHandlers::default(),
        }
    }

    /// Names the view used to render this resource for HTML requests.
    pub fn view<V: Into<String>>(mut self, view: V) -> Self {
        self.view = Some(view.into());
        self
    }

    /// Names the layout the view renders inside.
    pub fn layout<L: Into<String>>(mut self, layout: L) -> Self {
        self.layout = Some(layout.into());
        self
    }

    /// Sets the static data this resource starts with.
    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Appends a nested resource descriptor.
    pub fn child(mut self, child: Resource) -> Self {
        self.children.push(child);
        self
    }

    /// Declares a positional URL parameter.  The number of declared
    /// parameters decides how many extra path segments this resource
    /// consumes before the next segment is treated as a further routing
    /// step.
    pub fn parameter<P: Into<String>>(mut self, name: P) -> Self {
        self.parameters.push(name.into());
        self
    }

    /// Forces the output format of this resource, overriding the request's
    /// accepted formats.
    pub fn out_format<F: Into<String>>(mut self, format: F) -> Self {
        self.out_format = Some(format.into());
        self
    }

    /// Sets a header attached to every reply from this resource.
    ///
    /// # Errors
    /// Fails if the given value cannot be converted into a header value.
    pub fn header<H, V>(mut self, key: H, value: V) -> Result<Self, http::Error>
    where
        H: http::header::IntoHeaderName,
        V: TryInto<http::HeaderValue>,
        http::Error: From<<V as TryInto<http::HeaderValue>>::Error>,
    {
        self.headers.insert(key, value.try_into()?);
        Ok(self)
    }

    /// Appends a serialized `Set-Cookie` value attached to every reply from
    /// this resource.
    pub fn cookie<C: Into<String>>(mut self, cookie: C) -> Self {
        self.cookies.push(cookie.into());
        self
    }

    handler_setter![
        /// Attaches the GET handler.
        on_get => get;
        /// Attaches the POST handler.
        on_post => post;
        /// Attaches the PUT handler.
        on_put => put;
        /// Attaches the PATCH handler.
        on_patch => patch;
        /// Attaches the DELETE handler.
        on_delete => delete;
        /// Attaches the HEAD handler.
        on_head => head;
    ];
}
