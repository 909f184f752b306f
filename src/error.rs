use std::backtrace::Backtrace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The failure class of an [`RxError`].  Every internal failure maps onto
/// exactly one of these; the kind decides the default HTTP status when the
/// originator did not supply one.
pub enum ErrorKind {
    /// A resource or path could not be resolved (404).
    Resolution,
    /// Fewer URL parameters were supplied than the resource declares (404).
    Parameter,
    /// No acceptable representation could be produced (415).
    MediaType,
    /// The HTTP method is unsupported or has no implementation (403/501).
    VerbNotAllowed,
    /// A user handler failed, or the request body was unparseable (500).
    Handler,
}

impl ErrorKind {
    /// Short printable name for this kind, used in error bodies.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Resolution => "resource not found",
            ErrorKind::Parameter => "missing parameters",
            ErrorKind::MediaType => "unsupported media type",
            ErrorKind::VerbNotAllowed => "verb not allowed",
            ErrorKind::Handler => "handler error",
        }
    }

    fn default_status(self) -> http::StatusCode {
        match self {
            ErrorKind::Resolution | ErrorKind::Parameter => http::StatusCode::NOT_FOUND,
            ErrorKind::MediaType => http::StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ErrorKind::VerbNotAllowed => http::StatusCode::FORBIDDEN,
            ErrorKind::Handler => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
/// A typed dispatch error.  Everything that can fail between accepting a
/// request and writing its reply is carried as one of these: a message, a
/// short kind, an HTTP status code, and the trace captured at construction.
/// The dispatch pipeline catches it exactly once at the top level and renders
/// it into an error body matching the request's negotiated format.
pub struct RxError {
    kind: ErrorKind,
    message: String,
    status: http::StatusCode,
    extra: Option<String>,
    trace: String,
}

impl RxError {
    /// Creates an error of the given kind with its default status code.
    pub fn new<M: Into<String>>(kind: ErrorKind, message: M) -> Self {
        RxError {
            kind,
            message: message.into(),
            status: kind.default_status(),
            extra: None,
            trace: Backtrace::capture().to_string(),
        }
    }

    /// A resource or path could not be resolved.
    pub fn not_found(pathname: &str) -> Self {
        RxError::new(
            ErrorKind::Resolution,
            format!("resource not found or invalid in request {:?}", pathname),
        )
        .with_extra(pathname)
    }

    /// Resolution failed below a resource that has no children at all.  This
    /// is deliberately distinct from [`RxError::not_found`]: it names the
    /// resource whose subtree is empty.
    pub fn no_child(resource: &str, pathname: &str) -> Self {
        RxError::new(
            ErrorKind::Resolution,
            format!(
                "resource {:?} has no child resource available for {:?}",
                resource, pathname
            ),
        )
        .with_extra(pathname)
    }

    /// Not enough path segments were present to bind every declared URL
    /// parameter.
    pub fn parameters(verb: &http::Method, resource: &str) -> Self {
        RxError::new(
            ErrorKind::Parameter,
            format!("not enough parameters in the URI for {} {}", verb, resource),
        )
    }

    /// No acceptable representation exists for the requested formats.
    pub fn media_type(out_format: &str) -> Self {
        RxError::new(
            ErrorKind::MediaType,
            format!("output as ({}) is not available for this resource", out_format),
        )
    }

    /// The request method is not in the supported verb set.
    pub fn verb_not_allowed(verb: &http::Method) -> Self {
        RxError::new(
            ErrorKind::VerbNotAllowed,
            format!("request {} not allowed", verb),
        )
    }

    /// The verb is supported but the resource provides no implementation.
    pub fn not_implemented(verb: &http::Method) -> Self {
        RxError::new(ErrorKind::VerbNotAllowed, format!("{} not implemented", verb))
            .with_status(http::StatusCode::NOT_IMPLEMENTED)
    }

    /// A user handler failed.  Defaults to status 500; the handler can
    /// override it with [`RxError::with_status`].
    pub fn handler<M: Into<String>>(message: M) -> Self {
        RxError::new(ErrorKind::Handler, message)
    }

    /// The request body could not be parsed in its declared format.
    pub fn bad_body(detail: &str) -> Self {
        RxError::new(
            ErrorKind::Handler,
            format!("could not parse request body: {}", detail),
        )
        .with_status(http::StatusCode::BAD_REQUEST)
    }

    /// Replaces the status code carried by this error.
    #[must_use]
    pub fn with_status(mut self, status: http::StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Attaches extra context (usually the offending pathname).
    #[must_use]
    pub fn with_extra<E: Into<String>>(mut self, extra: E) -> Self {
        self.extra = Some(extra.into());
        self
    }

    /// The failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The HTTP status this error renders with.
    pub fn status(&self) -> http::StatusCode {
        self.status
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Extra context attached at construction, if any.
    pub fn extra(&self) -> &str {
        self.extra.as_deref().unwrap_or("")
    }

    /// The trace captured when this error was constructed.  Empty unless
    /// backtraces are enabled in the environment.
    pub fn trace(&self) -> &str {
        &self.trace
    }
}

impl From<anyhow::Error> for RxError {
    fn from(err: anyhow::Error) -> Self {
        RxError::handler(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for RxError {
    fn from(err: serde_json::Error) -> Self {
        RxError::handler(format!("serialization failed: {}", err))
    }
}

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
/// Errors generated while binding and running the HTTP listener, as opposed
/// to errors produced while serving an individual request.
pub enum ServeError {
    #[error("could not parse the given string ({:?}) as an address", .0)]
    /// Generated when attempting to parse an address (during
    /// [`crate::Site::listen`]), but the address was invalid.
    InvalidAddress(String),
    #[error("could not serve server")]
    /// Generated when attempting to bind and listen using hyper, but it
    /// failed for some underlying reason.
    HyperServer(#[source] hyper::Error),
}
