use std::collections::HashMap;

/// The parsed representation of an inbound request: its path broken into
/// steppable segments, the query mapping, the HTTP verb, and the negotiated
/// body/accept formats.
///
/// `path[0]` is always the synthetic root segment `"site"`; resolution
/// consumes segments from the front with [`Route::step_through`], which
/// produces a new value rather than mutating in place, so concurrent
/// resolution attempts never corrupt shared route state.
#[derive(Debug, Clone)]
pub struct Route {
    /// Path segments, starting with the synthetic `"site"` root.
    pub path: Vec<String>,
    /// The original request pathname, untouched.
    pub pathname: String,
    /// Parsed query-string pairs.  Malformed queries parse to empty.
    pub query: HashMap<String, String>,
    /// The request method.
    pub verb: http::Method,
    /// Content type of the request body, defaulting to `application/json`.
    pub in_format: mime::Mime,
    /// The raw `Accept` list; split and matched during reply assembly.
    pub out_format: String,
    /// The request headers.
    pub headers: http::HeaderMap,
    /// Cookies received with the request.  Unparseable cookies are dropped.
    pub cookies: Vec<cookie::Cookie<'static>>,
    /// Whether the pathname looks like a literal file path (it carries a
    /// recognizable extension); such routes are handed to the static asset
    /// collaborator instead of the resource tree.
    pub is_static: bool,
}

impl Route {
    /// Builds a route for a programmatic lookup of `pathname`: GET, any
    /// accepted format, no headers or cookies.
    pub fn new<P: AsRef<str>>(pathname: P) -> Self {
        let pathname = pathname.as_ref().to_owned();
        Route {
            path: split_path(&pathname),
            is_static: looks_static(&pathname),
            pathname,
            query: HashMap::new(),
            verb: http::Method::GET,
            in_format: mime::APPLICATION_JSON,
            out_format: "*/*".to_owned(),
            headers: http::HeaderMap::new(),
            cookies: vec![],
        }
    }

    /// Parses an incoming request head into a route.  Query-string and
    /// cookie parsing are best-effort: malformed input is dropped silently,
    /// never fatal.
    pub fn from_parts(
        verb: http::Method,
        uri: &http::Uri,
        headers: &http::HeaderMap,
    ) -> Self {
        let pathname = uri.path().to_owned();
        let query = uri
            .query()
            .and_then(|q| serde_qs::from_str::<HashMap<String, String>>(q).ok())
            .unwrap_or_default();
        let in_format = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<mime::Mime>().ok())
            .unwrap_or(mime::APPLICATION_JSON);
        let out_format = headers
            .get(http::header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("*/*")
            .to_owned();
        let cookies = headers
            .get_all(http::header::COOKIE)
            .into_iter()
            .filter_map(|h| h.to_str().ok())
            .flat_map(|h| h.split(';'))
            .filter_map(|h| cookie::Cookie::parse_encoded(h.trim()).ok())
            .map(cookie::Cookie::into_owned)
            .collect();

        Route {
            path: split_path(&pathname),
            is_static: looks_static(&pathname),
            pathname,
            query,
            verb,
            in_format,
            out_format,
            headers: headers.clone(),
            cookies,
        }
    }

    /// Returns a copy of this route with the first `n` segments consumed.
    ///
    /// Resolution always checks [`Route::remaining`] before stepping; calling
    /// this past the segment count is a caller bug and panics.
    pub fn step_through(&self, n: usize) -> Route {
        assert!(n <= self.path.len(), "stepped past the end of the route");
        let mut next = self.clone();
        next.path = self.path[n..].to_vec();
        next
    }

    /// The leading unconsumed segment, if any.
    pub fn next_step(&self) -> Option<&str> {
        self.path.first().map(String::as_str)
    }

    /// How many segments remain to be consumed.
    pub fn remaining(&self) -> usize {
        self.path.len()
    }
}

fn split_path(pathname: &str) -> Vec<String> {
    std::iter::once("site".to_owned())
        .chain(
            pathname
                .split('/')
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned),
        )
        .collect()
}

// A pathname addresses a file rather than a resource when its last segment
// carries an extension we can map to a mime type.
fn looks_static(pathname: &str) -> bool {
    mime_guess::from_path(pathname).first().is_some()
}
