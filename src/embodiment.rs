use std::sync::Arc;

use serde_json::Value;

use crate::error::RxError;
use crate::resource::ResourceResponse;
use crate::view::ViewEngine;

/// The body carried by an embodiment: either fully buffered, or a stream the
/// transport writes out chunk by chunk.  The core treats both uniformly.
#[derive(Debug)]
pub enum Body {
    /// No body at all.
    Empty,
    /// A fully buffered payload.
    Buffered(bytes::Bytes),
    /// A streamed payload, written by the transport.
    Streamed(hyper::Body),
}

/// The fully negotiated, transport-ready response: status, content type,
/// optional redirect location, `Set-Cookie` values, additional headers, and
/// the body.
pub struct Embodiment {
    /// The HTTP status code.
    pub status: http::StatusCode,
    /// The negotiated content type.
    pub mime_type: String,
    /// Value for the `Location` header, when redirecting.
    pub location: Option<String>,
    /// Serialized `Set-Cookie` values, one header each.
    pub cookies: Vec<String>,
    /// Additional outgoing headers.
    pub headers: http::HeaderMap,
    /// The response body.
    pub body: Body,
}

impl Embodiment {
    /// An embodiment with no body.
    pub fn empty<M: Into<String>>(mime_type: M, status: http::StatusCode) -> Self {
        Embodiment {
            status,
            mime_type: mime_type.into(),
            location: None,
            cookies: vec![],
            headers: http::HeaderMap::new(),
            body: Body::Empty,
        }
    }

    /// An embodiment with a buffered payload.
    pub fn buffered<M, B>(mime_type: M, status: http::StatusCode, body: B) -> Self
    where
        M: Into<String>,
        B: Into<bytes::Bytes>,
    {
        let mut embodiment = Embodiment::empty(mime_type, status);
        embodiment.body = Body::Buffered(body.into());
        embodiment
    }

    /// An embodiment whose payload is streamed by the transport.
    pub fn streamed<M: Into<String>>(
        mime_type: M,
        status: http::StatusCode,
        body: hyper::Body,
    ) -> Self {
        let mut embodiment = Embodiment::empty(mime_type, status);
        embodiment.body = Body::Streamed(body);
        embodiment
    }

    /// Sets an outgoing header, replacing any previous value.
    ///
    /// # Errors
    /// Fails if the given value cannot be converted into a header value.
    pub fn set_header<H, V>(&mut self, key: H, value: V) -> Result<(), http::Error>
    where
        H: http::header::IntoHeaderName,
        V: TryInto<http::HeaderValue>,
        http::Error: From<<V as TryInto<http::HeaderValue>>::Error>,
    {
        self.headers.insert(key, value.try_into()?);
        Ok(())
    }

    /// The buffered body, if this embodiment carries one.
    pub fn body_bytes(&self) -> Option<&bytes::Bytes> {
        match &self.body {
            Body::Buffered(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Drops the body while keeping the head intact (HEAD replies).
    pub(crate) fn strip_body(&mut self) {
        self.body = Body::Empty;
    }
}

impl std::fmt::Debug for Embodiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embodiment")
            .field("status", &self.status)
            .field("mime_type", &self.mime_type)
            .field("location", &self.location)
            .field(
                "body",
                &match &self.body {
                    Body::Empty => "empty",
                    Body::Buffered(_) => "buffered",
                    Body::Streamed(_) => "streamed",
                },
            )
            .finish()
    }
}

impl From<Embodiment> for http::Response<hyper::Body> {
    fn from(this: Embodiment) -> Self {
        let mut builder = http::Response::builder()
            .status(this.status)
            .header(http::header::CONTENT_TYPE, this.mime_type);
        if let Some(location) = &this.location {
            builder = builder.header(http::header::LOCATION, location);
        }
        if let Body::Buffered(bytes) = &this.body {
            builder = builder.header(http::header::CONTENT_LENGTH, bytes.len());
        }
        for (key, value) in &this.headers {
            builder = builder.header(key, value);
        }
        for cookie in &this.cookies {
            builder = builder.header(http::header::SET_COOKIE, cookie);
        }
        let body = match this.body {
            Body::Empty => hyper::Body::empty(),
            Body::Buffered(bytes) => hyper::Body::from(bytes),
            Body::Streamed(stream) => stream,
        };
        // The header values above came from validated sources or strings the
        // application itself configured; a bad one falls back to a bare 500.
        builder.body(body).unwrap_or_else(|_| {
            http::Response::builder()
                .status(http::StatusCode::INTERNAL_SERVER_ERROR)
                .body(hyper::Body::empty())
                .unwrap()
        })
    }
}

/// The slice of a resource that reply assembly needs: its declared view and
/// the outgoing header/cookie buffers accumulated on the node.
pub(crate) struct ReplyTarget {
    pub view: Option<String>,
    pub layout: Option<String>,
    pub headers: http::HeaderMap,
    pub cookies: Vec<String>,
}

impl ReplyTarget {
    pub fn bare() -> Self {
        ReplyTarget {
            view: None,
            layout: None,
            headers: http::HeaderMap::new(),
            cookies: vec![],
        }
    }
}

enum Render {
    Json,
    Xml,
}

/// Converts a settled [`ResourceResponse`] into a transport-ready embodiment
/// under content negotiation.
///
/// Rule order: redirect statuses force JSON; a declared view plus an HTML
/// accept renders through the view engine; otherwise the first concrete
/// match among json, xml (in its variants), `*/*` decides the serializer;
/// a forced custom format delivers the payload verbatim; anything else is
/// an unsupported media type.  Cookies and headers accumulated on the
/// resource and the response are attached regardless of branch.
pub(crate) async fn deliver_reply(
    target: &ReplyTarget,
    response: ResourceResponse,
    out_format: &str,
    deliver_any_format: bool,
    engine: Option<&Arc<dyn ViewEngine>>,
) -> Result<Embodiment, RxError> {
    let forced_json = matches!(
        response.status,
        http::StatusCode::SEE_OTHER | http::StatusCode::TEMPORARY_REDIRECT
    );
    let out_format = if forced_json { "application/json" } else { out_format };

    let accepted: Vec<&str> = out_format
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|s| !s.is_empty())
        .collect();
    // an empty accept list takes anything
    let accepted = if accepted.is_empty() {
        vec!["*/*"]
    } else {
        accepted
    };
    log::trace!("formats: {:?}", accepted);
    let accepts = |token: &str| accepted.iter().any(|t| *t == token);

    if let (Some(view), Some(engine)) = (&target.view, engine) {
        if accepts("text/html") || accepts("*/*") {
            let mut reply = engine
                .render(view, target.layout.as_deref(), &response.data)
                .await?;
            reply.status = response.status;
            reply.location = response.location.clone();
            finish(&mut reply, target, &response);
            return Ok(reply);
        }
    }

    let negotiated = if accepts("application/json") {
        Some(("application/json", Render::Json))
    } else if accepts("application/xml") {
        Some(("application/xml", Render::Xml))
    } else if accepts("text/xml") {
        Some(("text/xml", Render::Xml))
    } else if accepts("application/xhtml+xml") {
        Some(("application/xml", Render::Xml))
    } else if accepts("application/x-www-form-urlencoded") {
        Some(("text/xml", Render::Xml))
    } else if accepts("*/*") {
        Some(("application/json", Render::Json))
    } else {
        None
    };

    let mut reply = match negotiated {
        Some((mime_type, renderer)) => {
            let bytes = match renderer {
                Render::Json => serde_json::to_vec(&response.data)?,
                Render::Xml => to_xml(&response.data).into_bytes(),
            };
            Embodiment::buffered(mime_type, response.status, bytes)
        }
        None if deliver_any_format => {
            // Escape hatch for resources that forced a non-standard content
            // type: the payload goes out verbatim under that format.
            log::trace!("delivering verbatim as {}", out_format);
            let bytes = match &response.data {
                Value::String(raw) => raw.clone().into_bytes(),
                other => serde_json::to_vec(other)?,
            };
            Embodiment::buffered(out_format, response.status, bytes)
        }
        None => return Err(RxError::media_type(out_format)),
    };
    reply.location = response.location.clone();
    finish(&mut reply, target, &response);
    Ok(reply)
}

fn finish(reply: &mut Embodiment, target: &ReplyTarget, response: &ResourceResponse) {
    reply.cookies.extend(target.cookies.iter().cloned());
    reply.cookies.extend(response.cookies.iter().cloned());
    for (key, value) in &target.headers {
        reply.headers.insert(key, value.clone());
    }
    for (key, value) in &response.headers {
        reply.headers.insert(key, value.clone());
    }
}

/// Renders a typed error as a body in the caller's negotiated format
/// (HTML, XML or JSON), carrying the message, kind, and trace.
pub(crate) fn error_body(error: &RxError, out_format: &str) -> Embodiment {
    let mime_type = out_format
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .find(|s| !s.is_empty())
        .unwrap_or("application/json");

    let body = error_object(error);
    match mime_type {
        "text/html" => Embodiment::buffered("text/html", error.status(), error_page(error)),
        "application/xml" | "text/xml" => {
            Embodiment::buffered(mime_type, error.status(), to_xml(&body))
        }
        _ => Embodiment::buffered(
            "application/json",
            error.status(),
            serde_json::to_vec(&body).unwrap_or_default(),
        ),
    }
}

#[derive(serde::Serialize)]
struct ErrorEnvelope<'a> {
    result: &'static str,
    error: ErrorDetail<'a>,
}

#[derive(serde::Serialize)]
struct ErrorDetail<'a> {
    message: &'a str,
    name: &'static str,
    extra: &'a str,
    trace: Vec<&'a str>,
}

/// The structured error payload shared by the XML and JSON error bodies.
pub(crate) fn error_object(error: &RxError) -> Value {
    let envelope = ErrorEnvelope {
        result: "error",
        error: ErrorDetail {
            message: error.message(),
            name: error.kind().as_str(),
            extra: error.extra(),
            trace: error.trace().lines().collect(),
        },
    };
    serde_json::to_value(envelope).unwrap_or(Value::Null)
}

/// The built-in HTML error page, used when no custom error view applies.
pub(crate) fn error_page(error: &RxError) -> String {
    format!(
        concat!(
            "<html><body style=\"font-family:arial;\">",
            "<h1>resin: the resource request caused an error.</h1>",
            "<h2>{}</h2><h3 style=\"color:red;\">{}</h3>",
            "<hr/><pre>{}</pre>",
            "</body></html>"
        ),
        escape_html(error.kind().as_str()),
        escape_html(error.message()),
        escape_html(error.trace()),
    )
}

/// Serializes a JSON value as XML under a `<resin>` root: object keys become
/// elements, arrays repeat their element, scalars become text content.
pub(crate) fn to_xml(value: &Value) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    write_element("resin", value, &mut out);
    out
}

fn write_element(name: &str, value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            for item in items {
                write_element(name, item, out);
            }
        }
        Value::Object(map) => {
            out.push('<');
            out.push_str(name);
            out.push('>');
            for (key, item) in map {
                write_element(key, item, out);
            }
            out.push_str("</");
            out.push_str(name);
            out.push('>');
        }
        Value::Null => {
            out.push('<');
            out.push_str(name);
            out.push_str("/>");
        }
        Value::String(text) => {
            out.push('<');
            out.push_str(name);
            out.push('>');
            out.push_str(&escape_html(text));
            out.push_str("</");
            out.push_str(name);
            out.push('>');
        }
        other => {
            out.push('<');
            out.push_str(name);
            out.push('>');
            out.push_str(&other.to_string());
            out.push_str("</");
            out.push_str(name);
            out.push('>');
        }
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}
