//! Resin is a resource-oriented async HTTP framework built on Tokio and
//! hyper.  Instead of routing URLs to free-standing handler functions, a
//! resin application is a tree of named resources: each pathname segment
//! addresses a resource (with numeric indexes selecting among same-named
//! siblings), and each resource answers the HTTP verbs itself.  Content
//! negotiation, URL-parameter binding, request filters and a path cache come
//! built in.
//!
//! # Getting Started
//! To get started, just add resin and tokio to your `Cargo.toml`:
//!
//! ```toml
//! resin = "0.2.0"
//! tokio = { version = "1.12.0", features = ["full"] } # or whatever the latest version is
//! ```
//!
//! # Examples
//! ```rust,no_run
//! use resin::{Context, Resource, ResourceResponse};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), resin::ServeError> {
//!     let site = resin::site("hello");
//!     site.add(Resource::new("greeting").on_get(|_: Context| async {
//!         Ok(ResourceResponse::ok(serde_json::json!({ "hello": "world" })))
//!     }));
//!     site.listen("0.0.0.0:8080").await
//! }
//! ```
#![deny(clippy::correctness)]
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

#[macro_use]
extern crate async_trait;

mod container;
mod embodiment;
mod error;
mod filter;
mod resource;
mod route;
mod site;
mod view;

pub use self::embodiment::{Body, Embodiment};
pub use self::error::{ErrorKind, RxError, ServeError};
pub use self::filter::{Filter, FiltersData};
pub use self::resource::{Context, Handler, Resource, ResourceResponse};
pub use self::route::Route;
pub use self::site::Site;
pub use self::view::ViewEngine;

#[must_use]
/// Creates a new site with an empty resource tree.  This is a shortcut for
/// [`Site::new`].
pub fn site<N: Into<String>>(name: N) -> Site {
    Site::new(name)
}
