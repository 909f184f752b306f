use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;

use crate::error::RxError;
use crate::route::Route;

/// Data produced by the request filters, available to the eventual handler
/// keyed by filter name.
pub type FiltersData = HashMap<String, Value>;

#[async_trait]
/// An asynchronous gate run before dispatch.
///
/// Filters are run concurrently against the same route and body; all must
/// succeed before the request reaches any resource, and the first failure
/// rejects the whole batch.  Filters have no defined relative ordering and
/// must not depend on each other.  A filter may contribute data to the
/// handler by returning a non-null value.
///
/// This is automatically implemented for
/// `Fn(Route, Value) -> impl Future<Output = Result<Value, RxError>>` types.
pub trait Filter: Send + Sync + 'static {
    #[must_use]
    /// Inspects the request, contributing data or rejecting it.
    async fn check(&self, route: Route, body: Value) -> Result<Value, RxError>;

    #[doc(hidden)]
    fn describe(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", std::any::type_name::<Self>())
    }
}

impl std::fmt::Debug for dyn Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.describe(f)
    }
}

#[async_trait]
impl<F, Fut> Filter for F
where
    F: Fn(Route, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RxError>> + Send + 'static,
{
    async fn check(&self, route: Route, body: Value) -> Result<Value, RxError> {
        self(route, body).await
    }
}

/// Runs every filter concurrently against the same (route, body).  Succeeds
/// with the merged filter data once all of them pass; fails fast on the
/// first rejection without waiting for the remaining filters, and no partial
/// filter data survives a failure.
pub(crate) async fn run_filters(
    filters: Vec<(String, Arc<dyn Filter>)>,
    route: &Route,
    body: &Value,
) -> Result<FiltersData, RxError> {
    let mut pending: FuturesUnordered<_> = filters
        .into_iter()
        .map(|(name, filter)| {
            let route = route.clone();
            let body = body.clone();
            async move { (name, filter.check(route, body).await) }
        })
        .collect();

    let mut data = FiltersData::new();
    while let Some((name, result)) = pending.next().await {
        match result {
            Ok(value) => {
                if !value.is_null() {
                    data.insert(name, value);
                }
            }
            Err(err) => {
                log::warn!("filters not passed: {}", err);
                return Err(err);
            }
        }
    }
    log::trace!("all filters passed");
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass_with(value: Value) -> Arc<dyn Filter> {
        Arc::new(move |_route: Route, _body: Value| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    fn reject(message: &'static str) -> Arc<dyn Filter> {
        Arc::new(move |_route: Route, _body: Value| async move {
            Err(RxError::handler(message).with_status(http::StatusCode::UNAUTHORIZED))
        })
    }

    #[tokio::test]
    async fn all_passing_filters_merge_their_data() {
        let filters = vec![
            ("auth".to_owned(), pass_with(serde_json::json!({ "user": "amy" }))),
            ("quiet".to_owned(), pass_with(Value::Null)),
        ];
        let route = Route::new("/users");
        let data = run_filters(filters, &route, &Value::Null).await.unwrap();
        assert_eq!(data.get("auth"), Some(&serde_json::json!({ "user": "amy" })));
        // null contributions are omitted
        assert!(!data.contains_key("quiet"));
    }

    #[tokio::test]
    async fn one_rejection_fails_the_batch() {
        let filters = vec![
            ("ok".to_owned(), pass_with(serde_json::json!(1))),
            ("deny".to_owned(), reject("no token")),
        ];
        let route = Route::new("/users");
        let err = run_filters(filters, &route, &Value::Null).await.unwrap_err();
        assert_eq!(err.status(), http::StatusCode::UNAUTHORIZED);
        assert!(err.message().contains("no token"));
    }

    #[tokio::test]
    async fn no_filters_is_an_empty_map() {
        let route = Route::new("/");
        let data = run_filters(vec![], &route, &Value::Null).await.unwrap();
        assert!(data.is_empty());
    }
}
