// Routing for the control API

use crate::{ApiError, HttpRequest, HttpResponse};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<HttpResponse, ApiError>> + Send>>;

/// A route handler function type
pub type HandlerFn = Arc<dyn Fn(HttpRequest) -> HandlerFuture + Send + Sync>;

/// Route definition with handler
#[derive(Clone)]
pub struct Route {
    pub method: &'static str,
    pub path: String,
    pub handler: HandlerFn,
}

/// Ordered route table. The first matching route wins.
#[derive(Clone, Default)]
pub struct Router {
    pub routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn add_route(&mut self, route: Route) {
        self.routes.push(route);
    }

    pub fn get<F, Fut>(mut self, path: &str, handler: F) -> Self
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, ApiError>> + Send + 'static,
    {
        self.add_route(route("GET", path, handler));
        self
    }

    pub fn post<F, Fut>(mut self, path: &str, handler: F) -> Self
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, ApiError>> + Send + 'static,
    {
        self.add_route(route("POST", path, handler));
        self
    }

    /// Dispatch a request. Errors are rendered into their JSON response, so
    /// this never fails.
    pub async fn route(&self, mut request: HttpRequest) -> HttpResponse {
        let (path, query_string) = match request.path.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (request.path.clone(), None),
        };

        if let Some(query) = query_string {
            request.query_params = parse_query_string(&query);
        }

        let mut path_matched = false;
        for route in &self.routes {
            let Some(params) = match_path(&route.path, &path) else {
                continue;
            };
            if route.method != request.method {
                path_matched = true;
                continue;
            }

            request.path_params = params;
            return match (route.handler)(request).await {
                Ok(response) => response,
                Err(err) => err.into_response(),
            };
        }

        if path_matched {
            return method_not_allowed(&request.method, &path);
        }

        ApiError::RouteNotFound(format!("{} {}", request.method, path)).into_response()
    }
}

fn route<F, Fut>(method: &'static str, path: &str, handler: F) -> Route
where
    F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HttpResponse, ApiError>> + Send + 'static,
{
    Route {
        method,
        path: path.to_string(),
        handler: Arc::new(move |req| Box::pin(handler(req))),
    }
}

fn method_not_allowed(method: &str, path: &str) -> HttpResponse {
    let body = serde_json::json!({
        "error": {
            "code": "METHOD_NOT_ALLOWED",
            "message": format!("{} not allowed on {}", method, path),
        }
    });
    HttpResponse::new(405)
        .with_json(&body)
        .unwrap_or_else(|_| HttpResponse::new(405))
}

/// Match a route path pattern against a request path
/// Returns Some(params) if matched, None otherwise
fn match_path(pattern: &str, path: &str) -> Option<HashMap<String, String>> {
    let pattern_parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    if pattern_parts.len() != path_parts.len() {
        return None;
    }

    let mut params = HashMap::new();

    for (pattern_part, path_part) in pattern_parts.iter().zip(path_parts.iter()) {
        if let Some(param_name) = pattern_part.strip_prefix(':') {
            params.insert(param_name.to_string(), path_part.to_string());
        } else if pattern_part != path_part {
            return None;
        }
    }

    Some(params)
}

/// Parse a query string into a map of parameters
fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .filter_map(|part| {
            let mut split = part.splitn(2, '=');
            let key = split.next()?;
            let value = split.next().unwrap_or("");
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
