use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{
    pattern::{PathPattern, method_matches},
    record::BodyValue,
};

pub type RouteFuture = Pin<Box<dyn Future<Output = anyhow::Result<RouteReply>> + Send>>;

/// A user-declared handler. Outranks replay storage and the upstream: when a
/// custom route matches, its reply is served directly.
pub type RouteHandler = Arc<dyn Fn(RouteContext) -> RouteFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RouteContext {
    pub params: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: BodyValue,
}

/// A handler's reply. A missing status means 200.
#[derive(Debug, Clone, Default)]
pub struct RouteReply {
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub body: BodyValue,
}

impl RouteReply {
    pub fn json(body: serde_json::Value) -> Self {
        Self {
            status: None,
            headers: BTreeMap::new(),
            body: BodyValue::Json(body),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

struct CustomRoute {
    id: u64,
    method: String,
    raw_pattern: String,
    pattern: PathPattern,
    priority: i64,
    handler: RouteHandler,
}

impl std::fmt::Debug for CustomRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomRoute")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("pattern", &self.raw_pattern)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct RouteRegistry {
    routes: RwLock<Vec<CustomRoute>>,
    next_id: AtomicU64,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a route; returns `&Self` so registrations chain fluently.
    pub fn route(&self, method: &str, path_pattern: &str, handler: RouteHandler) -> &Self {
        self.route_with_priority(method, path_pattern, 0, handler)
    }

    pub fn route_with_priority(
        &self,
        method: &str,
        path_pattern: &str,
        priority: i64,
        handler: RouteHandler,
    ) -> &Self {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write_routes().push(CustomRoute {
            id,
            method: method.to_ascii_uppercase(),
            raw_pattern: path_pattern.to_owned(),
            pattern: PathPattern::parse(path_pattern),
            priority,
            handler,
        });
        self
    }

    pub fn get(&self, path_pattern: &str, handler: RouteHandler) -> &Self {
        self.route("GET", path_pattern, handler)
    }

    pub fn post(&self, path_pattern: &str, handler: RouteHandler) -> &Self {
        self.route("POST", path_pattern, handler)
    }

    pub fn put(&self, path_pattern: &str, handler: RouteHandler) -> &Self {
        self.route("PUT", path_pattern, handler)
    }

    pub fn delete(&self, path_pattern: &str, handler: RouteHandler) -> &Self {
        self.route("DELETE", path_pattern, handler)
    }

    pub fn len(&self) -> usize {
        self.read_routes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_routes().is_empty()
    }

    /// The matching route with the highest priority, stable on ties.
    pub fn find(&self, method: &str, path: &str) -> Option<(RouteHandler, BTreeMap<String, String>)> {
        let routes = self.read_routes();
        let mut best: Option<(&CustomRoute, BTreeMap<String, String>)> = None;
        for route in routes.iter() {
            if !method_matches(&route.method, method) {
                continue;
            }
            let Some(params) = route.pattern.matches(path) else {
                continue;
            };
            match best.as_ref() {
                Some((current, _)) if current.priority >= route.priority => {}
                _ => best = Some((route, params)),
            }
        }
        best.map(|(route, params)| (Arc::clone(&route.handler), params))
    }

    fn read_routes(&self) -> std::sync::RwLockReadGuard<'_, Vec<CustomRoute>> {
        self.routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_routes(&self) -> std::sync::RwLockWriteGuard<'_, Vec<CustomRoute>> {
        self.routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Wraps a plain closure as a route handler.
pub fn handler(
    reply: impl Fn(RouteContext) -> RouteReply + Send + Sync + 'static,
) -> RouteHandler {
    let reply = Arc::new(reply);
    Arc::new(move |ctx| {
        let reply = Arc::clone(&reply);
        Box::pin(async move { Ok(reply(ctx)) })
    })
}
