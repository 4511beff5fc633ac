use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde_json::Value;

use crate::{
    chaos::status_text,
    pattern::{PathPattern, method_matches},
    record::{BodyValue, RequestRecord, ResponseRecord},
};

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<ResponseRecord>> + Send>>;

/// An async response transform. Receives the current response and the
/// request context, returns the replacement response.
pub type InterceptHandler =
    Arc<dyn Fn(ResponseRecord, InterceptContext) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct InterceptContext {
    pub request: RequestRecord,
    pub params: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
}

pub struct InterceptRule {
    pub id: u64,
    pub method: String,
    pub raw_pattern: String,
    pub pattern: PathPattern,
    pub priority: i64,
    pub enabled: bool,
    handler: InterceptHandler,
}

impl std::fmt::Debug for InterceptRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptRule")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("pattern", &self.raw_pattern)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct InterceptRegistry {
    rules: RwLock<Vec<InterceptRule>>,
    next_id: AtomicU64,
}

impl InterceptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, method: &str, path_pattern: &str, handler: InterceptHandler) -> u64 {
        self.add_with_priority(method, path_pattern, 0, handler)
    }

    pub fn add_with_priority(
        &self,
        method: &str,
        path_pattern: &str,
        priority: i64,
        handler: InterceptHandler,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write_rules().push(InterceptRule {
            id,
            method: method.to_ascii_uppercase(),
            raw_pattern: path_pattern.to_owned(),
            pattern: PathPattern::parse(path_pattern),
            priority,
            enabled: true,
            handler,
        });
        id
    }

    pub fn remove(&self, id: u64) -> bool {
        let mut rules = self.write_rules();
        let before = rules.len();
        rules.retain(|rule| rule.id != id);
        rules.len() != before
    }

    pub fn set_enabled(&self, id: u64, enabled: bool) -> bool {
        let mut rules = self.write_rules();
        match rules.iter_mut().find(|rule| rule.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.read_rules().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_rules().is_empty()
    }

    /// The enabled rule matching (method, path) with the highest priority;
    /// equal priorities keep insertion order. Returns the handler and the
    /// path parameters the pattern captured.
    pub fn find(
        &self,
        method: &str,
        path: &str,
    ) -> Option<(InterceptHandler, BTreeMap<String, String>)> {
        let rules = self.read_rules();
        let mut best: Option<(&InterceptRule, BTreeMap<String, String>)> = None;
        for rule in rules.iter() {
            if !rule.enabled || !method_matches(&rule.method, method) {
                continue;
            }
            let Some(params) = rule.pattern.matches(path) else {
                continue;
            };
            match best.as_ref() {
                Some((current, _)) if current.priority >= rule.priority => {}
                _ => best = Some((rule, params)),
            }
        }
        best.map(|(rule, params)| (Arc::clone(&rule.handler), params))
    }

    fn read_rules(&self) -> std::sync::RwLockReadGuard<'_, Vec<InterceptRule>> {
        self.rules
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_rules(&self) -> std::sync::RwLockWriteGuard<'_, Vec<InterceptRule>> {
        self.rules
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Stalls the response by `ms` milliseconds, otherwise passing it through.
pub fn delay(ms: u64) -> InterceptHandler {
    Arc::new(move |response, _ctx| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(response)
        })
    })
}

pub fn replace_body(value: Value) -> InterceptHandler {
    Arc::new(move |mut response, _ctx| {
        let value = value.clone();
        Box::pin(async move {
            response.body = BodyValue::Json(value);
            Ok(response)
        })
    })
}

pub fn modify_body(
    transform: impl Fn(BodyValue) -> BodyValue + Send + Sync + 'static,
) -> InterceptHandler {
    let transform = Arc::new(transform);
    Arc::new(move |mut response, _ctx| {
        let transform = Arc::clone(&transform);
        Box::pin(async move {
            response.body = transform(std::mem::take(&mut response.body));
            Ok(response)
        })
    })
}

pub fn set_status(status: u16) -> InterceptHandler {
    Arc::new(move |mut response, _ctx| {
        Box::pin(async move {
            response.status = status;
            Ok(response)
        })
    })
}

pub fn merge_headers(headers: BTreeMap<String, String>) -> InterceptHandler {
    Arc::new(move |mut response, _ctx| {
        let headers = headers.clone();
        Box::pin(async move {
            for (name, value) in headers {
                response.headers.insert(name.to_ascii_lowercase(), value);
            }
            Ok(response)
        })
    })
}

/// Discards the current response entirely in favor of a synthetic error.
pub fn synthetic_error(status: u16, message: &str) -> InterceptHandler {
    let message = message.to_owned();
    Arc::new(move |_response, _ctx| {
        let message = message.clone();
        Box::pin(async move {
            Ok(ResponseRecord::json(
                status,
                serde_json::json!({
                    "error": status_text(status),
                    "message": message,
                }),
            ))
        })
    })
}

/// Invokes handlers left to right, threading the response through each.
pub fn chain(handlers: Vec<InterceptHandler>) -> InterceptHandler {
    Arc::new(move |response, ctx| {
        let handlers = handlers.clone();
        Box::pin(async move {
            let mut current = response;
            for handler in &handlers {
                current = handler(current, ctx.clone()).await?;
            }
            Ok(current)
        })
    })
}
