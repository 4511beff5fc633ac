use std::sync::{
    RwLock,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;

use rand::Rng as _;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    pattern::{PathPattern, method_matches},
    record::ResponseRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyConfig {
    pub min: u64,
    pub max: u64,
}

impl LatencyConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min > self.max {
            anyhow::bail!(
                "invalid latency range: min {} exceeds max {}",
                self.min,
                self.max
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInjectionConfig {
    pub rate: f64,
    pub status: u16,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
}

impl ErrorInjectionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=100.0).contains(&self.rate) {
            anyhow::bail!("invalid error rate {}: expected 0..=100", self.rate);
        }
        if !(400..=599).contains(&self.status) {
            anyhow::bail!("invalid error status {}: expected 400..=599", self.status);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ChaosRule {
    pub id: u64,
    pub method: String,
    pub raw_pattern: String,
    pub pattern: PathPattern,
    pub enabled: bool,
    pub latency: Option<LatencyConfig>,
    pub error: Option<ErrorInjectionConfig>,
}

#[derive(Debug, Default)]
struct ChaosRuleSet {
    default_latency: Option<LatencyConfig>,
    default_error: Option<ErrorInjectionConfig>,
    rules: Vec<ChaosRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosStats {
    pub requests_processed: u64,
    pub errors_injected: u64,
    pub total_latency_added_ms: u64,
    pub average_latency_ms: f64,
}

/// Outcome of one chaos draw: how long to stall, and the synthetic error to
/// emit instead of continuing, if one was injected.
#[derive(Debug, Clone, PartialEq)]
pub struct ChaosDecision {
    pub delay_ms: u64,
    pub error: Option<ResponseRecord>,
}

#[derive(Debug, Default)]
pub struct ChaosEngine {
    enabled: AtomicBool,
    rule_set: RwLock<ChaosRuleSet>,
    next_rule_id: AtomicU64,
    requests_processed: AtomicU64,
    errors_injected: AtomicU64,
    total_latency_added_ms: AtomicU64,
}

impl ChaosEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_default_latency(&self, latency: Option<LatencyConfig>) -> anyhow::Result<()> {
        if let Some(latency) = latency.as_ref() {
            latency.validate()?;
        }
        self.write_rules().default_latency = latency;
        Ok(())
    }

    pub fn set_default_error(&self, error: Option<ErrorInjectionConfig>) -> anyhow::Result<()> {
        if let Some(error) = error.as_ref() {
            error.validate()?;
        }
        self.write_rules().default_error = error;
        Ok(())
    }

    /// Appends a rule; rules are consulted in insertion order and the first
    /// enabled match wins over the defaults.
    pub fn add_rule(
        &self,
        method: &str,
        path_pattern: &str,
        latency: Option<LatencyConfig>,
        error: Option<ErrorInjectionConfig>,
    ) -> anyhow::Result<u64> {
        if let Some(latency) = latency.as_ref() {
            latency.validate()?;
        }
        if let Some(error) = error.as_ref() {
            error.validate()?;
        }

        let id = self.next_rule_id.fetch_add(1, Ordering::Relaxed);
        self.write_rules().rules.push(ChaosRule {
            id,
            method: method.to_ascii_uppercase(),
            raw_pattern: path_pattern.to_owned(),
            pattern: PathPattern::parse(path_pattern),
            enabled: true,
            latency,
            error,
        });
        Ok(id)
    }

    pub fn remove_rule(&self, id: u64) -> bool {
        let mut rule_set = self.write_rules();
        let before = rule_set.rules.len();
        rule_set.rules.retain(|rule| rule.id != id);
        rule_set.rules.len() != before
    }

    pub fn set_rule_enabled(&self, id: u64, enabled: bool) -> bool {
        let mut rule_set = self.write_rules();
        match rule_set.rules.iter_mut().find(|rule| rule.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Draws latency and the error decision for one request, updating stats.
    /// Returns `None` when the engine is disabled: a no-op apply.
    pub fn decide(&self, method: &str, path: &str) -> Option<ChaosDecision> {
        if !self.is_enabled() {
            return None;
        }

        let (latency, error) = {
            let rule_set = self.read_rules();
            match rule_set
                .rules
                .iter()
                .find(|rule| {
                    rule.enabled
                        && method_matches(&rule.method, method)
                        && rule.pattern.is_match(path)
                })
            {
                Some(rule) => (rule.latency, rule.error.clone()),
                None => (rule_set.default_latency, rule_set.default_error.clone()),
            }
        };

        let delay_ms = latency.map(|latency| draw_latency(&latency)).unwrap_or(0);
        let injected = error.filter(|error| draw_error(error.rate));

        self.requests_processed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_added_ms
            .fetch_add(delay_ms, Ordering::Relaxed);
        if injected.is_some() {
            self.errors_injected.fetch_add(1, Ordering::Relaxed);
        }

        Some(ChaosDecision {
            delay_ms,
            error: injected.map(|error| synthetic_error_response(&error)),
        })
    }

    /// Sleeps out the drawn latency, then hands back the injected error (if
    /// any) for the caller to emit.
    pub async fn apply(&self, method: &str, path: &str) -> Option<ResponseRecord> {
        let decision = self.decide(method, path)?;
        if decision.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(decision.delay_ms)).await;
        }
        decision.error
    }

    pub fn stats(&self) -> ChaosStats {
        let requests_processed = self.requests_processed.load(Ordering::Relaxed);
        let total_latency_added_ms = self.total_latency_added_ms.load(Ordering::Relaxed);
        let average_latency_ms = if requests_processed == 0 {
            0.0
        } else {
            total_latency_added_ms as f64 / requests_processed as f64
        };
        ChaosStats {
            requests_processed,
            errors_injected: self.errors_injected.load(Ordering::Relaxed),
            total_latency_added_ms,
            average_latency_ms,
        }
    }

    fn read_rules(&self) -> std::sync::RwLockReadGuard<'_, ChaosRuleSet> {
        self.rule_set
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_rules(&self) -> std::sync::RwLockWriteGuard<'_, ChaosRuleSet> {
        self.rule_set
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn draw_latency(latency: &LatencyConfig) -> u64 {
    if latency.min == latency.max {
        return latency.min;
    }
    rand::thread_rng().gen_range(latency.min..=latency.max)
}

fn draw_error(rate: f64) -> bool {
    if rate <= 0.0 {
        return false;
    }
    if rate >= 100.0 {
        return true;
    }
    rand::thread_rng().gen_range(0.0..100.0) < rate
}

fn synthetic_error_response(error: &ErrorInjectionConfig) -> ResponseRecord {
    let mut body = json!({
        "error": status_text(error.status),
        "message": error.message,
        "injected": true,
    });
    if let (Value::Object(map), Some(details)) = (&mut body, error.details.as_ref()) {
        map.insert("details".to_owned(), details.clone());
    }
    ResponseRecord::json(error.status, body)
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

#[cfg(test)]
mod tests {
    use super::{ChaosEngine, ErrorInjectionConfig, LatencyConfig, status_text};
    use crate::record::BodyValue;

    fn error_config(rate: f64, status: u16) -> ErrorInjectionConfig {
        ErrorInjectionConfig {
            rate,
            status,
            message: "injected failure".to_owned(),
            details: None,
        }
    }

    #[test]
    fn disabled_engine_is_a_noop_and_freezes_stats() {
        let engine = ChaosEngine::new();
        engine
            .set_default_latency(Some(LatencyConfig { min: 5, max: 5 }))
            .unwrap();
        assert!(engine.decide("GET", "/api").is_none());
        assert_eq!(engine.stats().requests_processed, 0);
    }

    #[test]
    fn latency_draws_stay_within_bounds() {
        let engine = ChaosEngine::new();
        engine.set_enabled(true);
        engine
            .set_default_latency(Some(LatencyConfig { min: 10, max: 20 }))
            .unwrap();

        for _ in 0..200 {
            let decision = engine.decide("GET", "/api").unwrap();
            assert!((10..=20).contains(&decision.delay_ms));
        }
    }

    #[test]
    fn fixed_latency_is_drawn_exactly() {
        let engine = ChaosEngine::new();
        engine.set_enabled(true);
        engine
            .set_default_latency(Some(LatencyConfig { min: 50, max: 50 }))
            .unwrap();
        let decision = engine.decide("GET", "/api").unwrap();
        assert_eq!(decision.delay_ms, 50);
        assert_eq!(engine.stats().total_latency_added_ms, 50);
        assert_eq!(engine.stats().average_latency_ms, 50.0);
    }

    #[test]
    fn error_rate_zero_never_injects_and_hundred_always_does() {
        let engine = ChaosEngine::new();
        engine.set_enabled(true);
        engine.set_default_error(Some(error_config(0.0, 500))).unwrap();
        for _ in 0..50 {
            assert!(engine.decide("GET", "/api").unwrap().error.is_none());
        }
        assert_eq!(engine.stats().errors_injected, 0);

        engine.set_default_error(Some(error_config(100.0, 503))).unwrap();
        for _ in 0..50 {
            let decision = engine.decide("GET", "/api").unwrap();
            assert_eq!(decision.error.unwrap().status, 503);
        }
        assert_eq!(engine.stats().errors_injected, 50);
    }

    #[test]
    fn error_rate_converges_on_the_configured_fraction() {
        let engine = ChaosEngine::new();
        engine.set_enabled(true);
        engine.set_default_error(Some(error_config(30.0, 500))).unwrap();

        let draws = 2_000;
        for _ in 0..draws {
            engine.decide("GET", "/api");
        }
        let injected = engine.stats().errors_injected as f64 / draws as f64;
        assert!(
            (0.15..=0.45).contains(&injected),
            "expected roughly 30% injection, got {injected}"
        );
    }

    #[test]
    fn synthetic_error_body_carries_reason_phrase_and_marker() {
        let engine = ChaosEngine::new();
        engine.set_enabled(true);
        engine
            .set_default_error(Some(ErrorInjectionConfig {
                rate: 100.0,
                status: 503,
                message: "down for chaos".to_owned(),
                details: Some(serde_json::json!({"scope": "test"})),
            }))
            .unwrap();

        let error = engine.decide("GET", "/api").unwrap().error.unwrap();
        let BodyValue::Json(body) = &error.body else {
            panic!("expected JSON error body");
        };
        assert_eq!(body["error"], "Service Unavailable");
        assert_eq!(body["message"], "down for chaos");
        assert_eq!(body["injected"], true);
        assert_eq!(body["details"]["scope"], "test");
    }

    #[test]
    fn first_enabled_matching_rule_wins_over_defaults() {
        let engine = ChaosEngine::new();
        engine.set_enabled(true);
        engine
            .set_default_latency(Some(LatencyConfig { min: 1, max: 1 }))
            .unwrap();
        let first = engine
            .add_rule(
                "GET",
                "/api/:id",
                Some(LatencyConfig { min: 7, max: 7 }),
                None,
            )
            .unwrap();
        engine
            .add_rule("GET", "/api/*", Some(LatencyConfig { min: 9, max: 9 }), None)
            .unwrap();

        assert_eq!(engine.decide("GET", "/api/42").unwrap().delay_ms, 7);

        engine.set_rule_enabled(first, false);
        assert_eq!(engine.decide("GET", "/api/42").unwrap().delay_ms, 9);

        // No rule matches POST; the default applies.
        assert_eq!(engine.decide("POST", "/other").unwrap().delay_ms, 1);
    }

    #[test]
    fn rule_validation_rejects_bad_input() {
        let engine = ChaosEngine::new();
        assert!(engine
            .add_rule("GET", "/x", Some(LatencyConfig { min: 5, max: 1 }), None)
            .is_err());
        assert!(engine
            .add_rule("GET", "/x", None, Some(error_config(150.0, 500)))
            .is_err());
        assert!(engine
            .add_rule("GET", "/x", None, Some(error_config(50.0, 200)))
            .is_err());
    }

    #[test]
    fn stats_average_tracks_total_over_processed() {
        let engine = ChaosEngine::new();
        engine.set_enabled(true);
        engine
            .set_default_latency(Some(LatencyConfig { min: 10, max: 10 }))
            .unwrap();
        for _ in 0..4 {
            engine.decide("GET", "/api").unwrap();
        }
        let stats = engine.stats();
        assert_eq!(stats.requests_processed, 4);
        assert_eq!(stats.total_latency_added_ms, 40);
        assert_eq!(stats.average_latency_ms, 10.0);
    }

    #[test]
    fn reason_phrases_cover_the_standard_table() {
        assert_eq!(status_text(400), "Bad Request");
        assert_eq!(status_text(429), "Too Many Requests");
        assert_eq!(status_text(504), "Gateway Timeout");
        assert_eq!(status_text(418), "Error");
    }
}
