use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    pattern::{looks_like_id, split_segments},
    record::{BodyValue, RecordedEntry, RequestRecord},
};

pub const DEFAULT_IGNORED_HEADERS: [&str; 10] = [
    "authorization",
    "cookie",
    "x-request-id",
    "x-correlation-id",
    "date",
    "user-agent",
    "host",
    "content-length",
    "connection",
    "accept-encoding",
];

const METHOD_SCORE: f64 = 100.0;
const PATH_EXACT_SCORE: f64 = 100.0;
const PATH_SMART_SCORE: f64 = 90.0;
const PATH_FUZZY_SCORE: f64 = 80.0;
const QUERY_SCORE: f64 = 50.0;
const HEADER_SCORE: f64 = 30.0;
const BODY_EQUAL_SCORE: f64 = 50.0;
const BODY_PARTIAL_SCORE: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStrategy {
    Exact,
    Smart,
    Fuzzy,
}

impl FromStr for MatchStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "smart" => Ok(Self::Smart),
            "fuzzy" => Ok(Self::Fuzzy),
            other => anyhow::bail!(
                "invalid matching strategy `{other}`; expected one of exact, smart, fuzzy"
            ),
        }
    }
}

impl MatchStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Smart => "smart",
            Self::Fuzzy => "fuzzy",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub strategy: MatchStrategy,
    pub ignored_headers: HashSet<String>,
    pub ignored_query_params: HashSet<String>,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            strategy: MatchStrategy::Smart,
            ignored_headers: DEFAULT_IGNORED_HEADERS
                .iter()
                .map(|name| (*name).to_owned())
                .collect(),
            ignored_query_params: HashSet::new(),
        }
    }
}

impl MatcherConfig {
    pub fn with_strategy(strategy: MatchStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    fn header_ignored(&self, name: &str) -> bool {
        self.ignored_headers.contains(&name.to_ascii_lowercase())
    }

    fn query_param_ignored(&self, name: &str) -> bool {
        self.ignored_query_params.contains(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Contribution {
    Disqualify,
    Add(f64),
}

#[derive(Debug, Clone, Copy)]
pub struct ScoredEntry<'a> {
    pub entry: &'a RecordedEntry,
    pub score: f64,
}

/// Scores one candidate against the live request, or disqualifies it.
pub fn score_candidate(
    live: &RequestRecord,
    candidate: &RequestRecord,
    config: &MatcherConfig,
) -> Option<f64> {
    let contributions = [
        method_contribution(live, candidate),
        path_contribution(live, candidate, config.strategy),
        query_contribution(live, candidate, config),
        header_contribution(live, candidate, config),
        body_contribution(live, candidate),
    ];

    let mut total = 0.0;
    for contribution in contributions {
        match contribution {
            Contribution::Disqualify => return None,
            Contribution::Add(points) => total += points,
        }
    }
    Some(total)
}

/// Highest score wins; ties keep the input order of `entries`.
pub fn best_match<'a>(
    live: &RequestRecord,
    entries: &'a [RecordedEntry],
    config: &MatcherConfig,
) -> Option<&'a RecordedEntry> {
    let mut best: Option<ScoredEntry<'a>> = None;
    for entry in entries {
        let Some(score) = score_candidate(live, &entry.request, config) else {
            continue;
        };
        match best {
            Some(current) if current.score >= score => {}
            _ => best = Some(ScoredEntry { entry, score }),
        }
    }
    best.map(|scored| scored.entry)
}

/// Every qualifying candidate, best first; equal scores preserve input order.
pub fn rank<'a>(
    live: &RequestRecord,
    entries: &'a [RecordedEntry],
    config: &MatcherConfig,
) -> Vec<ScoredEntry<'a>> {
    let mut scored: Vec<ScoredEntry<'a>> = entries
        .iter()
        .filter_map(|entry| {
            score_candidate(live, &entry.request, config)
                .map(|score| ScoredEntry { entry, score })
        })
        .collect();
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

fn method_contribution(live: &RequestRecord, candidate: &RequestRecord) -> Contribution {
    if live.method.eq_ignore_ascii_case(&candidate.method) {
        Contribution::Add(METHOD_SCORE)
    } else {
        Contribution::Disqualify
    }
}

fn path_contribution(
    live: &RequestRecord,
    candidate: &RequestRecord,
    strategy: MatchStrategy,
) -> Contribution {
    if live.path == candidate.path {
        return Contribution::Add(PATH_EXACT_SCORE);
    }

    match strategy {
        MatchStrategy::Exact => Contribution::Disqualify,
        MatchStrategy::Smart => smart_path_contribution(&live.path, &candidate.path),
        MatchStrategy::Fuzzy => fuzzy_path_contribution(&live.path, &candidate.path),
    }
}

/// Paths of equal depth where every differing segment is ID-like on both
/// sides still match, slightly below an exact path hit.
fn smart_path_contribution(live_path: &str, candidate_path: &str) -> Contribution {
    let live_segments = split_segments(live_path);
    let candidate_segments = split_segments(candidate_path);
    if live_segments.len() != candidate_segments.len() {
        return Contribution::Disqualify;
    }

    for (live_segment, candidate_segment) in live_segments.iter().zip(candidate_segments.iter()) {
        if live_segment == candidate_segment {
            continue;
        }
        if !(looks_like_id(live_segment) && looks_like_id(candidate_segment)) {
            return Contribution::Disqualify;
        }
    }
    Contribution::Add(PATH_SMART_SCORE)
}

fn fuzzy_path_contribution(live_path: &str, candidate_path: &str) -> Contribution {
    let live_segments = split_segments(live_path);
    let candidate_segments = split_segments(candidate_path);
    if live_segments.len() != candidate_segments.len() {
        return Contribution::Disqualify;
    }

    let total = live_segments.len();
    let mut matched = 0usize;
    for (live_segment, candidate_segment) in live_segments.iter().zip(candidate_segments.iter()) {
        if live_segment == candidate_segment {
            matched += 1;
        } else if !(looks_like_id(live_segment) && looks_like_id(candidate_segment)) {
            return Contribution::Disqualify;
        }
    }

    if total == 0 {
        return Contribution::Add(PATH_FUZZY_SCORE);
    }
    Contribution::Add(matched as f64 / total as f64 * PATH_FUZZY_SCORE)
}

fn query_contribution(
    live: &RequestRecord,
    candidate: &RequestRecord,
    config: &MatcherConfig,
) -> Contribution {
    Contribution::Add(keyed_overlap_score(
        &live.query,
        &candidate.query,
        QUERY_SCORE,
        |name| config.query_param_ignored(name),
    ))
}

fn header_contribution(
    live: &RequestRecord,
    candidate: &RequestRecord,
    config: &MatcherConfig,
) -> Contribution {
    Contribution::Add(keyed_overlap_score(
        &live.headers,
        &candidate.headers,
        HEADER_SCORE,
        |name| config.header_ignored(name),
    ))
}

/// `(exact-matching keys / union of keys) * weight`. An empty union cannot
/// distinguish candidates and contributes the full weight.
fn keyed_overlap_score(
    live: &BTreeMap<String, String>,
    candidate: &BTreeMap<String, String>,
    weight: f64,
    ignored: impl Fn(&str) -> bool,
) -> f64 {
    let union: BTreeSet<&str> = live
        .keys()
        .chain(candidate.keys())
        .map(String::as_str)
        .filter(|name| !ignored(name))
        .collect();
    if union.is_empty() {
        return weight;
    }

    let matching = union
        .iter()
        .filter(|name| {
            matches!((live.get(**name), candidate.get(**name)), (Some(a), Some(b)) if a == b)
        })
        .count();
    matching as f64 / union.len() as f64 * weight
}

fn body_contribution(live: &RequestRecord, candidate: &RequestRecord) -> Contribution {
    if !matches!(live.method.as_str(), "POST" | "PUT" | "PATCH") {
        return Contribution::Add(0.0);
    }

    if live.body == candidate.body {
        return Contribution::Add(BODY_EQUAL_SCORE);
    }

    if let (BodyValue::Json(Value::Object(live_obj)), BodyValue::Json(Value::Object(cand_obj))) =
        (&live.body, &candidate.body)
    {
        let max_keys = live_obj.len().max(cand_obj.len());
        if max_keys == 0 {
            return Contribution::Add(0.0);
        }
        let common = live_obj.keys().filter(|key| cand_obj.contains_key(*key)).count();
        return Contribution::Add(common as f64 / max_keys as f64 * BODY_PARTIAL_SCORE);
    }

    Contribution::Add(0.0)
}
