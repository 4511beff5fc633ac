use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context as _;
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A captured body. `Json(Value::Null)` is a present JSON `null`, which is
/// distinct from `Absent` (no body was sent at all).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum BodyValue {
    #[default]
    Absent,
    Raw(String),
    Json(Value),
}

impl BodyValue {
    pub fn from_bytes(content_type: Option<&str>, bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self::Absent;
        }

        let content_type = content_type.unwrap_or_default();
        if content_type.contains("application/json") {
            return match serde_json::from_slice(bytes) {
                Ok(value) => Self::Json(value),
                Err(_) => Self::Raw(String::from_utf8_lossy(bytes).into_owned()),
            };
        }
        if content_type.contains("application/x-www-form-urlencoded") {
            let decoded = String::from_utf8_lossy(bytes);
            let pairs: serde_json::Map<String, Value> = parse_urlencoded(&decoded)
                .into_iter()
                .map(|(name, value)| (name, Value::String(value)))
                .collect();
            return Self::Json(Value::Object(pairs));
        }

        Self::Raw(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Serializes the body for the wire. `Absent` yields no bytes.
    pub fn to_wire_bytes(&self) -> anyhow::Result<Option<Vec<u8>>> {
        match self {
            Self::Absent => Ok(None),
            Self::Raw(text) => Ok(Some(text.clone().into_bytes())),
            Self::Json(value) => Ok(Some(
                serde_json::to_vec(value).context("serialize JSON body")?,
            )),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: BodyValue,
    pub id: String,
    pub captured_at_unix_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: BodyValue,
    pub captured_at_unix_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEntry {
    pub id: String,
    pub request: RequestRecord,
    pub response: ResponseRecord,
    pub created_at_unix_ms: i64,
}

impl RequestRecord {
    pub fn from_parts(
        method: &hyper::Method,
        uri: &hyper::Uri,
        headers: &hyper::HeaderMap,
        body_bytes: &[u8],
    ) -> anyhow::Result<Self> {
        let header_map = header_map_to_record(headers);
        let content_type = header_map.get("content-type").map(String::as_str);
        let body = BodyValue::from_bytes(content_type, body_bytes);

        Ok(Self {
            method: method.as_str().to_ascii_uppercase(),
            url: uri.to_string(),
            path: uri.path().to_owned(),
            query: query_map(uri.query()),
            headers: header_map,
            body,
            id: generate_id(),
            captured_at_unix_ms: now_unix_ms()?,
        })
    }

    /// Query string exactly as received, for rebuilding the upstream URI.
    pub fn raw_query(&self) -> Option<&str> {
        self.url.split_once('?').map(|(_, query)| query)
    }
}

impl ResponseRecord {
    pub fn from_parts(
        status: hyper::StatusCode,
        headers: &hyper::HeaderMap,
        body_bytes: &[u8],
    ) -> anyhow::Result<Self> {
        let header_map = header_map_to_record(headers);
        let content_type = header_map.get("content-type").map(String::as_str);
        let body = BodyValue::from_bytes(content_type, body_bytes);

        Ok(Self {
            status: status.as_u16(),
            headers: header_map,
            body,
            captured_at_unix_ms: now_unix_ms()?,
        })
    }

    pub fn json(status: u16, body: Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_owned(), "application/json".to_owned());
        Self {
            status,
            headers,
            body: BodyValue::Json(body),
            captured_at_unix_ms: now_unix_ms().unwrap_or(0),
        }
    }
}

pub fn now_unix_ms() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time before unix epoch")?;
    Ok(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}

/// Fresh globally-unique id. The fixed-width millisecond prefix plus a
/// process-wide sequence makes lexicographic order recover insertion order;
/// the random suffix keeps ids distinct across processes.
pub fn generate_id() -> String {
    static SEQUENCE: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
    let millis = now_unix_ms().unwrap_or(0).max(0);
    let seq = SEQUENCE.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let suffix: u32 = rand::thread_rng().r#gen();
    format!("{millis:013}-{seq:08x}-{suffix:08x}")
}

/// Lowercases header names and comma-joins repeated values.
pub fn header_map_to_record(headers: &hyper::HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let name = name.as_str().to_ascii_lowercase();
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}

/// Last-wins map of decoded query parameters.
pub fn query_map(query: Option<&str>) -> BTreeMap<String, String> {
    let Some(query) = query else {
        return BTreeMap::new();
    };
    parse_urlencoded(query).into_iter().collect()
}

fn parse_urlencoded(input: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for segment in input.split('&') {
        if segment.is_empty() {
            continue;
        }
        let (name, value) = segment.split_once('=').unwrap_or((segment, ""));
        out.push((percent_decode(name), percent_decode(value)));
    }
    out
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'+' => {
                out.push(b' ');
                idx += 1;
            }
            b'%' => match (hex_val(bytes.get(idx + 1)), hex_val(bytes.get(idx + 2))) {
                (Some(hi), Some(lo)) => {
                    out.push(hi * 16 + lo);
                    idx += 3;
                }
                _ => {
                    out.push(b'%');
                    idx += 1;
                }
            },
            byte => {
                out.push(byte);
                idx += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(byte: Option<&u8>) -> Option<u8> {
    match byte? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
