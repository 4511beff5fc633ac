use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{Method, Request, Uri, header::HeaderValue};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

use crate::record::{RequestRecord, ResponseRecord};

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Request headers that must not be copied onto the outbound request.
const SKIPPED_REQUEST_HEADERS: [&str; 6] = [
    "host",
    "connection",
    "transfer-encoding",
    "content-length",
    "keep-alive",
    "proxy-connection",
];

/// Response headers stripped after buffering: the client receives decoded,
/// re-framed content.
const STRIPPED_RESPONSE_HEADERS: [&str; 4] = [
    "transfer-encoding",
    "content-encoding",
    "connection",
    "content-length",
];

#[derive(Debug)]
pub enum ForwardError {
    /// Connect/read failure against the upstream.
    Unreachable { message: String },
    /// The configured deadline elapsed before the response was buffered.
    Timeout { after: Duration },
    /// A malformed record or URI; nothing was sent upstream.
    Internal(anyhow::Error),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable { message } => write!(f, "upstream unreachable: {message}"),
            Self::Timeout { after } => {
                write!(f, "upstream deadline of {}ms exceeded", after.as_millis())
            }
            Self::Internal(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for ForwardError {}

fn ensure_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

pub fn build_http_client() -> anyhow::Result<HttpClient> {
    ensure_crypto_provider()?;
    let connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

/// Copies a live request to the configured upstream and buffers the response
/// into a record. Built lazily from the engine's current target snapshot.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: HttpClient,
    base: Uri,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(client: HttpClient, base: Uri, timeout: Duration) -> Self {
        Self {
            client,
            base,
            timeout,
        }
    }

    pub async fn forward(&self, record: &RequestRecord) -> Result<ResponseRecord, ForwardError> {
        let outbound = self.build_outbound(record).map_err(ForwardError::Internal)?;

        let response = match tokio::time::timeout(self.timeout, self.client.request(outbound)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                return Err(ForwardError::Unreachable {
                    message: format!("{err:#}"),
                });
            }
            Err(_elapsed) => {
                return Err(ForwardError::Timeout {
                    after: self.timeout,
                });
            }
        };

        let (parts, body) = response.into_parts();
        let body_bytes = match tokio::time::timeout(self.timeout, body.collect()).await {
            Ok(Ok(collected)) => collected.to_bytes(),
            Ok(Err(err)) => {
                return Err(ForwardError::Unreachable {
                    message: format!("read upstream response body: {err:#}"),
                });
            }
            Err(_elapsed) => {
                return Err(ForwardError::Timeout {
                    after: self.timeout,
                });
            }
        };

        let mut response_record = ResponseRecord::from_parts(parts.status, &parts.headers, &body_bytes)
            .map_err(ForwardError::Internal)?;
        for name in STRIPPED_RESPONSE_HEADERS {
            response_record.headers.remove(name);
        }
        Ok(response_record)
    }

    /// Outbound request: same method, path, and query; `Host` rewritten to
    /// the upstream authority; parsed body re-serialized.
    fn build_outbound(&self, record: &RequestRecord) -> anyhow::Result<Request<Full<Bytes>>> {
        let uri = self.upstream_uri(record)?;
        let method: Method = record
            .method
            .parse()
            .with_context(|| format!("parse method `{}`", record.method))?;
        let authority = uri
            .authority()
            .context("upstream URI has no authority")?
            .to_string();

        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in &record.headers {
            if SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = builder.header(
            hyper::header::HOST,
            HeaderValue::from_str(&authority).context("build host header")?,
        );

        let body_bytes = record.body.to_wire_bytes()?.unwrap_or_default();
        builder
            .body(Full::new(Bytes::from(body_bytes)))
            .context("build outbound request")
    }

    fn upstream_uri(&self, record: &RequestRecord) -> anyhow::Result<Uri> {
        let mut path_and_query = record.path.clone();
        if let Some(query) = record.raw_query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        let mut parts = self.base.clone().into_parts();
        parts.path_and_query = Some(
            path_and_query
                .parse()
                .with_context(|| format!("parse path and query `{path_and_query}`"))?,
        );
        Uri::from_parts(parts).context("build upstream URI")
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use super::{Forwarder, build_http_client};
    use crate::record::{BodyValue, RequestRecord};

    fn record_for(path: &str, url: &str) -> RequestRecord {
        RequestRecord {
            method: "POST".to_owned(),
            url: url.to_owned(),
            path: path.to_owned(),
            query: BTreeMap::new(),
            headers: BTreeMap::from([
                ("host".to_owned(), "original.invalid".to_owned()),
                ("content-type".to_owned(), "application/json".to_owned()),
                ("x-kept".to_owned(), "yes".to_owned()),
                ("connection".to_owned(), "keep-alive".to_owned()),
            ]),
            body: BodyValue::Json(serde_json::json!({"a": 1})),
            id: "req-1".to_owned(),
            captured_at_unix_ms: 0,
        }
    }

    #[test]
    fn outbound_request_rewrites_host_and_keeps_query() {
        let forwarder = Forwarder::new(
            build_http_client().unwrap(),
            "http://upstream.test:8080".parse().unwrap(),
            Duration::from_secs(5),
        );
        let record = record_for("/api/items", "/api/items?b=2&a=1");
        let outbound = forwarder.build_outbound(&record).unwrap();

        assert_eq!(outbound.uri().host(), Some("upstream.test"));
        assert_eq!(outbound.uri().path(), "/api/items");
        assert_eq!(outbound.uri().query(), Some("b=2&a=1"));
        assert_eq!(
            outbound
                .headers()
                .get(hyper::header::HOST)
                .and_then(|value| value.to_str().ok()),
            Some("upstream.test:8080")
        );
        assert_eq!(
            outbound
                .headers()
                .get("x-kept")
                .and_then(|value| value.to_str().ok()),
            Some("yes")
        );
        assert!(outbound.headers().get("connection").is_none());
    }

    #[tokio::test]
    async fn unreachable_upstream_maps_to_unreachable_error() {
        // Port 9 on localhost is expected to refuse connections.
        let forwarder = Forwarder::new(
            build_http_client().unwrap(),
            "http://127.0.0.1:9".parse().unwrap(),
            Duration::from_secs(2),
        );
        let record = record_for("/api", "/api");
        let err = forwarder.forward(&record).await.unwrap_err();
        assert!(matches!(err, super::ForwardError::Unreachable { .. }), "{err}");
    }
}
