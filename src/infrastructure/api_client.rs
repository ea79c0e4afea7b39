//! HTTP client for the upstream catalog API
//!
//! Every call goes through the same path:
//! 1. the request observer may veto the call (emergency stop, force stop)
//! 2. credentials are resolved
//! 3. the shared [`RequestPacer`] spaces the request and counts it
//! 4. the request is sent with a per-endpoint timeout
//! 5. the observer records activity, which doubles as the run heartbeat
//!
//! Failures come back as [`ApiError`] so the caller can decide between
//! backing off and failing the run.

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, StatusCode, header::ACCEPT};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::catalog::CatalogEntity;
use crate::infrastructure::config::{ApiConfig, CredentialProvider};
use crate::infrastructure::rate_limit::RequestPacer;

/// Error bodies longer than this are cut before being stored
const MAX_ERROR_BODY_CHARS: usize = 2_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("API credentials are not configured")]
    MissingCredentials,

    #[error("Request to {url} timed out")]
    Timeout { url: String },

    #[error("Connection to {url} failed: {message}")]
    Connection { url: String, message: String },

    #[error("HTTP transport error for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("HTTP {status} from {url}: {body}")]
    Status { status: u16, url: String, body: String },

    #[error("Malformed response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("Request cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Timeouts, connection failures and rate limiting are worth a later retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Connection { .. } => true,
            Self::Status { status, .. } => *status == StatusCode::TOO_MANY_REQUESTS,
            _ => false,
        }
    }

    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    fn from_reqwest(url: &Url, error: &reqwest::Error) -> Self {
        let url = url.to_string();
        if error.is_timeout() {
            Self::Timeout { url }
        } else if error.is_connect() {
            Self::Connection {
                url,
                message: error.to_string(),
            }
        } else if error.is_decode() {
            Self::Decode {
                url,
                message: error.to_string(),
            }
        } else {
            Self::Transport {
                url,
                message: error.to_string(),
            }
        }
    }
}

/// Upstream catalog operations the sync engine depends on
#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn fetch_top_level_list(&self) -> Result<Vec<CatalogEntity>, ApiError>;

    async fn fetch_providers_for(&self, blueprint_id: &str) -> Result<Vec<CatalogEntity>, ApiError>;

    async fn fetch_variants_for(
        &self,
        blueprint_id: &str,
        provider_id: &str,
    ) -> Result<Vec<CatalogEntity>, ApiError>;
}

/// Hook around each outgoing request
#[async_trait]
pub trait RequestObserver: Send + Sync {
    /// Return an error to short-circuit the call before anything is sent
    async fn before_request(&self) -> Result<(), ApiError>;

    /// Called once the call has finished, whatever the outcome
    async fn after_request(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    Blueprints,
    Providers { blueprint_id: String },
    Variants { blueprint_id: String, provider_id: String },
}

impl Endpoint {
    fn path(&self) -> String {
        match self {
            Self::Blueprints => "catalog/blueprints.json".to_string(),
            Self::Providers { blueprint_id } => {
                format!("catalog/blueprints/{blueprint_id}/print_providers.json")
            }
            Self::Variants {
                blueprint_id,
                provider_id,
            } => format!(
                "catalog/blueprints/{blueprint_id}/print_providers/{provider_id}/variants.json"
            ),
        }
    }

    /// Provider and variant payloads are large
    const fn is_heavy(&self) -> bool {
        !matches!(self, Self::Blueprints)
    }
}

/// reqwest based [`CatalogApi`] implementation
pub struct HttpCatalogClient {
    client: Client,
    base_url: Url,
    pacer: Arc<RequestPacer>,
    credentials: Arc<dyn CredentialProvider>,
    default_timeout: Duration,
    catalog_timeout: Duration,
    observer: Option<Arc<dyn RequestObserver>>,
}

impl HttpCatalogClient {
    pub fn new(
        config: &ApiConfig,
        credentials: Arc<dyn CredentialProvider>,
        pacer: Arc<RequestPacer>,
    ) -> Result<Self, ApiError> {
        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|e| ApiError::InvalidUrl(format!("{base}: {e}")))?;

        let client = ClientBuilder::new()
            .user_agent(&config.user_agent)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| ApiError::Transport {
                url: base_url.to_string(),
                message: format!("Failed to create HTTP client: {e}"),
            })?;

        info!("🌐 Catalog API client ready for {}", base_url);

        Ok(Self {
            client,
            base_url,
            pacer,
            credentials,
            default_timeout: config.default_timeout(),
            catalog_timeout: config.catalog_timeout(),
            observer: None,
        })
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn RequestObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    const fn timeout_for(&self, endpoint: &Endpoint) -> Duration {
        if endpoint.is_heavy() {
            self.catalog_timeout
        } else {
            self.default_timeout
        }
    }

    async fn get_json(&self, endpoint: &Endpoint) -> Result<Value, ApiError> {
        if let Some(observer) = &self.observer {
            observer.before_request().await?;
        }

        let api_key = self
            .credentials
            .api_key()
            .ok_or(ApiError::MissingCredentials)?;

        let url = self
            .base_url
            .join(&endpoint.path())
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {e}", endpoint.path())))?;

        self.pacer.acquire().await;

        debug!("GET {}", url);
        let result = self.send(&url, &api_key, self.timeout_for(endpoint)).await;

        if let Some(observer) = &self.observer {
            observer.after_request().await;
        }

        result
    }

    async fn send(&self, url: &Url, api_key: &str, timeout: Duration) -> Result<Value, ApiError> {
        let response = self
            .client
            .get(url.clone())
            .bearer_auth(api_key)
            .header(ACCEPT, "application/json")
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(url, &e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::from_reqwest(url, &e))?;

        if !status.is_success() {
            warn!("HTTP {} from {}", status.as_u16(), url);
            return Err(ApiError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        serde_json::from_str(&body).map_err(|e| ApiError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    async fn fetch_entities(&self, endpoint: Endpoint, list_key: &str) -> Result<Vec<CatalogEntity>, ApiError> {
        let value = self.get_json(&endpoint).await?;
        let items = extract_items(value, list_key).ok_or_else(|| ApiError::Decode {
            url: endpoint.path(),
            message: format!("expected a list or an object holding \"{list_key}\""),
        })?;

        let total = items.len();
        let entities: Vec<CatalogEntity> = items
            .into_iter()
            .filter_map(CatalogEntity::from_value)
            .collect();
        if entities.len() < total {
            warn!(
                "Skipped {} item(s) without an id from {}",
                total - entities.len(),
                endpoint.path()
            );
        }
        Ok(entities)
    }
}

/// Accept a bare array, an object holding `list_key`, or a paginated `data` page.
fn extract_items(value: Value, list_key: &str) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => match map.remove(list_key) {
            Some(Value::Array(items)) => Some(items),
            _ => match map.remove("data") {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            },
        },
        _ => None,
    }
}

#[async_trait]
impl CatalogApi for HttpCatalogClient {
    async fn fetch_top_level_list(&self) -> Result<Vec<CatalogEntity>, ApiError> {
        self.fetch_entities(Endpoint::Blueprints, "blueprints").await
    }

    async fn fetch_providers_for(&self, blueprint_id: &str) -> Result<Vec<CatalogEntity>, ApiError> {
        self.fetch_entities(
            Endpoint::Providers {
                blueprint_id: blueprint_id.to_string(),
            },
            "print_providers",
        )
        .await
    }

    async fn fetch_variants_for(
        &self,
        blueprint_id: &str,
        provider_id: &str,
    ) -> Result<Vec<CatalogEntity>, ApiError> {
        self.fetch_entities(
            Endpoint::Variants {
                blueprint_id: blueprint_id.to_string(),
                provider_id: provider_id.to_string(),
            },
            "variants",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::StaticCredentials;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serve the given raw bodies, one per connection, and hand back the request heads.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let mut heads = Vec::new();
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buffer = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buffer.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buffer.extend_from_slice(&chunk[..n]);
                }
                heads.push(String::from_utf8_lossy(&buffer).to_string());

                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
            heads
        });

        (format!("http://{addr}/v1"), handle)
    }

    fn client(base_url: &str, key: Option<&str>) -> HttpCatalogClient {
        let config = ApiConfig {
            base_url: base_url.to_string(),
            min_request_interval_ms: 0,
            ..Default::default()
        };
        let pacer = Arc::new(RequestPacer::from_config(&config));
        HttpCatalogClient::new(
            &config,
            Arc::new(StaticCredentials(key.map(str::to_string))),
            pacer,
        )
        .unwrap()
    }

    #[derive(Default)]
    struct CountingObserver {
        stop: bool,
        before: AtomicUsize,
        after: AtomicUsize,
    }

    #[async_trait]
    impl RequestObserver for CountingObserver {
        async fn before_request(&self) -> Result<(), ApiError> {
            self.before.fetch_add(1, Ordering::SeqCst);
            if self.stop {
                return Err(ApiError::cancelled("emergency stop"));
            }
            Ok(())
        }

        async fn after_request(&self) {
            self.after.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_top_level_list_is_parsed_and_authorised() {
        let (base, server) = serve(vec![(
            200,
            r#"[{"id": 3, "title": "Tee"}, {"id": 5, "title": "Mug"}, {"title": "no id"}]"#,
        )])
        .await;
        let observer = Arc::new(CountingObserver::default());
        let client = client(&base, Some("secret")).with_observer(observer.clone());

        let entities = client.fetch_top_level_list().await.unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].id, "3");
        assert_eq!(entities[1].title, "Mug");

        let heads = server.await.unwrap();
        let head = heads[0].to_lowercase();
        assert!(head.starts_with("get /v1/catalog/blueprints.json"));
        assert!(head.contains("authorization: bearer secret"));
        assert_eq!(observer.before.load(Ordering::SeqCst), 1);
        assert_eq!(observer.after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_variants_wrapped_in_object() {
        let (base, server) = serve(vec![(
            200,
            r#"{"id": 3, "title": "Monster", "variants": [{"id": 17390, "title": "S"}]}"#,
        )])
        .await;
        let client = client(&base, Some("k"));

        let variants = client.fetch_variants_for("6", "3").await.unwrap();
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].id, "17390");

        let heads = server.await.unwrap();
        assert!(heads[0].contains("/v1/catalog/blueprints/6/print_providers/3/variants.json"));
    }

    #[tokio::test]
    async fn test_error_status_surfaces_body() {
        let (base, _server) = serve(vec![(500, r#"{"error":"upstream broke"}"#)]).await;
        let client = client(&base, Some("k"));

        let err = client.fetch_providers_for("1").await.unwrap_err();
        match &err {
            ApiError::Status { status, body, .. } => {
                assert_eq!(*status, 500);
                assert!(body.contains("upstream broke"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let (base, _server) = serve(vec![(200, "<html>maintenance</html>")]).await;
        let client = client(&base, Some("k"));

        let err = client.fetch_top_level_list().await.unwrap_err();
        assert!(matches!(err, ApiError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_unexpected_shape_is_decode_error() {
        let (base, _server) = serve(vec![(200, r#"{"message": "ok"}"#)]).await;
        let client = client(&base, Some("k"));

        let err = client.fetch_top_level_list().await.unwrap_err();
        assert!(matches!(err, ApiError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client(&format!("http://{addr}/"), Some("k"));
        let err = client.fetch_top_level_list().await.unwrap_err();
        assert!(err.is_transient(), "expected transient error, got {err:?}");
    }

    #[tokio::test]
    async fn test_missing_credentials_short_circuits() {
        let client = client("http://127.0.0.1:9/", None);
        let err = client.fetch_top_level_list().await.unwrap_err();
        assert_eq!(err, ApiError::MissingCredentials);
    }

    #[tokio::test]
    async fn test_observer_veto_prevents_request() {
        let observer = Arc::new(CountingObserver {
            stop: true,
            ..Default::default()
        });
        let client = client("http://127.0.0.1:9/", Some("k")).with_observer(observer.clone());

        let err = client.fetch_providers_for("1").await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(observer.after.load(Ordering::SeqCst), 0);
    }

    #[rstest]
    #[case(ApiError::Timeout { url: "u".into() }, true)]
    #[case(ApiError::Connection { url: "u".into(), message: "reset".into() }, true)]
    #[case(ApiError::Status { status: 429, url: "u".into(), body: String::new() }, true)]
    #[case(ApiError::Status { status: 503, url: "u".into(), body: String::new() }, false)]
    #[case(ApiError::Status { status: 404, url: "u".into(), body: String::new() }, false)]
    #[case(ApiError::Decode { url: "u".into(), message: "x".into() }, false)]
    #[case(ApiError::MissingCredentials, false)]
    #[case(ApiError::cancelled("stop"), false)]
    fn test_transient_classification(#[case] error: ApiError, #[case] transient: bool) {
        assert_eq!(error.is_transient(), transient);
    }

    #[test]
    fn test_extract_items_shapes() {
        let paged = serde_json::json!({"current_page": 1, "data": [{"id": 1}]});
        assert_eq!(extract_items(paged, "blueprints").unwrap().len(), 1);
        assert!(extract_items(serde_json::json!("text"), "blueprints").is_none());
    }
}
