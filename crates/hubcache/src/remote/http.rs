//! # HTTP hub collaborator
//!
//! [`HubRemote`] over the hub's HTTP API using `reqwest`.
//!
//! File downloads go through the `resolve` endpoint. Large files answer with a
//! redirect to a storage host; the redirect carries the hub's content identity
//! (`X-Linked-Etag`) and size (`X-Linked-Size`), so the redirect is followed by
//! hand instead of by the client.

use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, Response, StatusCode, redirect};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::HttpConfig;
use crate::error::{CacheError, CacheResult};
use crate::remote::provider::{
    ByteRange, FetchResponse, HubRemote, RemoteError, RemoteFile, RemoteMetadata, normalize_etag,
};
use crate::repo::{FileRef, RepoKind};

const LINKED_ETAG: &str = "x-linked-etag";
const LINKED_SIZE: &str = "x-linked-size";
const ETAG: &str = "etag";

/// Build a client from the HTTP options
pub fn create_client(config: &HttpConfig) -> CacheResult<Client> {
    build_client(config, redirect::Policy::limited(10))
}

fn build_client(config: &HttpConfig, policy: redirect::Policy) -> CacheResult<Client> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(policy);

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.read_timeout.is_zero() {
        client_builder = client_builder.read_timeout(config.read_timeout);
    }

    if let Some(proxy_url) = &config.proxy {
        client_builder = client_builder.proxy(reqwest::Proxy::all(proxy_url)?);
        info!(proxy_url = %proxy_url, "Using configured proxy");
    }

    Ok(client_builder.build()?)
}

#[derive(Debug, Deserialize)]
struct RevisionInfo {
    sha: Option<String>,
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sibling {
    rfilename: String,
    size: Option<u64>,
    blob_id: Option<String>,
    lfs: Option<LfsInfo>,
}

#[derive(Debug, Deserialize)]
struct LfsInfo {
    sha256: String,
    size: Option<u64>,
}

impl From<RevisionInfo> for RemoteMetadata {
    fn from(info: RevisionInfo) -> Self {
        let files = info
            .siblings
            .into_iter()
            .map(|sibling| {
                let (content_id, size) = match sibling.lfs {
                    Some(lfs) => (Some(lfs.sha256), lfs.size.or(sibling.size)),
                    None => (sibling.blob_id, sibling.size),
                };
                (sibling.rfilename, RemoteFile { size, content_id })
            })
            .collect();
        Self {
            commit: info.sha,
            files,
        }
    }
}

/// Hub collaborator speaking HTTP
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    // Surfaces redirects so their headers can be read
    resolve_client: Client,
    endpoint: Url,
    config: HttpConfig,
}

impl HttpRemote {
    pub fn new(config: HttpConfig) -> CacheResult<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            CacheError::InvalidArgument(format!("invalid endpoint '{}': {e}", config.endpoint))
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(CacheError::InvalidArgument(format!(
                "endpoint '{}' cannot be a base URL",
                config.endpoint
            )));
        }

        Ok(Self {
            client: create_client(&config)?,
            resolve_client: build_client(&config, redirect::Policy::none())?,
            endpoint,
            config,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// `{endpoint}/api/{kind}s/{repo_id}/revision/{revision}?blobs=true`
    pub fn metadata_url(
        &self,
        kind: RepoKind,
        repo_id: &str,
        revision: &str,
    ) -> Result<Url, RemoteError> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RemoteError::Other("endpoint cannot be a base URL".to_string()))?;
            segments.pop_if_empty();
            segments.push("api").push(kind.api_segment());
            segments.extend(repo_id.split('/'));
            // A revision like `refs/pr/1` is one segment
            segments.push("revision").push(revision);
        }
        url.set_query(Some("blobs=true"));
        Ok(url)
    }

    /// `{endpoint}/{prefix}{repo_id}/resolve/{revision}/{filename}`
    pub fn resolve_url(&self, file: &FileRef) -> Result<Url, RemoteError> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RemoteError::Other("endpoint cannot be a base URL".to_string()))?;
            segments.pop_if_empty();
            if let Some(prefix) = file.kind.url_prefix().strip_suffix('/') {
                segments.push(prefix);
            }
            segments.extend(file.repo_id.split('/'));
            segments.push("resolve").push(&file.revision);
            segments.extend(file.filename.split('/'));
        }
        Ok(url)
    }

    async fn fetch_metadata_once(&self, url: &Url) -> Result<RemoteMetadata, RemoteError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(classify_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, url));
        }
        let info: RevisionInfo = response.json().await.map_err(|e| {
            if e.is_decode() {
                RemoteError::Other(format!("malformed revision listing from {url}: {e}"))
            } else {
                classify_error(e)
            }
        })?;
        Ok(info.into())
    }

    async fn send_ranged(
        &self,
        client: &Client,
        url: Url,
        range: Option<ByteRange>,
    ) -> Result<Response, RemoteError> {
        let mut request_builder = client.get(url);
        if let Some(range) = range {
            request_builder = request_builder.header(header::RANGE, range.to_header());
        }
        request_builder.send().await.map_err(classify_error)
    }
}

#[async_trait::async_trait]
impl HubRemote for HttpRemote {
    async fn fetch_metadata(
        &self,
        kind: RepoKind,
        repo_id: &str,
        revision: &str,
    ) -> Result<RemoteMetadata, RemoteError> {
        let url = self.metadata_url(kind, repo_id, revision)?;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.fetch_metadata_once(&url).await {
                Ok(metadata) => {
                    debug!(url = %url, files = metadata.files.len(), "Fetched revision listing");
                    return Ok(metadata);
                }
                Err(RemoteError::Transient(reason)) if attempts <= self.config.max_retries => {
                    let delay = retry_delay(self.config.retry_delay_base, attempts);
                    warn!(
                        url = %url,
                        attempt = attempts,
                        delay = ?delay,
                        error = %reason,
                        "Revision listing failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_bytes(
        &self,
        file: &FileRef,
        range: Option<ByteRange>,
    ) -> Result<FetchResponse, RemoteError> {
        let url = self.resolve_url(file)?;
        let mut response = self
            .send_ranged(&self.resolve_client, url.clone(), range)
            .await?;

        let mut content_id = identity(response.headers());
        let mut linked_size = header_u64(response.headers(), LINKED_SIZE);

        if response.status().is_redirection() {
            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| RemoteError::Other(format!("redirect without location from {url}")))?;
            let target = url
                .join(location)
                .map_err(|e| RemoteError::Other(format!("bad redirect location '{location}': {e}")))?;
            debug!(file = %file, target = %target, "Following resolve redirect");

            response = self.send_ranged(&self.client, target, range).await?;
            content_id = content_id.or_else(|| identity(response.headers()));
            linked_size = linked_size.or_else(|| header_u64(response.headers(), LINKED_SIZE));
        }

        let status = response.status();
        let (range_start, total_size) = match status {
            StatusCode::PARTIAL_CONTENT => {
                let content_range = response
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(parse_content_range)
                    .ok_or_else(|| {
                        RemoteError::Other(format!("partial response without Content-Range for {file}"))
                    })?;
                (content_range.0, content_range.1.or(linked_size))
            }
            status if status.is_success() => (0, response.content_length().or(linked_size)),
            status => return Err(classify_status(status, &url)),
        };

        let stream = response
            .bytes_stream()
            .map_err(|e| RemoteError::Transient(e.to_string()))
            .boxed();

        Ok(FetchResponse {
            range_start,
            total_size,
            content_id,
            stream,
        })
    }
}

fn retry_delay(base: Duration, attempts: u32) -> Duration {
    base * 2_u32.saturating_pow(attempts.saturating_sub(1))
}

fn identity(headers: &HeaderMap) -> Option<String> {
    [LINKED_ETAG, ETAG]
        .into_iter()
        .filter_map(|name| headers.get(name)?.to_str().ok())
        .find_map(normalize_etag)
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Parse `bytes <start>-<end>/<total>`; the total may be `*`
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;
    let (start, _end) = span.split_once('-')?;
    let total = match total.trim() {
        "*" => None,
        total => Some(total.parse().ok()?),
    };
    Some((start.trim().parse().ok()?, total))
}

fn classify_status(status: StatusCode, url: &Url) -> RemoteError {
    match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound(url.to_string()),
        StatusCode::RANGE_NOT_SATISFIABLE => RemoteError::RangeNotSatisfiable,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Transient(format!("status {status} for {url}"))
        }
        status if status.is_server_error() => {
            RemoteError::Transient(format!("status {status} for {url}"))
        }
        status => RemoteError::Other(format!("status {status} for {url}")),
    }
}

fn classify_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RemoteError::Transient(err.to_string())
    } else {
        RemoteError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header as header_eq, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn remote(server: &MockServer) -> HttpRemote {
        let config = HttpConfig::builder()
            .with_endpoint(server.uri())
            .with_retry_delay_base(Duration::from_millis(1))
            .with_max_retries(2)
            .build();
        HttpRemote::new(config).unwrap()
    }

    async fn collect(response: FetchResponse) -> Vec<u8> {
        let chunks: Vec<_> = response.stream.try_collect().await.unwrap();
        chunks.concat()
    }

    #[test]
    fn urls_follow_hub_conventions() {
        let remote = HttpRemote::new(
            HttpConfig::builder()
                .with_endpoint("https://hub.example.com/mirror/")
                .build(),
        )
        .unwrap();

        let url = remote
            .metadata_url(RepoKind::Model, "org/name", "refs/pr/1")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://hub.example.com/mirror/api/models/org/name/revision/refs%2Fpr%2F1?blobs=true"
        );

        let file = FileRef::new(RepoKind::Dataset, "org/data", "main", "dir/train.csv");
        assert_eq!(
            remote.resolve_url(&file).unwrap().as_str(),
            "https://hub.example.com/mirror/datasets/org/data/resolve/main/dir/train.csv"
        );
    }

    #[test]
    fn content_range_parsing() {
        assert_eq!(parse_content_range("bytes 3-9/10"), Some((3, Some(10))));
        assert_eq!(parse_content_range("bytes 0-0/*"), Some((0, None)));
        assert_eq!(parse_content_range("items 0-1/2"), None);
        assert_eq!(parse_content_range("bytes x-1/2"), None);
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        let config = HttpConfig::builder().with_endpoint("not a url").build();
        assert!(matches!(
            HttpRemote::new(config),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn parses_revision_listing() {
        let server = MockServer::start().await;
        let body = serde_json::json!({
            "sha": "abc123",
            "siblings": [
                { "rfilename": "config.json", "size": 12, "blobId": "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391" },
                { "rfilename": "model.bin", "size": 134, "blobId": "ffff",
                  "lfs": { "sha256": "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08", "size": 4096 } }
            ]
        });
        Mock::given(method("GET"))
            .and(path("/api/models/org/name/revision/main"))
            .and(query_param("blobs", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let metadata = remote(&server)
            .fetch_metadata(RepoKind::Model, "org/name", "main")
            .await
            .unwrap();

        assert_eq!(metadata.commit.as_deref(), Some("abc123"));
        let config = metadata.file("config.json").unwrap();
        assert_eq!(config.size, Some(12));
        assert_eq!(
            config.content_id.as_deref(),
            Some("e69de29bb2d1d6434b8b29ae775ad8c2e48c5391")
        );
        let model = metadata.file("model.bin").unwrap();
        assert_eq!(model.size, Some(4096));
        assert!(model.content_id.as_deref().unwrap().starts_with("9f86d081"));
    }

    #[tokio::test]
    async fn missing_repo_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = remote(&server)
            .fetch_metadata(RepoKind::Space, "org/app", "main")
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(_)));
    }

    #[tokio::test]
    async fn transient_listing_failures_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "siblings": [] })))
            .expect(1)
            .mount(&server)
            .await;

        let metadata = remote(&server)
            .fetch_metadata(RepoKind::Model, "gpt2", "main")
            .await
            .unwrap();
        assert!(metadata.files.is_empty());
    }

    #[tokio::test]
    async fn ranged_fetch_reports_offset_and_identity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/datasets/org/data/resolve/main/dir/file.txt"))
            .and(header_eq("range", "bytes=3-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 3-9/10")
                    .insert_header("ETag", "\"abc\"")
                    .set_body_bytes(b"3456789".to_vec()),
            )
            .mount(&server)
            .await;

        let file = FileRef::new(RepoKind::Dataset, "org/data", "main", "dir/file.txt");
        let response = remote(&server)
            .fetch_bytes(&file, Some(ByteRange::from(3)))
            .await
            .unwrap();

        assert_eq!(response.range_start, 3);
        assert_eq!(response.total_size, Some(10));
        assert_eq!(response.content_id.as_deref(), Some("abc"));
        assert_eq!(collect(response).await, b"3456789");
    }

    #[tokio::test]
    async fn redirect_headers_carry_identity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gpt2/resolve/main/model.bin"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", "/storage/blob")
                    .insert_header("X-Linked-Etag", "\"linked-id\"")
                    .insert_header("X-Linked-Size", "4"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/blob"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"storage-etag\"")
                    .set_body_bytes(b"data".to_vec()),
            )
            .mount(&server)
            .await;

        let file = FileRef::model("gpt2", "main", "model.bin");
        let response = remote(&server).fetch_bytes(&file, None).await.unwrap();

        assert_eq!(response.range_start, 0);
        assert_eq!(response.total_size, Some(4));
        assert_eq!(response.content_id.as_deref(), Some("linked-id"));
        assert_eq!(collect(response).await, b"data");
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_distinct() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(416))
            .mount(&server)
            .await;

        let file = FileRef::model("gpt2", "main", "a.bin");
        let err = remote(&server)
            .fetch_bytes(&file, Some(ByteRange::from(100)))
            .await
            .unwrap_err();
        assert_eq!(err, RemoteError::RangeNotSatisfiable);
    }

    #[tokio::test]
    async fn stalled_response_times_out_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"late".to_vec())
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let config = HttpConfig::builder()
            .with_endpoint(server.uri())
            .with_read_timeout(Duration::from_millis(200))
            .build();
        let file = FileRef::model("gpt2", "main", "model.bin");
        let err = HttpRemote::new(config)
            .unwrap()
            .fetch_bytes(&file, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Transient(_)), "{err:?}");
    }
}
