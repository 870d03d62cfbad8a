//! Typed calls against the file broker's HTTP API.

use crate::client::{RequestBody, ResponseReader, TransferOrchestrator};
use crate::error::{ErrorKind, Result};
use attire_asyncutils::Progress;
use attire_cache::ContentHash;
use bytes::Bytes;
use exn::ResultExt;
use reqwest::{Method, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;

/// What the broker knows about one requested file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub hash: ContentHash,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub forbidden: bool,
    #[serde(default)]
    pub forbidden_by: Option<String>,
    /// Set when the file should be fetched on its own rather than batched.
    #[serde(default)]
    pub direct_url: Option<Url>,
    /// Host serving the batch this file belongs to. Absent means the broker
    /// itself.
    #[serde(default)]
    pub host: Option<Url>,
}

/// A file the broker wants uploaded, or refuses outright.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCandidate {
    pub hash: ContentHash,
    #[serde(default)]
    pub forbidden: bool,
    #[serde(default)]
    pub forbidden_by: Option<String>,
}

/// How upload bytes are put on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadTransport {
    Plain,
    /// XOR-munged; for proxies that mangle or cache the plain route.
    Munged,
}

/// Join `segments` onto `base`, keeping any path `base` already carries.
pub fn endpoint_url(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| ErrorKind::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn with_request_id(mut url: Url, request_id: &str) -> Url {
    url.query_pairs_mut().append_pair("requestId", request_id);
    url
}

fn hash_list(hashes: &[ContentHash]) -> serde_json::Value {
    serde_json::Value::from(hashes.iter().map(ToString::to_string).collect::<Vec<_>>())
}

/// Read and decode a whole JSON body. The body can stall after the headers
/// arrived, so this watches `cancel` as well.
async fn json<T: DeserializeOwned>(response: Response, cancel: &CancellationToken) -> Result<T> {
    let body = tokio::select! {
        biased;
        _ = cancel.cancelled() => exn::bail!(ErrorKind::Cancelled),
        body = response.bytes() => body.or_raise(|| ErrorKind::Network)?,
    };
    serde_json::from_slice(&body).or_raise(|| ErrorKind::InvalidResponse)
}

#[derive(Clone)]
pub struct FileServer {
    orchestrator: Arc<TransferOrchestrator>,
}

impl FileServer {
    pub fn new(orchestrator: Arc<TransferOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Arc<TransferOrchestrator> {
        &self.orchestrator
    }

    fn broker(&self, segments: &[&str]) -> Result<Url> {
        endpoint_url(&self.orchestrator.endpoint()?, segments)
    }

    #[instrument(skip_all, fields(count = hashes.len()))]
    pub async fn get_sizes(&self, hashes: &[ContentHash], cancel: &CancellationToken) -> Result<Vec<RemoteFile>> {
        let url = self.broker(&["files", "getFileSizes"])?;
        let response =
            self.orchestrator.send(Method::POST, url, RequestBody::Json(hash_list(hashes)), cancel, true).await?;
        json(response, cancel).await
    }

    /// Queue a batch on `host`. Returns the request id to poll.
    #[instrument(skip_all, fields(%host, count = hashes.len()))]
    pub async fn enqueue(&self, host: &Url, hashes: &[ContentHash], cancel: &CancellationToken) -> Result<String> {
        let url = endpoint_url(host, &["files", "enqueue"])?;
        let response =
            self.orchestrator.send(Method::POST, url, RequestBody::Json(hash_list(hashes)), cancel, true).await?;
        json(response, cancel).await
    }

    /// Keeps the queued request alive. Returns whether it's ready.
    #[instrument(skip(self, cancel))]
    pub async fn check_queue(&self, host: &Url, request_id: &str, cancel: &CancellationToken) -> Result<bool> {
        let url = with_request_id(endpoint_url(host, &["request", "check"])?, request_id);
        let response = self.orchestrator.send(Method::GET, url, RequestBody::Empty, cancel, true).await?;
        json(response, cancel).await
    }

    /// Drop a queued request. Callers usually do this while already unwinding
    /// from a cancellation, so it takes its own token.
    #[instrument(skip(self, cancel))]
    pub async fn cancel(&self, host: &Url, request_id: &str, cancel: &CancellationToken) -> Result<()> {
        let url = with_request_id(endpoint_url(host, &["request", "cancel"])?, request_id);
        self.orchestrator.send(Method::GET, url, RequestBody::Empty, cancel, true).await?;
        Ok(())
    }

    /// Start streaming a ready batch. The body is a munged container.
    #[instrument(skip(self, cancel))]
    pub async fn container(&self, host: &Url, request_id: &str, cancel: &CancellationToken) -> Result<ResponseReader> {
        let url = with_request_id(endpoint_url(host, &["cache", "get"])?, request_id);
        let response = self.orchestrator.send(Method::GET, url, RequestBody::Empty, cancel, true).await?;
        Ok(self.orchestrator.throttled(response))
    }

    /// Start streaming one compressed file from a URL the broker handed out.
    #[instrument(skip(self, cancel), fields(url = %url))]
    pub async fn direct(&self, url: &Url, cancel: &CancellationToken) -> Result<ResponseReader> {
        let response = self.orchestrator.send(Method::GET, url.clone(), RequestBody::Empty, cancel, false).await?;
        Ok(self.orchestrator.throttled(response))
    }

    /// Which of `hashes` the broker still needs, and which it refuses.
    #[instrument(skip_all, fields(count = hashes.len()))]
    pub async fn files_send(&self, hashes: &[ContentHash], cancel: &CancellationToken) -> Result<Vec<UploadCandidate>> {
        let url = self.broker(&["files", "filesSend"])?;
        let response =
            self.orchestrator.send(Method::POST, url, RequestBody::Json(hash_list(hashes)), cancel, true).await?;
        json(response, cancel).await
    }

    /// Upload one compressed file.
    #[instrument(skip(self, compressed, progress, cancel), fields(%hash, bytes = compressed.len()))]
    pub async fn upload(
        &self,
        hash: &ContentHash,
        compressed: Bytes,
        transport: UploadTransport,
        progress: Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let hash = hash.to_string();
        let (route, bytes) = match transport {
            UploadTransport::Plain => ("upload", compressed),
            UploadTransport::Munged => ("uploadMunged", Bytes::from(attire_container::munged(&compressed))),
        };
        let url = self.broker(&["files", route, &hash])?;
        let body = RequestBody::Streamed { bytes, progress };
        self.orchestrator.send(Method::POST, url, body, cancel, true).await?;
        Ok(())
    }

    /// Delete every file this user has uploaded.
    #[instrument(skip_all)]
    pub async fn delete_all(&self, cancel: &CancellationToken) -> Result<()> {
        let url = self.broker(&["files", "deleteAll"])?;
        self.orchestrator.send(Method::POST, url, RequestBody::Empty, cancel, true).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StaticToken;
    use crate::events::EventBus;
    use attire_config::TransferSettings;
    use rstest::rstest;
    use tokio::io::AsyncReadExt;
    use tokio::sync::watch;
    use wiremock::matchers::{body_bytes, body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HASH: &str = "0A4D55A8D778E5022FAB701977C5D840BBC486D0";

    fn hash() -> ContentHash {
        HASH.parse().unwrap()
    }

    fn file_server(server: Option<&MockServer>) -> (FileServer, watch::Sender<TransferSettings>) {
        let (sender, receiver) = watch::channel(TransferSettings::default());
        let tokens = Arc::new(StaticToken::new(Some("token".to_string())));
        let orchestrator = Arc::new(TransferOrchestrator::new(receiver, tokens, EventBus::default()));
        if let Some(server) = server {
            orchestrator.connected(Url::parse(&server.uri()).unwrap());
        }
        (FileServer::new(orchestrator), sender)
    }

    #[rstest]
    #[case::bare("https://broker.example.com", "https://broker.example.com/files/enqueue")]
    #[case::trailing_slash("https://broker.example.com/", "https://broker.example.com/files/enqueue")]
    #[case::nested("https://example.com/api/v2/", "https://example.com/api/v2/files/enqueue")]
    fn test_endpoint_url(#[case] base: &str, #[case] expected: &str) {
        let url = endpoint_url(&Url::parse(base).unwrap(), &["files", "enqueue"]).unwrap();
        assert_eq!(url.as_str(), expected);
    }

    #[test]
    fn test_endpoint_url_rejects_opaque_base() {
        let err = endpoint_url(&Url::parse("mailto:broker@example.com").unwrap(), &["files"]).unwrap_err();
        assert!(matches!(*err, ErrorKind::InvalidUrl(_)));
    }

    #[test]
    fn test_remote_file_wire_format() {
        let files: Vec<RemoteFile> = serde_json::from_str(&format!(
            r#"[
                {{"hash": "{}", "size": 1024, "forbidden": false, "directUrl": "https://cdn.example.com/f"}},
                {{"hash": "{HASH}", "size": 0, "forbidden": true, "forbiddenBy": "moderation"}}
            ]"#,
            HASH.to_lowercase()
        ))
        .unwrap();
        assert_eq!(files[0].hash, hash());
        assert_eq!(files[0].direct_url.as_ref().map(Url::as_str), Some("https://cdn.example.com/f"));
        assert_eq!(files[0].host, None);
        assert!(files[1].forbidden);
        assert_eq!(files[1].forbidden_by.as_deref(), Some("moderation"));
    }

    #[tokio::test]
    async fn test_get_sizes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/files/getFileSizes"))
            .and(header("authorization", "Bearer token"))
            .and(body_json(serde_json::json!([HASH])))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"hash": HASH, "size": 12, "forbidden": false, "host": server.uri()}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        let (api, _settings) = file_server(Some(&server));
        let files = api.get_sizes(&[hash()], &CancellationToken::new()).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 12);
        assert!(files[0].host.is_some());
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let (api, _settings) = file_server(None);
        let err = api.get_sizes(&[hash()], &CancellationToken::new()).await.unwrap_err();
        assert_eq!(*err, ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_cancel_while_body_stalls() {
        use tokio::io::AsyncWriteExt;

        // Headers and one byte of the body, then nothing.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let head = b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 64\r\n\r\n[";
            socket.write_all(head).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        });
        let (api, _settings) = file_server(None);
        api.orchestrator().connected(Url::parse(&format!("http://{address}/")).unwrap());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = tokio::time::timeout(std::time::Duration::from_secs(5), api.get_sizes(&[hash()], &cancel))
            .await
            .expect("cancellation ignored while reading the body")
            .unwrap_err();
        assert_eq!(*err, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_unexpected_body() {
        let server = MockServer::start().await;
        Mock::given(path("/files/getFileSizes"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;
        let (api, _settings) = file_server(Some(&server));
        let err = api.get_sizes(&[hash()], &CancellationToken::new()).await.unwrap_err();
        assert_eq!(*err, ErrorKind::InvalidResponse);
    }

    #[tokio::test]
    async fn test_queue_lifecycle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/files/enqueue"))
            .respond_with(ResponseTemplate::new(200).set_body_json("req-1"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/request/check"))
            .and(query_param("requestId", "req-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(true))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/request/cancel"))
            .and(query_param("requestId", "req-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let (api, _settings) = file_server(Some(&server));
        let host = Url::parse(&server.uri()).unwrap();
        let cancel = CancellationToken::new();

        let request_id = api.enqueue(&host, &[hash()], &cancel).await.unwrap();
        assert_eq!(request_id, "req-1");
        assert!(api.check_queue(&host, &request_id, &cancel).await.unwrap());
        api.cancel(&host, &request_id, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_container_stream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cache/get"))
            .and(query_param("requestId", "req-9"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"container bytes".to_vec()))
            .mount(&server)
            .await;
        let (api, _settings) = file_server(Some(&server));
        let host = Url::parse(&server.uri()).unwrap();
        let mut reader = api.container(&host, "req-9", &CancellationToken::new()).await.unwrap();
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"container bytes");
    }

    #[rstest]
    #[case::plain(UploadTransport::Plain, "/files/upload/", b"\x01\x02\x03".to_vec())]
    #[case::munged(UploadTransport::Munged, "/files/uploadMunged/", vec![1 ^ 42, 2 ^ 42, 3 ^ 42])]
    #[tokio::test]
    async fn test_upload(#[case] transport: UploadTransport, #[case] route: &str, #[case] wire: Vec<u8>) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{route}{HASH}")))
            .and(body_bytes(wire))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let (api, _settings) = file_server(Some(&server));
        let progress = Progress::default();
        api.upload(&hash(), Bytes::from_static(&[1, 2, 3]), transport, progress.clone(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(progress.transferred(), 3);
    }

    #[tokio::test]
    async fn test_files_send_and_delete_all() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/files/filesSend"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!([{"hash": HASH, "forbidden": false}])),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/files/deleteAll"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let (api, _settings) = file_server(Some(&server));
        let cancel = CancellationToken::new();
        let candidates = api.files_send(&[hash()], &cancel).await.unwrap();
        assert_eq!(candidates, vec![UploadCandidate { hash: hash(), forbidden: false, forbidden_by: None }]);
        api.delete_all(&cancel).await.unwrap();
    }
}
