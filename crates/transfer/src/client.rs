use crate::bandwidth::Bandwidth;
use crate::error::{ErrorKind, Result};
use crate::events::{Event, EventBus};
use crate::slots::{SlotGuard, SlotPool, TransferKind};
use async_trait::async_trait;
use attire_asyncutils::{Progress, Throttle, ThrottledReader};
use attire_config::TransferSettings;
use bytes::Bytes;
use exn::ResultExt;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, Method, Response, StatusCode};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;

const UPLOAD_CHUNK: usize = 64 * 1024;

/// Source of bearer tokens for authenticated broker requests.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// `None` sends the request unauthenticated.
    async fn token(&self) -> Option<String>;
}

/// A fixed token, e.g. from configuration.
#[derive(Clone, Debug, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token)
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Bytes(Bytes),
    /// Sent in chunks, adding to `progress` as the transport pulls them.
    Streamed { bytes: Bytes, progress: Progress },
}

/// A response body read through the shared download throttle.
pub type ResponseReader = ThrottledReader<StreamReader<BoxStream<'static, std::io::Result<Bytes>>, Bytes>>;

/// Owns everything transfers share: the HTTP client, the slot pools, the
/// bandwidth budget and the connection to the broker.
pub struct TransferOrchestrator {
    http: Client,
    endpoint: RwLock<Option<Url>>,
    settings: watch::Receiver<TransferSettings>,
    tokens: Arc<dyn TokenProvider>,
    downloads: Arc<SlotPool>,
    uploads: Arc<SlotPool>,
    bandwidth: Arc<Bandwidth>,
    events: EventBus,
}

impl TransferOrchestrator {
    pub fn new(settings: watch::Receiver<TransferSettings>, tokens: Arc<dyn TokenProvider>, events: EventBus) -> Self {
        Self::with_client(Client::new(), settings, tokens, events)
    }

    pub fn with_client(
        http: Client,
        settings: watch::Receiver<TransferSettings>,
        tokens: Arc<dyn TokenProvider>,
        events: EventBus,
    ) -> Self {
        let current = settings.borrow().clone();
        let bandwidth = Arc::new(Bandwidth::new(settings.clone(), events.clone()));
        let downloads = {
            let bandwidth = Arc::clone(&bandwidth);
            Arc::new(
                SlotPool::new(TransferKind::Download, current.parallel_downloads)
                    .on_occupancy_change(move |held| bandwidth.recompute(held)),
            )
        };
        let uploads = Arc::new(SlotPool::new(TransferKind::Upload, current.parallel_uploads));
        Self { http, endpoint: RwLock::new(None), settings, tokens, downloads, uploads, bandwidth, events }
    }

    /// Recompute the bandwidth share whenever configuration changes, until
    /// the configuration sender goes away. Requires a running runtime.
    pub fn watch_settings(self: &Arc<Self>) {
        let mut settings = self.settings.clone();
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            while settings.changed().await.is_ok() {
                let Some(this) = this.upgrade() else {
                    break;
                };
                this.bandwidth.recompute(this.downloads.in_use());
            }
        });
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Snapshot of the live transfer settings.
    pub fn settings(&self) -> TransferSettings {
        self.settings.borrow().clone()
    }

    pub fn slot_pool(&self, kind: TransferKind) -> &Arc<SlotPool> {
        match kind {
            TransferKind::Download => &self.downloads,
            TransferKind::Upload => &self.uploads,
        }
    }

    /// Wait for a slot, first applying any capacity change from
    /// configuration if the pool is idle.
    pub async fn acquire(&self, kind: TransferKind, cancel: &CancellationToken) -> Result<SlotGuard> {
        let capacity = {
            let settings = self.settings.borrow();
            match kind {
                TransferKind::Download => settings.parallel_downloads,
                TransferKind::Upload => settings.parallel_uploads,
            }
        };
        let pool = self.slot_pool(kind);
        pool.resize_if_idle(capacity);
        pool.acquire(cancel).await
    }

    /// What each active download may currently use, in bytes per second.
    /// Zero means unlimited.
    pub fn bandwidth_budget_per_slot(&self) -> u64 {
        self.bandwidth.budget(self.downloads.in_use())
    }

    /// The limit every download stream reads on each chunk.
    pub fn throttle(&self) -> Throttle {
        self.bandwidth.throttle()
    }

    pub fn connected(&self, endpoint: Url) {
        tracing::info!(endpoint = %endpoint, "Connected to file broker");
        *self.endpoint.write().unwrap_or_else(PoisonError::into_inner) = Some(endpoint.clone());
        self.events.publish(Event::Connected { endpoint });
    }

    pub fn disconnected(&self) {
        let previous = self.endpoint.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(endpoint) = previous {
            tracing::info!(endpoint = %endpoint, "Disconnected from file broker");
        }
        self.events.publish(Event::Disconnected);
    }

    pub fn endpoint(&self) -> Result<Url> {
        let endpoint = self.endpoint.read().unwrap_or_else(PoisonError::into_inner).clone();
        endpoint.ok_or_else(|| ErrorKind::NotConnected.into())
    }

    /// Send one request to the broker.
    ///
    /// 401 and 404 become [`ErrorKind::InvalidData`]; every other failure is
    /// [`ErrorKind::Network`]. Cancellation wins over a response arriving at
    /// the same time.
    #[instrument(skip(self, body, cancel), fields(status = tracing::field::Empty))]
    pub async fn send(
        &self,
        method: Method,
        url: Url,
        body: RequestBody,
        cancel: &CancellationToken,
        with_auth: bool,
    ) -> Result<Response> {
        let mut request = self.http.request(method, url);
        if with_auth {
            match self.tokens.token().await {
                Some(token) => request = request.bearer_auth(token),
                None => tracing::warn!("No token available; sending unauthenticated request"),
            }
        }
        request = match body {
            RequestBody::Empty => request,
            RequestBody::Json(value) => request.json(&value),
            RequestBody::Bytes(bytes) => request.body(bytes),
            RequestBody::Streamed { bytes, progress } => {
                request.header(CONTENT_LENGTH, bytes.len()).body(reqwest::Body::wrap_stream(chunked(bytes, progress)))
            },
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => exn::bail!(ErrorKind::Cancelled),
            response = request.send() => match response {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(error = %err, "Request to broker failed");
                    return Err(err).or_raise(|| ErrorKind::Network);
                },
            },
        };
        let status = response.status();
        tracing::Span::current().record("status", status.as_u16());
        match status {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => {
                tracing::warn!(%status, "Broker rejected request");
                exn::bail!(ErrorKind::InvalidData(status.as_u16()))
            },
            status => {
                tracing::warn!(%status, "Broker request unsuccessful");
                exn::bail!(ErrorKind::Network)
            },
        }
    }

    /// Wrap a response body in the shared download throttle.
    pub fn throttled(&self, response: Response) -> ResponseReader {
        let stream = response.bytes_stream().map_err(std::io::Error::other).boxed();
        ThrottledReader::new(StreamReader::new(stream), self.throttle())
    }
}

fn chunked(bytes: Bytes, progress: Progress) -> impl futures::Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    progress.set_total(bytes.len() as u64);
    let chunks: Vec<Bytes> = (0..bytes.len())
        .step_by(UPLOAD_CHUNK)
        .map(|start| bytes.slice(start..(start + UPLOAD_CHUNK).min(bytes.len())))
        .collect();
    stream::iter(chunks).map(move |chunk| {
        progress.add(chunk.len() as u64);
        Ok(chunk)
    })
}
