//! Per-client delivery handlers.
//!
//! | Handler | Delivery |
//! |---|---|
//! | [`PullCallback`] | Bounded private queue, drained by the client on request |
//! | [`PushCallback`] | Dedicated worker that batches up to the receiving capacity and POSTs to the callback URL, retrying a failed batch until it succeeds |

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use intermesh_types::{Client, MessageEnvelope, ResponseFormat, RouteError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::response::{batch_body, serialize_response};

/// Errors raised by a single push attempt.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A client's delivery handler.
#[async_trait]
pub trait ApiCallback: Send + Sync {
    /// Queue `envelope` for delivery. Never blocks on the client.
    async fn handle(&self, envelope: MessageEnvelope) -> Result<(), RouteError>;

    /// Apply new delivery parameters without interrupting in-flight delivery.
    fn update(&self, client: &Client);

    /// Stop delivering. Queued messages are abandoned.
    fn stop(&self);

    fn as_pull(&self) -> Option<&PullCallback> {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pull
// ─────────────────────────────────────────────────────────────────────────────

pub struct PullCallback {
    client_id: String,
    /// Maximum batch handed out by [`retrieve`](Self::retrieve).
    receiving_capacity: AtomicUsize,
    tx: mpsc::Sender<MessageEnvelope>,
    rx: tokio::sync::Mutex<mpsc::Receiver<MessageEnvelope>>,
}

impl PullCallback {
    /// `queue_capacity` bounds the number of undelivered messages.
    pub fn new(client: &Client, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            client_id: client.client_id.clone(),
            receiving_capacity: AtomicUsize::new(client.receiving_capacity.max(1)),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Pop up to the receiving capacity of queued messages without waiting.
    pub async fn retrieve(&self) -> Vec<MessageEnvelope> {
        let limit = self.receiving_capacity.load(Ordering::Relaxed);
        let mut rx = self.rx.lock().await;
        let mut batch = Vec::with_capacity(limit.min(64));
        while batch.len() < limit {
            match rx.try_recv() {
                Ok(env) => batch.push(env),
                Err(_) => break,
            }
        }
        batch
    }

    /// Wait up to `timeout` for one message.
    pub async fn retrieve_one(&self, timeout: Duration) -> Option<MessageEnvelope> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Number of messages waiting in the queue.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

#[async_trait]
impl ApiCallback for PullCallback {
    async fn handle(&self, envelope: MessageEnvelope) -> Result<(), RouteError> {
        self.tx.try_send(envelope).map_err(|e| {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "queue closed",
            };
            RouteError::Transport(format!("pull queue for client '{}': {reason}", self.client_id))
        })
    }

    fn update(&self, client: &Client) {
        self.receiving_capacity
            .store(client.receiving_capacity.max(1), Ordering::Relaxed);
    }

    fn stop(&self) {
        debug!(client_id = %self.client_id, pending = self.pending(), "pull queue released");
    }

    fn as_pull(&self) -> Option<&PullCallback> {
        Some(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Push
// ─────────────────────────────────────────────────────────────────────────────

/// Tuning shared by every push worker.
#[derive(Debug, Clone)]
pub struct PushSettings {
    /// Wait between attempts of a failed batch.
    pub retry_delay: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Idle connections kept per callback host.
    pub max_connections: usize,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(15),
            timeout: Duration::from_secs(10),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone)]
struct PushTarget {
    url: String,
    capacity: usize,
    format: ResponseFormat,
}

impl PushTarget {
    fn from_client(client: &Client) -> Result<Self, RouteError> {
        let url = client
            .callback_url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                RouteError::Middleware(format!("push client '{}' has no callback url", client.client_id))
            })?;
        Ok(Self {
            url,
            capacity: client.receiving_capacity.max(1),
            format: client.response_format,
        })
    }
}

pub struct PushCallback {
    client_id: String,
    target: Arc<RwLock<PushTarget>>,
    queue: mpsc::UnboundedSender<String>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PushCallback {
    /// Spawn the delivery worker for `client`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Middleware`] when the client has no callback URL
    /// or the HTTP client cannot be built.
    pub fn start(client: &Client, settings: &PushSettings) -> Result<Self, RouteError> {
        let target = Arc::new(RwLock::new(PushTarget::from_client(client)?));
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .pool_max_idle_per_host(settings.max_connections)
            .build()
            .map_err(|e| RouteError::Middleware(format!("cannot build HTTP client: {e}")))?;
        let (queue, rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(push_worker(
            client.client_id.clone(),
            http,
            Arc::clone(&target),
            rx,
            settings.retry_delay,
        ));
        info!(client_id = %client.client_id, "push worker started");

        Ok(Self {
            client_id: client.client_id.clone(),
            target,
            queue,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn current_format(&self) -> ResponseFormat {
        self.target.read().unwrap_or_else(PoisonError::into_inner).format
    }
}

#[async_trait]
impl ApiCallback for PushCallback {
    async fn handle(&self, envelope: MessageEnvelope) -> Result<(), RouteError> {
        let body = serialize_response(&envelope, self.current_format())?;
        self.queue
            .send(body)
            .map_err(|_| RouteError::Transport(format!("push worker for client '{}' stopped", self.client_id)))
    }

    fn update(&self, client: &Client) {
        match PushTarget::from_client(client) {
            Ok(next) => {
                *self.target.write().unwrap_or_else(PoisonError::into_inner) = next;
                debug!(client_id = %self.client_id, "push target updated");
            }
            Err(e) => warn!(client_id = %self.client_id, error = %e, "push target update ignored"),
        }
    }

    fn stop(&self) {
        if let Some(worker) = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take() {
            worker.abort();
            info!(client_id = %self.client_id, "push worker stopped");
        }
    }
}

impl Drop for PushCallback {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn push_worker(
    client_id: String,
    http: reqwest::Client,
    target: Arc<RwLock<PushTarget>>,
    mut rx: mpsc::UnboundedReceiver<String>,
    retry_delay: Duration,
) {
    while let Some(first) = rx.recv().await {
        let capacity = target.read().unwrap_or_else(PoisonError::into_inner).capacity;
        let mut batch = vec![first];
        while batch.len() < capacity {
            match rx.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }
        let body = batch_body(&batch);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let snapshot = target.read().unwrap_or_else(PoisonError::into_inner).clone();
            match post_batch(&http, &snapshot, body.clone()).await {
                Ok(()) => {
                    debug!(client_id = %client_id, url = %snapshot.url, messages = batch.len(), attempt, "batch delivered");
                    break;
                }
                Err(e) => {
                    warn!(
                        client_id = %client_id,
                        url = %snapshot.url,
                        attempt,
                        error = %e,
                        "push delivery failed, retrying in {retry_delay:?}"
                    );
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }
    debug!(client_id = %client_id, "push queue closed");
}

async fn post_batch(http: &reqwest::Client, target: &PushTarget, body: String) -> Result<(), DeliveryError> {
    http.post(&target.url)
        .header(reqwest::header::CONTENT_TYPE, target.format.content_type())
        .body(body)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
