//! Traffic capture.
//!
//! Handlers hand finished exchanges to a [`TrafficRecorder`]; a single
//! writer task drains the channel in batches and appends them to the
//! per-day log files. A full or closed channel drops the entry with a
//! warning rather than slowing the proxied response.

use std::time::Instant;

use chrono::Utc;
use hyper::HeaderMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use watchtower_core::http_client::from_header_map;
use watchtower_core::ids::new_id;
use watchtower_core::models::body_text;
use watchtower_core::{ApiLogEntry, LogSource};
use watchtower_storage::TrafficLogStore;

/// Largest body persisted per message; the forwarded body is never cut.
pub const MAX_CAPTURED_BODY: usize = 1024 * 1024;

const CHANNEL_CAPACITY: usize = 1024;
const MAX_BATCH: usize = 256;

/// Sending half of the capture pipeline.
#[derive(Debug, Clone)]
pub struct TrafficRecorder {
    tx: mpsc::Sender<ApiLogEntry>,
}

impl TrafficRecorder {
    /// Starts the writer task for `store`.
    pub fn spawn(store: TrafficLogStore) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = tokio::spawn(run_writer(rx, store));
        (Self { tx }, handle)
    }

    /// A recorder whose entries go nowhere.
    pub fn disabled() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self { tx }
    }

    /// Queues an entry without waiting.
    pub fn record(&self, entry: ApiLogEntry) {
        match self.tx.try_send(entry) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(entry)) => {
                warn!(host = %entry.host, "Traffic capture queue full, dropping entry")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Traffic capture disabled, entry discarded")
            }
        }
    }
}

async fn run_writer(mut rx: mpsc::Receiver<ApiLogEntry>, store: TrafficLogStore) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(entry) => batch.push(entry),
                Err(_) => break,
            }
        }

        let count = batch.len();
        let writer = store.clone();
        match tokio::task::spawn_blocking(move || writer.append_all(&batch)).await {
            Ok(Ok(())) => debug!(count, "Persisted captured traffic"),
            Ok(Err(e)) => warn!(count, "Failed to persist captured traffic: {}", e),
            Err(e) => warn!(count, "Traffic writer task failed: {}", e),
        }
    }
    debug!("Traffic writer stopped");
}

/// Persisted form of a body: capped, UTF-8 where possible.
pub fn captured_body(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }

    let capped = &bytes[..bytes.len().min(MAX_CAPTURED_BODY)];
    match std::str::from_utf8(capped) {
        Ok(text) => Some(text.to_string()),
        // The cap split a multi-byte character
        Err(e) if e.error_len().is_none() && bytes.len() > MAX_CAPTURED_BODY => {
            Some(body_text(&capped[..e.valid_up_to()]))
        }
        Err(_) => Some(body_text(capped)),
    }
}

/// One observed request/response pair, borrowed from the handler.
#[derive(Debug)]
pub struct Exchange<'a> {
    pub method: &'a str,
    pub url: String,
    pub host: &'a str,
    pub path: &'a str,
    pub status_code: u16,
    pub request_headers: &'a HeaderMap,
    pub request_body: &'a [u8],
    pub response_headers: &'a HeaderMap,
    pub response_body: &'a [u8],
    pub started: Instant,
}

impl Exchange<'_> {
    /// Builds the log entry; bodies only when `with_bodies`.
    pub fn into_entry(self, with_bodies: bool, source: LogSource) -> ApiLogEntry {
        let (request_body, response_body) = if with_bodies {
            (
                captured_body(self.request_body),
                captured_body(self.response_body),
            )
        } else {
            (None, None)
        };

        ApiLogEntry {
            id: new_id("log"),
            timestamp: Utc::now().timestamp_millis(),
            method: self.method.to_string(),
            url: self.url,
            host: self.host.to_string(),
            path: self.path.to_string(),
            status_code: self.status_code,
            request_headers: from_header_map(self.request_headers),
            request_body,
            response_headers: from_header_map(self.response_headers),
            response_body,
            source,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}
