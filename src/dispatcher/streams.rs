//! Client-to-server upload streams.
//!
//! Each stream id named by an invocation gets a bounded channel. StreamItem
//! messages push into it, a Completion closes it (or faults it, when the
//! completion carries an error), and a connection abort faults every open
//! stream.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::ParamType;

/// Why an upload stream ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStreamError {
    /// The connection went away while the stream was open.
    ConnectionAborted,
    /// The client completed the stream with an error, or sent an item that
    /// could not be bound.
    Faulted(String),
}

impl std::fmt::Display for UploadStreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionAborted => write!(f, "The connection was aborted."),
            Self::Faulted(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for UploadStreamError {}

type StreamItem = Result<Value, UploadStreamError>;

/// Receiving end of an upload stream, handed to the hub method.
#[derive(Debug)]
pub struct UploadStream {
    id: String,
    rx: mpsc::Receiver<StreamItem>,
    abort: CancellationToken,
    finished: bool,
}

impl UploadStream {
    /// Stream id the client chose.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next item.
    ///
    /// `None` once the client completed the stream. After an error (fault or
    /// abort) the stream is finished.
    pub async fn next(&mut self) -> Option<StreamItem> {
        if self.finished {
            return None;
        }
        let item = tokio::select! {
            biased;
            () = self.abort.cancelled() => Some(Err(UploadStreamError::ConnectionAborted)),
            item = self.rx.recv() => item,
        };
        if !matches!(item, Some(Ok(_))) {
            self.finished = true;
        }
        item
    }

    /// Collect every item, stopping at the first error.
    pub async fn collect(mut self) -> Result<Vec<Value>, UploadStreamError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Adapt into a `futures` stream.
    pub fn into_stream(self) -> BoxStream<'static, StreamItem> {
        stream::unfold(self, |mut upload| async move {
            upload.next().await.map(|item| (item, upload))
        })
        .boxed()
    }
}

struct PendingStream {
    item_type: ParamType,
    tx: mpsc::Sender<StreamItem>,
}

/// Open upload streams of one connection, keyed by stream id.
#[derive(Default)]
pub struct StreamTracker {
    streams: Mutex<HashMap<String, PendingStream>>,
}

impl std::fmt::Debug for StreamTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTracker")
            .field("open", &self.lock().len())
            .finish()
    }
}

impl StreamTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingStream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open `id`. Returns `None` if a stream with that id is already open.
    pub fn open(
        &self,
        id: &str,
        item_type: ParamType,
        capacity: usize,
        abort: CancellationToken,
    ) -> Option<UploadStream> {
        let mut streams = self.lock();
        if streams.contains_key(id) {
            return None;
        }
        let (tx, rx) = mpsc::channel(capacity.max(1));
        streams.insert(id.to_string(), PendingStream { item_type, tx });
        Some(UploadStream {
            id: id.to_string(),
            rx,
            abort,
            finished: false,
        })
    }

    /// Declared item type of `id`, if open.
    pub fn item_type(&self, id: &str) -> Option<ParamType> {
        self.lock().get(id).map(|s| s.item_type)
    }

    /// Number of open streams.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no stream is open.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Push an item, waiting for room in the channel.
    ///
    /// Returns `false` for an unknown id. An item for a stream whose method
    /// stopped reading is discarded.
    pub async fn push(&self, id: &str, item: Value) -> bool {
        let tx = match self.lock().get(id) {
            Some(stream) => stream.tx.clone(),
            None => return false,
        };
        if tx.send(Ok(item)).await.is_err() {
            log::debug!("[Dispatch] Upload stream '{id}' no longer read; item dropped");
        }
        true
    }

    /// Close `id`. With `error`, the reader sees a fault before the end.
    ///
    /// Returns `false` for an unknown id.
    pub async fn complete(&self, id: &str, error: Option<String>) -> bool {
        let Some(stream) = self.lock().remove(id) else {
            return false;
        };
        if let Some(error) = error {
            let _ = stream.tx.send(Err(UploadStreamError::Faulted(error))).await;
        }
        true
    }

    /// Forget streams without completing them.
    pub fn remove(&self, ids: &[String]) {
        let mut streams = self.lock();
        for id in ids {
            streams.remove(id);
        }
    }

    /// Drop every open stream. Readers observe the connection abort.
    pub fn clear(&self) {
        self.lock().clear();
    }
}
