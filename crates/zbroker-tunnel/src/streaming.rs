//! Streaming table
//!
//! Streamed responses are correlated by streaming id. The forwarder calls
//! [`StreamingTable::begin`] and turns the returned [`StreamReceiver`] into an
//! HTTP response; data arriving later (framed POSTs on `/response-data` or
//! legacy `chunk` messages) is routed to the stored sink.
//!
//! Entries that are not finished within the configured TTL are evicted by a
//! background sweep. Destroying a stream delivers its error to the consumer
//! ahead of any buffered chunks and wakes writers parked on a full buffer.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use futures_util::stream::{self, Stream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use zbroker_observability::metrics;

use crate::protocol::ResponseMeta;
use crate::{Result, TunnelError};

/// Body chunks buffered per stream before writers are paused
pub const STREAM_BUFFER_CHUNKS: usize = 16;

/// Item type of a streamed body
pub type BodyChunk = std::result::Result<Bytes, io::Error>;

/// Consumer half of a stream: the status/headers, then the body
#[derive(Debug)]
pub struct StreamReceiver {
    /// Resolves once status and headers are known; errors if the stream is
    /// destroyed first
    pub head: oneshot::Receiver<ResponseMeta>,
    /// Body chunks; ends on finish, yields an error on destroy
    pub body: StreamBody,
}

/// Body half of a stream
///
/// Yields buffered chunks until the stream is finished. If the stream is
/// destroyed, the next item is the destroy reason as an error and the body
/// ends there, whether or not chunks were still buffered.
#[derive(Debug)]
pub struct StreamBody {
    chunks: mpsc::Receiver<BodyChunk>,
    abort: oneshot::Receiver<String>,
    abort_open: bool,
    done: bool,
}

impl StreamBody {
    /// Receive the next chunk; `None` once the body is complete or aborted
    pub async fn recv(&mut self) -> Option<BodyChunk> {
        loop {
            if self.done {
                return None;
            }
            tokio::select! {
                biased;

                reason = &mut self.abort, if self.abort_open => {
                    self.abort_open = false;
                    // A closed abort channel means the stream finished normally
                    if let Ok(reason) = reason {
                        self.done = true;
                        return Some(Err(io::Error::other(reason)));
                    }
                }

                chunk = self.chunks.recv() => {
                    if chunk.is_none() {
                        self.done = true;
                    }
                    return chunk;
                }
            }
        }
    }

    /// Adapt into a `Stream` for HTTP body construction
    pub fn into_stream(self) -> impl Stream<Item = BodyChunk> + Send + 'static {
        stream::unfold(self, |mut body| async move {
            body.recv().await.map(|chunk| (chunk, body))
        })
    }
}

#[derive(Debug)]
struct StreamEntry {
    sink: mpsc::Sender<BodyChunk>,
    head: Mutex<Option<oneshot::Sender<ResponseMeta>>>,
    abort: Mutex<Option<oneshot::Sender<String>>>,
    cancelled: watch::Sender<bool>,
    bytes_written: AtomicU64,
    expires_at: Instant,
}

/// Arena of in-flight streamed responses with TTL eviction
#[derive(Debug)]
pub struct StreamingTable {
    entries: DashMap<String, Arc<StreamEntry>>,
    ttl: Duration,
}

impl StreamingTable {
    /// Create a table whose entries expire after `ttl`
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Register a stream and return its consumer half
    ///
    /// # Errors
    ///
    /// Returns an error if the id is already registered.
    pub fn begin(&self, streaming_id: &str) -> Result<StreamReceiver> {
        let (sink, body) = mpsc::channel(STREAM_BUFFER_CHUNKS);
        let (head_tx, head) = oneshot::channel();
        let (abort_tx, abort) = oneshot::channel();
        let entry = Arc::new(StreamEntry {
            sink,
            head: Mutex::new(Some(head_tx)),
            abort: Mutex::new(Some(abort_tx)),
            cancelled: watch::Sender::new(false),
            bytes_written: AtomicU64::new(0),
            expires_at: Instant::now() + self.ttl,
        });

        match self.entries.entry(streaming_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(TunnelError::DuplicateStream {
                    streaming_id: streaming_id.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }

        tracing::debug!(streaming_id = %streaming_id, "Stream registered");
        self.update_gauge();
        Ok(StreamReceiver {
            head,
            body: StreamBody {
                chunks: body,
                abort,
                abort_open: true,
                done: false,
            },
        })
    }

    /// Whether a stream is registered
    #[must_use]
    pub fn contains(&self, streaming_id: &str) -> bool {
        self.entries.contains_key(streaming_id)
    }

    fn get(&self, streaming_id: &str) -> Result<Arc<StreamEntry>> {
        self.entries
            .get(streaming_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| TunnelError::unknown_stream(streaming_id))
    }

    /// Deliver status and headers
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is unknown or its head was already set.
    pub fn set_head(&self, streaming_id: &str, meta: ResponseMeta) -> Result<()> {
        let entry = self.get(streaming_id)?;
        let Some(head) = entry.head.lock().take() else {
            return Err(TunnelError::protocol(format!(
                "status already delivered for stream {streaming_id}"
            )));
        };
        if head.send(meta).is_err() {
            self.remove(streaming_id);
            return Err(TunnelError::connection_msg("stream consumer went away"));
        }
        Ok(())
    }

    /// Write a body chunk
    ///
    /// Returns `Ok(true)` if the sink had room, `Ok(false)` if the write had to
    /// wait for the consumer to drain.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is unknown, was destroyed or evicted
    /// while waiting, or its consumer went away.
    pub async fn write(&self, streaming_id: &str, data: Bytes) -> Result<bool> {
        let entry = self.get(streaming_id)?;
        let len = data.len() as u64;

        let (permit, immediate) = match entry.sink.try_reserve() {
            Ok(permit) => (permit, true),
            Err(TrySendError::Full(())) => {
                let mut cancelled = entry.cancelled.subscribe();
                if *cancelled.borrow_and_update() {
                    return Err(TunnelError::unknown_stream(streaming_id));
                }
                let reserved = tokio::select! {
                    reserved = entry.sink.reserve() => reserved,
                    _ = cancelled.changed() => {
                        return Err(TunnelError::unknown_stream(streaming_id));
                    }
                };
                let Ok(permit) = reserved else {
                    self.remove(streaming_id);
                    return Err(TunnelError::connection_msg("stream consumer went away"));
                };
                if !self.contains(streaming_id) {
                    return Err(TunnelError::unknown_stream(streaming_id));
                }
                (permit, false)
            }
            Err(TrySendError::Closed(())) => {
                self.remove(streaming_id);
                return Err(TunnelError::connection_msg("stream consumer went away"));
            }
        };

        permit.send(Ok(data));
        entry.bytes_written.fetch_add(len, Ordering::Relaxed);
        Ok(immediate)
    }

    /// Close a stream normally; returns the number of body bytes written
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is unknown.
    pub fn finish(&self, streaming_id: &str) -> Result<u64> {
        let (_, entry) = self
            .entries
            .remove(streaming_id)
            .ok_or_else(|| TunnelError::unknown_stream(streaming_id))?;
        let bytes = entry.bytes_written.load(Ordering::Relaxed);
        entry.abort.lock().take();

        tracing::debug!(streaming_id = %streaming_id, bytes, "Stream finished");
        if let Some(m) = metrics() {
            m.observe_response_size(bytes, true);
        }
        self.update_gauge();
        Ok(bytes)
    }

    /// Abort a stream; the consumer sees `reason` as a body error
    ///
    /// Returns whether the stream was registered.
    pub fn destroy(&self, streaming_id: &str, reason: &str) -> bool {
        let Some((_, entry)) = self.entries.remove(streaming_id) else {
            return false;
        };
        entry.head.lock().take();
        if let Some(abort) = entry.abort.lock().take() {
            let _ = abort.send(reason.to_string());
        }
        entry.cancelled.send_replace(true);
        tracing::debug!(streaming_id = %streaming_id, reason = %reason, "Stream destroyed");
        // A stream that never completed has no meaningful size
        if let Some(m) = metrics() {
            m.record_unsized_response();
        }
        self.update_gauge();
        true
    }

    /// Evict expired entries; returns how many were evicted
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| (e.key().clone(), e.bytes_written.load(Ordering::Relaxed)))
            .collect();

        let mut evicted = 0;
        for (streaming_id, bytes_written) in expired {
            tracing::warn!(
                streaming_id = %streaming_id,
                bytes_written,
                "Evicting stale stream"
            );
            if self.destroy(&streaming_id, "timeout") {
                evicted += 1;
            }
        }
        evicted
    }

    /// Spawn the periodic sweep; it stops once the table is dropped
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let table = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(table) = table.upgrade() else {
                    break;
                };
                table.sweep();
            }
        })
    }

    /// Number of registered streams
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no streams are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove(&self, streaming_id: &str) {
        if self.entries.remove(streaming_id).is_some() {
            self.update_gauge();
        }
    }

    fn update_gauge(&self) {
        if let Some(m) = metrics() {
            m.set_active_streams(self.entries.len());
        }
    }
}
