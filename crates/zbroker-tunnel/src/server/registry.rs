//! Connection registry
//!
//! The [`ConnectionRegistry`] tracks every live tunnel endpoint per broker
//! token. Each token owns a pool of [`ConnectionEntry`] values, newest first;
//! the pool is deleted as soon as its last entry deregisters.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;
use zbroker_observability::metrics;

use crate::protocol::{ClientMetadata, ConnectionRole, Message, RequestPayload, ResponsePayload};
use crate::token::{hash_token, mask_token, normalize_token};
use crate::{Result, TunnelError};

// =============================================================================
// Connection Entry
// =============================================================================

/// One identified tunnel endpoint
#[derive(Debug)]
pub struct ConnectionEntry {
    /// Server-assigned connection id
    pub id: Uuid,
    /// Client-reported id, stable across reconnects
    pub client_id: String,
    /// HA role
    pub role: ConnectionRole,
    /// Client version
    pub version: String,
    /// Capabilities the client announced
    pub capabilities: Vec<String>,
    /// Connection type selecting a per-type ruleset
    pub connection_type: Option<String>,
    /// The client's own accept rules, as reported
    pub filters: Option<serde_json::Value>,
    /// When the connection identified
    pub connected_at: Instant,

    tx: mpsc::Sender<Message>,
    pending: DashMap<Uuid, oneshot::Sender<ResponsePayload>>,
}

impl ConnectionEntry {
    /// Create an entry from identify metadata and the connection's outbound channel
    #[must_use]
    pub fn new(metadata: ClientMetadata, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id: metadata.client_id,
            role: metadata.role,
            version: metadata.version,
            capabilities: metadata.capabilities,
            connection_type: metadata.connection_type,
            filters: metadata.filters,
            connected_at: Instant::now(),
            tx,
            pending: DashMap::new(),
        }
    }

    /// Whether the client announced a capability
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Send a message to the client
    ///
    /// # Errors
    ///
    /// Returns an error if the connection has closed.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TunnelError::connection_msg("tunnel connection closed"))
    }

    /// Try to send a message without waiting for channel capacity
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is full or closed.
    pub fn try_send(&self, message: Message) -> Result<()> {
        self.tx
            .try_send(message)
            .map_err(|e| TunnelError::connection_msg(format!("failed to send to tunnel: {e}")))
    }

    /// Send a request expecting an inline `response`
    ///
    /// The returned receiver completes when the matching `response` arrives,
    /// and errors if the connection closes first.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection has closed.
    pub async fn request(
        &self,
        payload: RequestPayload,
    ) -> Result<oneshot::Receiver<ResponsePayload>> {
        let request_id = payload.request_id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        if let Err(e) = self.send(Message::Request(payload)).await {
            self.pending.remove(&request_id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Complete a pending inline request; returns whether a waiter received it
    pub fn complete(&self, response: ResponsePayload) -> bool {
        match self.pending.remove(&response.request_id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Forget a pending request (its waiter gave up)
    pub fn cancel(&self, request_id: &Uuid) {
        self.pending.remove(request_id);
    }

    /// Drop every pending request so their waiters fail
    pub fn fail_pending(&self) {
        self.pending.clear();
    }

    /// Number of inline requests awaiting a response
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

// =============================================================================
// Selection
// =============================================================================

/// How to pick an entry from a token's pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// The most recently registered entry
    #[default]
    Newest,
    /// The newest primary entry, else the newest of any role
    PreferPrimary,
}

/// Per-token view for `/connections`
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    /// SHA256 of the token
    pub hashed_identifier: String,
    /// Masked token
    pub masked_identifier: String,
    /// Client versions in the pool
    pub versions: Vec<String>,
    /// Client ids in the pool
    pub client_ids: Vec<String>,
    /// Roles in the pool
    pub roles: Vec<ConnectionRole>,
}

// =============================================================================
// Connection Registry
// =============================================================================

/// Registry of live tunnel connections keyed by normalized token
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    pools: DashMap<String, Vec<Arc<ConnectionEntry>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry under a token
    ///
    /// An entry with the same non-empty `client_id` and `role` is replaced in
    /// place and told to disconnect; otherwise the entry is prepended.
    pub fn register(&self, token: &str, entry: ConnectionEntry) -> Arc<ConnectionEntry> {
        let entry = Arc::new(entry);
        let replaced = {
            let mut pool = self.pools.entry(normalize_token(token)).or_default();
            let existing = pool.iter().position(|e| {
                !entry.client_id.is_empty()
                    && e.client_id == entry.client_id
                    && e.role == entry.role
            });
            match existing {
                Some(index) => Some(std::mem::replace(&mut pool[index], Arc::clone(&entry))),
                None => {
                    pool.insert(0, Arc::clone(&entry));
                    None
                }
            }
        };

        if let Some(old) = replaced {
            tracing::info!(
                token = %mask_token(token),
                client_id = %old.client_id,
                old_connection = %old.id,
                new_connection = %entry.id,
                "Replacing existing connection"
            );
            let _ = old.try_send(Message::Disconnect {
                reason: "replaced by a newer connection".to_string(),
            });
            old.fail_pending();
        }

        tracing::info!(
            token = %mask_token(token),
            connection_id = %entry.id,
            client_id = %entry.client_id,
            role = %entry.role,
            version = %entry.version,
            "Connection registered"
        );
        self.update_gauge();
        entry
    }

    /// Remove an entry; the pool is deleted once empty
    ///
    /// Returns whether the entry was present.
    pub fn deregister(&self, token: &str, connection_id: Uuid) -> bool {
        let key = normalize_token(token);
        let removed = {
            let Some(mut pool) = self.pools.get_mut(&key) else {
                return false;
            };
            let before = pool.len();
            pool.retain(|e| e.id != connection_id);
            before != pool.len()
        };
        self.pools.remove_if(&key, |_, pool| pool.is_empty());

        if removed {
            tracing::info!(
                token = %mask_token(token),
                connection_id = %connection_id,
                "Connection deregistered"
            );
            self.update_gauge();
        }
        removed
    }

    /// Pick an entry for a token
    #[must_use]
    pub fn select(&self, token: &str, policy: SelectionPolicy) -> Option<Arc<ConnectionEntry>> {
        let pool = self.pools.get(&normalize_token(token))?;
        let chosen = match policy {
            SelectionPolicy::Newest => pool.first(),
            SelectionPolicy::PreferPrimary => pool
                .iter()
                .find(|e| e.role == ConnectionRole::Primary)
                .or_else(|| pool.first()),
        };
        chosen.cloned()
    }

    /// Whether a token has at least one live connection
    #[must_use]
    pub fn has_live_connection(&self, token: &str) -> bool {
        self.pools
            .get(&normalize_token(token))
            .is_some_and(|pool| !pool.is_empty())
    }

    /// All entries for a token, newest first
    #[must_use]
    pub fn entries(&self, token: &str) -> Option<Vec<Arc<ConnectionEntry>>> {
        self.pools
            .get(&normalize_token(token))
            .map(|pool| pool.value().clone())
    }

    /// Per-token summaries without raw tokens
    #[must_use]
    pub fn summaries(&self) -> Vec<ConnectionSummary> {
        let mut summaries: Vec<ConnectionSummary> = self
            .pools
            .iter()
            .map(|pool| {
                let entries = pool.value();
                ConnectionSummary {
                    hashed_identifier: hash_token(pool.key()),
                    masked_identifier: mask_token(pool.key()),
                    versions: entries.iter().map(|e| e.version.clone()).collect(),
                    client_ids: entries.iter().map(|e| e.client_id.clone()).collect(),
                    roles: entries.iter().map(|e| e.role).collect(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.hashed_identifier.cmp(&b.hashed_identifier));
        summaries
    }

    /// Number of tokens with a pool
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.pools.len()
    }

    /// Number of live connections across all tokens
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.pools.iter().map(|pool| pool.value().len()).sum()
    }

    fn update_gauge(&self) {
        if let Some(m) = metrics() {
            m.set_active_connections(self.connection_count());
        }
    }
}
