//! Connection status endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use zbroker_tunnel::{mask_token, ConnectionSummary};

use crate::error::{ApiError, Result};
use crate::state::BrokerState;

/// One client in a token's pool
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientStatus {
    /// Client version reported at identify
    pub version: String,
    /// Filters the client reported, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Value>,
}

/// Body of `GET /connection-status/{token}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Whether any client is connected
    pub ok: bool,
    /// Connected clients, newest first
    pub clients: Vec<ClientStatus>,
}

/// Report the clients connected for a token
pub async fn connection_status(
    State(state): State<BrokerState>,
    Path(token): Path<String>,
) -> Result<Json<ConnectionStatus>> {
    let Some(entries) = state.registry.entries(&token) else {
        tracing::warn!(token = %mask_token(&token), "no matching connection found");
        return Err(ApiError::NoConnection);
    };

    let clients = entries
        .iter()
        .map(|entry| ClientStatus {
            version: entry.version.clone(),
            filters: entry.filters.clone(),
        })
        .collect();

    Ok(Json(ConnectionStatus { ok: true, clients }))
}

/// Summarise every token with live connections
pub async fn connections(State(state): State<BrokerState>) -> Json<Vec<ConnectionSummary>> {
    Json(state.registry.summaries())
}
