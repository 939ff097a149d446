use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::admin::AdminState;
use crate::pool::OriginSnapshot;

#[derive(Debug, Serialize, Deserialize)]
pub struct SystemStatus {
    pub version: String,
    pub status: String,
    pub uptime_secs: u64,
    pub workers: usize,
    pub origins: usize,
    pub inflight_requests: usize,
    pub brownout: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Brownout {
    pub enabled: bool,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let registry = &state.registry;
    let managers = registry.managers();
    let status = if !managers.is_empty() && managers.iter().all(|m| m.is_shutting_down()) {
        "shutting_down"
    } else {
        "operational"
    };

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: status.to_string(),
        uptime_secs: registry.uptime().as_secs(),
        workers: registry.workers(),
        origins: managers.len(),
        inflight_requests: registry.inflight_requests_count(),
        brownout: registry.brownout().is_active(),
    })
}

pub async fn get_origins(State(state): State<AdminState>) -> Json<Vec<OriginSnapshot>> {
    Json(state.registry.snapshots())
}

pub async fn put_brownout(
    State(state): State<AdminState>,
    Json(request): Json<Brownout>,
) -> Json<Brownout> {
    state.registry.brownout().set(request.enabled);
    Json(Brownout {
        enabled: state.registry.brownout().is_active(),
    })
}
