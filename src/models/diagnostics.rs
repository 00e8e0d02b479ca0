use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

/// Snapshot of the room registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RegistryStats {
    pub n_rooms: u32,
    pub n_sessions: u32,
    pub n_dirty_rooms: u32,
    /// Room count per load state
    pub rooms_by_state: BTreeMap<String, u32>,
}

/// Response for diagnostics information
#[derive(Serialize, Deserialize, ToSchema)]
pub struct DiagnosticsResponse {
    pub registry: RegistryStats,
    pub n_cached_users: u64,
    pub cpu_usage: f32,
    pub memory_alloc: u64,
    pub memory_total: u64,
    pub memory_free: u64,
}
