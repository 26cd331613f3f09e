use super::SyncConfig;

/// Override file/default values from env vars. Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut SyncConfig) {
    if let Ok(v) = std::env::var("SPATIAL_SYNC_ORIGIN_ENTITY_ID") {
        if !v.is_empty() {
            cfg.registry.origin_entity_id = v;
        }
    }
    if let Ok(v) = std::env::var("SPATIAL_SYNC_CACHE_TIME_EPSILON_SECONDS") {
        if let Ok(n) = v.parse::<f64>() {
            cfg.registry.cache_time_epsilon_seconds = n;
        }
    }
    if let Ok(v) = std::env::var("SPATIAL_SYNC_MAX_FRAME_DEPTH") {
        if let Ok(n) = v.parse::<usize>() {
            cfg.frames.max_depth = n;
        }
    }
    if let Ok(v) = std::env::var("SPATIAL_SYNC_TICK_INTERVAL_MS") {
        if let Ok(n) = v.parse::<u64>() {
            cfg.simulation.tick_interval_ms = n;
        }
    }
    if let Ok(v) = std::env::var("SPATIAL_SYNC_TICKS") {
        if let Ok(n) = v.parse::<u64>() {
            cfg.simulation.ticks = n;
        }
    }
}
