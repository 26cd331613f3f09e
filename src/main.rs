use anyhow::{Context, Result};
use chrono::Utc;
use nalgebra::{UnitQuaternion, Vector3};
use rand::Rng;
use spatial_sync::config::{apply_env_overrides, load_config, SyncConfig};
use spatial_sync::entity::EntityCollection;
use spatial_sync::session::SessionHub;
use spatial_sync::spatial::{
    east_north_up_to_fixed_frame, Cartographic, Ellipsoid, FrameGraph, FrameRef, ReferenceFrame,
};
use spatial_sync::subscription::{AllowAll, SubscriptionRegistry, SubscriptionTracker};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DRONE_ID: &str = "drone";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spatial_sync=info".into()),
        )
        .init();

    info!("spatial-sync starting...");

    let mut config = match std::env::var("SPATIAL_SYNC_CONFIG") {
        Ok(path) => load_config(&path)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("loading config from {}", path))?,
        Err(_) => SyncConfig::default(),
    };
    apply_env_overrides(&mut config);
    info!(
        origin = %config.registry.origin_entity_id,
        ticks = config.simulation.ticks,
        tick_interval_ms = config.simulation.tick_interval_ms,
        "Configuration loaded"
    );

    // Provider: origin pinned on the ground, a drone hovering above it
    let provider_entities = Arc::new(EntityCollection::new());
    let graph = Arc::new(FrameGraph::new(
        Arc::clone(&provider_entities),
        config.frames.max_depth,
    ));

    let site = Cartographic::from_degrees(-122.4194, 37.7749, 10.0);
    let origin_position = Ellipsoid::WGS84.cartographic_to_cartesian(&site);
    let origin = provider_entities.get_or_create_entity(&config.registry.origin_entity_id);
    origin.set_pose(
        Some(origin_position),
        Some(east_north_up_to_fixed_frame(&origin_position, &Ellipsoid::WGS84)),
        FrameRef::Literal(ReferenceFrame::Fixed),
    );

    let drone = provider_entities.get_or_create_entity(DRONE_ID);
    drone.set_pose(
        Some(Vector3::new(0.0, 0.0, 25.0)),
        Some(UnitQuaternion::identity()),
        FrameRef::entity(origin.id()),
    );

    let hub = SessionHub::new();
    let registry = SubscriptionRegistry::new(
        &hub,
        Arc::clone(&provider_entities),
        graph,
        Arc::new(AllowAll),
        &config.registry,
    );

    // Consumer: its own entity collection, fed by frames from the provider
    let consumer_entities = Arc::new(EntityCollection::new());
    let resolver = Arc::new(FrameGraph::new(
        Arc::clone(&consumer_entities),
        config.frames.max_depth,
    ));
    let session = hub.connect_loopback();
    let tracker = SubscriptionTracker::new(consumer_entities, Arc::clone(&session), resolver);

    let (frame_tx, mut frame_rx) = tokio::sync::mpsc::unbounded_channel();
    tracker.frame_event.add_listener(move |time| {
        let _ = frame_tx.send(*time);
    });

    // The drone is expressed relative to the origin, so the consumer needs both
    tracker
        .subscribe(config.registry.origin_entity_id.as_str(), None, None)
        .await
        .context("subscribing to origin")?;
    let local_drone = tracker
        .subscribe(DRONE_ID, None, None)
        .await
        .context("subscribing to drone")?;

    let mut rng = rand::thread_rng();
    let mut interval = tokio::time::interval(config.simulation.tick_interval());
    let mut offset = Vector3::new(0.0, 0.0, 25.0);

    for frame in 0..config.simulation.ticks {
        interval.tick().await;

        offset += Vector3::new(
            rng.gen_range(-0.5..0.5),
            rng.gen_range(-0.5..0.5),
            rng.gen_range(-0.1..0.1),
        );
        drone.set_pose(
            Some(offset),
            Some(UnitQuaternion::identity()),
            FrameRef::entity(origin.id()),
        );

        let now = Utc::now();
        let sent = registry.publish_frame(now);

        if sent > 0 {
            tokio::time::timeout(Duration::from_secs(1), frame_rx.recv())
                .await
                .context("waiting for frame to reach the consumer")?;
        }

        match tracker.get_cartographic(&local_drone, now) {
            Some(position) => info!(
                frame,
                sent,
                longitude = position.longitude_degrees(),
                latitude = position.latitude_degrees(),
                height = position.height,
                "Drone position"
            ),
            None => warn!(frame, "Drone position not resolvable yet"),
        }
    }

    tracker.unsubscribe(DRONE_ID, None);
    tracker.unsubscribe(config.registry.origin_entity_id.as_str(), None);
    session.close();

    info!(sessions = registry.session_count(), "spatial-sync finished");
    Ok(())
}
