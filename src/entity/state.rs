use crate::spatial::FrameRef;
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Wire snapshot of an entity's pose at one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedEntityState {
    /// Position in `reference_frame`
    #[serde(rename = "p")]
    pub position: Vector3<f64>,

    /// Orientation relative to `reference_frame`, if known
    #[serde(rename = "o", default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<UnitQuaternion<f64>>,

    /// Literal frame (integer) or entity id (string)
    #[serde(rename = "r")]
    pub reference_frame: FrameRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Per-subscriber frame payload: entity id -> state, `None` when the entity
/// is unknown or has no resolvable pose
pub type EntityStateMap = HashMap<String, Option<SerializedEntityState>>;
