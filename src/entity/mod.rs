// Entities, their pose properties and the shared entity collection

mod collection;
mod property;
mod state;


pub use collection::EntityCollection;
pub use property::{ConstantOrientationProperty, ConstantPositionProperty};
pub use state::{EntityStateMap, SerializedEntityState};

use crate::spatial::FrameRef;
use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Entity is an identified object with a pose in some reference frame.
///
/// Position and orientation are each either unset (no property) or a
/// constant property whose value may itself be empty. Property objects are
/// shared handles: updating an entity's pose mutates the existing property in
/// place rather than swapping it out.
pub struct Entity {
    /// Unique entity identifier (e.g., "ar.origin", "ar.user")
    id: String,

    /// Optional display name
    name: Option<String>,

    position: RwLock<Option<Arc<ConstantPositionProperty>>>,

    /// Orientation relative to the position's reference frame
    orientation: RwLock<Option<Arc<ConstantOrientationProperty>>>,

    /// Free-form metadata carried alongside the pose
    meta: RwLock<Option<Value>>,
}

impl Entity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            position: RwLock::new(None),
            orientation: RwLock::new(None),
            meta: RwLock::new(None),
        }
    }

    pub fn with_name(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(id)
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn position(&self) -> Option<Arc<ConstantPositionProperty>> {
        self.position.read().clone()
    }

    pub fn set_position(&self, position: Option<Arc<ConstantPositionProperty>>) {
        *self.position.write() = position;
    }

    pub fn orientation(&self) -> Option<Arc<ConstantOrientationProperty>> {
        self.orientation.read().clone()
    }

    pub fn set_orientation(&self, orientation: Option<Arc<ConstantOrientationProperty>>) {
        *self.orientation.write() = orientation;
    }

    pub fn meta(&self) -> Option<Value> {
        self.meta.read().clone()
    }

    pub fn set_meta(&self, meta: Option<Value>) {
        *self.meta.write() = meta;
    }

    /// Current position value and the frame it is expressed in
    pub fn position_value(&self) -> Option<(Vector3<f64>, FrameRef)> {
        let property = self.position()?;
        let value = property.value()?;
        Some((value, property.reference_frame()))
    }

    /// Current orientation value, relative to the position's frame
    pub fn orientation_value(&self) -> Option<UnitQuaternion<f64>> {
        self.orientation()?.value()
    }

    /// Assign a constant pose, reusing existing property objects
    pub fn set_pose(
        &self,
        position: Option<Vector3<f64>>,
        orientation: Option<UnitQuaternion<f64>>,
        frame: FrameRef,
    ) {
        {
            let mut slot = self.position.write();
            match slot.as_ref() {
                Some(property) => property.set_value(position, frame),
                None => *slot = Some(Arc::new(ConstantPositionProperty::new(position, frame))),
            }
        }

        let mut slot = self.orientation.write();
        match slot.as_ref() {
            Some(property) => property.set_value(orientation),
            None => *slot = Some(Arc::new(ConstantOrientationProperty::new(orientation))),
        }
    }

    /// Drop the pose values and metadata, keeping the property objects
    pub fn clear_pose(&self) {
        if let Some(position) = self.position() {
            position.clear();
        }
        if let Some(orientation) = self.orientation() {
            orientation.set_value(None);
        }
        self.set_meta(None);
    }
}

impl AsRef<str> for Entity {
    fn as_ref(&self) -> &str {
        &self.id
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("position", &self.position_value())
            .field("orientation", &self.orientation_value())
            .field("meta", &self.meta())
            .finish()
    }
}
