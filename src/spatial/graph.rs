use super::{inertial_to_fixed, FrameRef, ReferenceFrame};
use crate::entity::{Entity, EntityCollection, SerializedEntityState};
use chrono::{DateTime, Utc};
use nalgebra::{UnitQuaternion, Vector3};
use std::sync::Arc;

/// Resolves an entity's pose in an arbitrary reference frame
pub trait PoseResolver: Send + Sync {
    fn position_in_frame(
        &self,
        entity: &Entity,
        time: DateTime<Utc>,
        frame: &FrameRef,
    ) -> Option<Vector3<f64>>;

    fn orientation_in_frame(
        &self,
        entity: &Entity,
        time: DateTime<Utc>,
        frame: &FrameRef,
    ) -> Option<UnitQuaternion<f64>>;
}

/// Produces the wire snapshot of an entity relative to a frame
pub trait StateSerializer: Send + Sync {
    /// `None` when the entity's position cannot be resolved in `frame`
    fn serialize_entity_state(
        &self,
        entity: &Entity,
        time: DateTime<Utc>,
        frame: &FrameRef,
    ) -> Option<SerializedEntityState>;
}

/// Pose of an entity expressed in the fixed frame
struct FixedPose {
    position: Vector3<f64>,
    orientation: Option<UnitQuaternion<f64>>,
}

/// Frame-chain resolver over constant entity poses.
///
/// Each entity's pose is relative to its position's reference frame, which
/// is either a literal frame or another entity. Poses are composed up to the
/// fixed frame; a missing value or orientation anywhere along the chain, an
/// unknown frame entity, or a chain deeper than `max_depth` (cycles included)
/// makes the result `None`.
pub struct FrameGraph {
    entities: Arc<EntityCollection>,
    max_depth: usize,
}

impl FrameGraph {
    pub fn new(entities: Arc<EntityCollection>, max_depth: usize) -> Self {
        Self {
            entities,
            max_depth,
        }
    }

    pub fn entities(&self) -> &Arc<EntityCollection> {
        &self.entities
    }

    fn pose_in_fixed(&self, entity: &Entity, time: DateTime<Utc>, depth: usize) -> Option<FixedPose> {
        let (position, frame) = entity.position_value()?;
        let orientation = entity.orientation_value();

        match frame {
            FrameRef::Literal(ReferenceFrame::Fixed) => Some(FixedPose {
                position,
                orientation,
            }),
            FrameRef::Literal(ReferenceFrame::Inertial) => {
                let rotation = inertial_to_fixed(time);
                Some(FixedPose {
                    position: rotation * position,
                    orientation: orientation.map(|o| rotation * o),
                })
            }
            FrameRef::Entity(parent_id) => {
                let parent = self.frame_pose(&parent_id, time, depth)?;
                let parent_orientation = parent.orientation?;
                Some(FixedPose {
                    position: parent.position + parent_orientation * position,
                    orientation: orientation.map(|o| parent_orientation * o),
                })
            }
        }
    }

    fn frame_pose(&self, id: &str, time: DateTime<Utc>, depth: usize) -> Option<FixedPose> {
        if depth >= self.max_depth {
            return None;
        }
        let entity = self.entities.get_by_id(id)?;
        self.pose_in_fixed(&entity, time, depth + 1)
    }

    /// Rotation and origin of `frame` expressed in the fixed frame
    fn frame_transform(
        &self,
        frame: &FrameRef,
        time: DateTime<Utc>,
    ) -> Option<(Vector3<f64>, UnitQuaternion<f64>)> {
        match frame {
            FrameRef::Literal(ReferenceFrame::Fixed) => {
                Some((Vector3::zeros(), UnitQuaternion::identity()))
            }
            FrameRef::Literal(ReferenceFrame::Inertial) => {
                Some((Vector3::zeros(), inertial_to_fixed(time)))
            }
            FrameRef::Entity(id) => {
                let pose = self.frame_pose(id, time, 0)?;
                Some((pose.position, pose.orientation?))
            }
        }
    }
}

impl PoseResolver for FrameGraph {
    fn position_in_frame(
        &self,
        entity: &Entity,
        time: DateTime<Utc>,
        frame: &FrameRef,
    ) -> Option<Vector3<f64>> {
        let (local, own_frame) = entity.position_value()?;
        if &own_frame == frame {
            return Some(local);
        }

        let pose = self.pose_in_fixed(entity, time, 0)?;
        let (origin, rotation) = self.frame_transform(frame, time)?;
        Some(rotation.inverse() * (pose.position - origin))
    }

    fn orientation_in_frame(
        &self,
        entity: &Entity,
        time: DateTime<Utc>,
        frame: &FrameRef,
    ) -> Option<UnitQuaternion<f64>> {
        let (_, own_frame) = entity.position_value()?;
        if &own_frame == frame {
            return entity.orientation_value();
        }

        let pose = self.pose_in_fixed(entity, time, 0)?;
        let (_, rotation) = self.frame_transform(frame, time)?;
        Some(rotation.inverse() * pose.orientation?)
    }
}

impl StateSerializer for FrameGraph {
    fn serialize_entity_state(
        &self,
        entity: &Entity,
        time: DateTime<Utc>,
        frame: &FrameRef,
    ) -> Option<SerializedEntityState> {
        let position = self.position_in_frame(entity, time, frame)?;
        Some(SerializedEntityState {
            position,
            orientation: self.orientation_in_frame(entity, time, frame),
            reference_frame: frame.clone(),
            meta: entity.meta(),
        })
    }
}
