use crate::spatial::{FrameRef, ReferenceFrame};
use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::RwLock;

/// Constant position relative to a reference frame
#[derive(Debug)]
pub struct ConstantPositionProperty {
    inner: RwLock<PositionValue>,
}

#[derive(Debug, Clone)]
struct PositionValue {
    value: Option<Vector3<f64>>,
    reference_frame: FrameRef,
}

impl ConstantPositionProperty {
    pub fn new(value: Option<Vector3<f64>>, reference_frame: FrameRef) -> Self {
        Self {
            inner: RwLock::new(PositionValue {
                value,
                reference_frame,
            }),
        }
    }

    pub fn value(&self) -> Option<Vector3<f64>> {
        self.inner.read().value
    }

    pub fn reference_frame(&self) -> FrameRef {
        self.inner.read().reference_frame.clone()
    }

    pub fn is_defined(&self) -> bool {
        self.inner.read().value.is_some()
    }

    pub fn set_value(&self, value: Option<Vector3<f64>>, reference_frame: FrameRef) {
        let mut inner = self.inner.write();
        inner.value = value;
        inner.reference_frame = reference_frame;
    }

    /// Remove the value; the frame falls back to `Fixed`
    pub fn clear(&self) {
        self.set_value(None, FrameRef::Literal(ReferenceFrame::Fixed));
    }
}

/// Constant orientation, interpreted relative to the owning entity's
/// position frame
#[derive(Debug, Default)]
pub struct ConstantOrientationProperty {
    value: RwLock<Option<UnitQuaternion<f64>>>,
}

impl ConstantOrientationProperty {
    pub fn new(value: Option<UnitQuaternion<f64>>) -> Self {
        Self {
            value: RwLock::new(value),
        }
    }

    pub fn value(&self) -> Option<UnitQuaternion<f64>> {
        *self.value.read()
    }

    pub fn is_defined(&self) -> bool {
        self.value.read().is_some()
    }

    pub fn set_value(&self, value: Option<UnitQuaternion<f64>>) {
        *self.value.write() = value;
    }
}
