// Spatial primitives: reference frames, geodetic coordinates, pose resolution

mod ellipsoid;
mod graph;
mod transforms;


pub use ellipsoid::Ellipsoid;
pub use graph::{FrameGraph, PoseResolver, StateSerializer};
pub use transforms::{
    east_north_up_to_fixed_frame, inertial_to_fixed, north_east_down_to_fixed_frame,
};

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known coordinate frames
///
/// Encoded on the wire as their integer discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReferenceFrame {
    /// Earth-centered, Earth-fixed
    Fixed = 0,
    /// Earth-centered inertial
    Inertial = 1,
}

impl TryFrom<u8> for ReferenceFrame {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ReferenceFrame::Fixed),
            1 => Ok(ReferenceFrame::Inertial),
            other => Err(format!("unknown reference frame {}", other)),
        }
    }
}

impl Serialize for ReferenceFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for ReferenceFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        ReferenceFrame::try_from(raw).map_err(de::Error::custom)
    }
}

/// Frame a pose is expressed in: a literal frame or another entity by id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameRef {
    Literal(ReferenceFrame),
    Entity(String),
}

impl FrameRef {
    pub fn entity(id: impl Into<String>) -> Self {
        FrameRef::Entity(id.into())
    }

    /// Entity id, if this frame is an entity
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            FrameRef::Entity(id) => Some(id),
            FrameRef::Literal(_) => None,
        }
    }
}

impl From<ReferenceFrame> for FrameRef {
    fn from(frame: ReferenceFrame) -> Self {
        FrameRef::Literal(frame)
    }
}

impl fmt::Display for FrameRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameRef::Literal(ReferenceFrame::Fixed) => write!(f, "FIXED"),
            FrameRef::Literal(ReferenceFrame::Inertial) => write!(f, "INERTIAL"),
            FrameRef::Entity(id) => write!(f, "{}", id),
        }
    }
}

/// Geodetic coordinate: longitude and latitude in radians, height in metres
/// above the ellipsoid
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Cartographic {
    pub longitude: f64,
    pub latitude: f64,
    pub height: f64,
}

impl Cartographic {
    pub fn new(longitude: f64, latitude: f64, height: f64) -> Self {
        Self {
            longitude,
            latitude,
            height,
        }
    }

    pub fn from_degrees(longitude: f64, latitude: f64, height: f64) -> Self {
        Self::new(longitude.to_radians(), latitude.to_radians(), height)
    }

    pub fn longitude_degrees(&self) -> f64 {
        self.longitude.to_degrees()
    }

    pub fn latitude_degrees(&self) -> f64 {
        self.latitude.to_degrees()
    }
}
