use super::Ellipsoid;
use chrono::{DateTime, TimeZone, Utc};
use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

const POLE_EPSILON: f64 = 1e-14;

/// Local east/north/up axes at `origin`, expressed in the fixed frame
fn east_north_up_axes(
    origin: &Vector3<f64>,
    ellipsoid: &Ellipsoid,
) -> (Vector3<f64>, Vector3<f64>, Vector3<f64>) {
    if origin.x.abs() < POLE_EPSILON && origin.y.abs() < POLE_EPSILON {
        // Pole: east is undefined, pick the +Y meridian
        let sign = if origin.z < 0.0 { -1.0 } else { 1.0 };
        return (
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(-sign, 0.0, 0.0),
            Vector3::new(0.0, 0.0, sign),
        );
    }

    let up = ellipsoid.geodetic_surface_normal(origin);
    let east = Vector3::new(-origin.y, origin.x, 0.0).normalize();
    let north = up.cross(&east);
    (east, north, up)
}

fn rotation_from_axes(x: Vector3<f64>, y: Vector3<f64>, z: Vector3<f64>) -> UnitQuaternion<f64> {
    let matrix = Matrix3::from_columns(&[x, y, z]);
    UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(matrix))
}

/// Orientation whose local x/y/z axes point east/north/up at `origin`
pub fn east_north_up_to_fixed_frame(
    origin: &Vector3<f64>,
    ellipsoid: &Ellipsoid,
) -> UnitQuaternion<f64> {
    let (east, north, up) = east_north_up_axes(origin, ellipsoid);
    rotation_from_axes(east, north, up)
}

/// Orientation whose local x/y/z axes point north/east/down at `origin`
pub fn north_east_down_to_fixed_frame(
    origin: &Vector3<f64>,
    ellipsoid: &Ellipsoid,
) -> UnitQuaternion<f64> {
    let (east, north, up) = east_north_up_axes(origin, ellipsoid);
    rotation_from_axes(north, east, -up)
}

/// Rotation taking inertial coordinates to fixed coordinates at `time`.
///
/// Earth rotation only (Greenwich mean sidereal time); precession and
/// nutation are ignored.
pub fn inertial_to_fixed(time: DateTime<Utc>) -> UnitQuaternion<f64> {
    let j2000 = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).single();
    let days = match j2000 {
        Some(epoch) => (time - epoch).num_milliseconds() as f64 / 86_400_000.0,
        None => 0.0,
    };
    let gmst_degrees = (280.460_618_37 + 360.985_647_366_29 * days).rem_euclid(360.0);
    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), -gmst_degrees.to_radians())
}
