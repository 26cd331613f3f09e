use super::Cartographic;
use nalgebra::Vector3;

/// Reference ellipsoid for geodetic conversions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipsoid {
    radii: Vector3<f64>,
}

impl Ellipsoid {
    /// WGS84 ellipsoid
    pub const WGS84: Ellipsoid = Ellipsoid {
        radii: Vector3::new(6_378_137.0, 6_378_137.0, 6_356_752.314_245_179),
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            radii: Vector3::new(x, y, z),
        }
    }

    pub fn radii(&self) -> Vector3<f64> {
        self.radii
    }

    fn radii_squared(&self) -> Vector3<f64> {
        self.radii.component_mul(&self.radii)
    }

    /// Unit normal to the ellipsoid surface at the given latitude/longitude
    pub fn geodetic_surface_normal_cartographic(&self, cartographic: &Cartographic) -> Vector3<f64> {
        let cos_lat = cartographic.latitude.cos();
        Vector3::new(
            cos_lat * cartographic.longitude.cos(),
            cos_lat * cartographic.longitude.sin(),
            cartographic.latitude.sin(),
        )
        .normalize()
    }

    /// Unit normal to the ellipsoid surface through the given fixed-frame point
    pub fn geodetic_surface_normal(&self, cartesian: &Vector3<f64>) -> Vector3<f64> {
        cartesian
            .component_div(&self.radii_squared())
            .normalize()
    }

    /// Fixed-frame position of a geodetic coordinate
    pub fn cartographic_to_cartesian(&self, cartographic: &Cartographic) -> Vector3<f64> {
        let normal = self.geodetic_surface_normal_cartographic(cartographic);
        let k = self.radii_squared().component_mul(&normal);
        let gamma = normal.dot(&k).sqrt();
        k / gamma + normal * cartographic.height
    }

    /// Geodetic coordinate of a fixed-frame position.
    ///
    /// Uses Bowring's closed form followed by one refinement step, accurate to
    /// well under a millimetre for terrestrial heights. Returns `None` near the
    /// ellipsoid center where latitude is undefined.
    pub fn cartesian_to_cartographic(&self, cartesian: &Vector3<f64>) -> Option<Cartographic> {
        let a = self.radii.x;
        let b = self.radii.z;
        if cartesian.norm() < b * 1e-9 {
            return None;
        }

        let e2 = 1.0 - (b * b) / (a * a);
        let ep2 = (a * a - b * b) / (b * b);
        let p = (cartesian.x * cartesian.x + cartesian.y * cartesian.y).sqrt();
        let longitude = cartesian.y.atan2(cartesian.x);

        let theta = (cartesian.z * a).atan2(p * b);
        let (sin_t, cos_t) = theta.sin_cos();
        let mut latitude = (cartesian.z + ep2 * b * sin_t.powi(3))
            .atan2(p - e2 * a * cos_t.powi(3));

        let prime_vertical = |lat: f64| a / (1.0 - e2 * lat.sin().powi(2)).sqrt();
        let height_at = |lat: f64| {
            let n = prime_vertical(lat);
            let (sin_lat, cos_lat) = lat.sin_cos();
            if cos_lat.abs() > 1e-10 {
                p / cos_lat - n
            } else {
                cartesian.z.abs() / sin_lat.abs() - n * (1.0 - e2)
            }
        };

        let height = height_at(latitude);
        let n = prime_vertical(latitude);
        latitude = cartesian.z.atan2(p * (1.0 - e2 * n / (n + height)));

        Some(Cartographic {
            longitude,
            latitude,
            height: height_at(latitude),
        })
    }
}

impl Default for Ellipsoid {
    fn default() -> Self {
        Self::WGS84
    }
}
