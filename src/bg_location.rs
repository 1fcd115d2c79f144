use rand::Rng;
use serde::{Deserialize, Serialize};

/// Mean earth radius, in km.
pub const EARTH_MEAN_RADIUS_KM: f64 = 6371.0087714;

/// Length of one degree of arc on the earth's surface, in km.
pub const DEG_TO_KM: f64 = EARTH_MEAN_RADIUS_KM * std::f64::consts::PI / 180.0;

/// A point on earth in decimal degrees.
#[derive(Copy, Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle distance to `other` in km (Haversine).
    pub fn distance_km_to(&self, other: &Location) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lon = (other.lon - self.lon).to_radians();

        let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        // clamp: rounding can push h marginally above 1 for antipodal points
        let central_angle = 2.0 * h.sqrt().min(1.0).asin();

        central_angle * EARTH_MEAN_RADIUS_KM
    }

    /// The point `distance_km` away from this one when travelling along `bearing_deg`
    /// (0 = north, 90 = east, up to 360).
    pub fn other_in_distance(&self, distance_km: f64, bearing_deg: f64) -> Location {
        let lat1 = self.lat.to_radians();
        let lon1 = self.lon.to_radians();
        let bearing = bearing_deg.to_radians();
        let angular = distance_km / EARTH_MEAN_RADIUS_KM;

        let lat2 = (lat1.sin() * angular.cos() + lat1.cos() * angular.sin() * bearing.cos()).asin();
        let lon2 = lon1
            + (bearing.sin() * angular.sin() * lat1.cos())
                .atan2(angular.cos() - lat1.sin() * lat2.sin());

        Location {
            lat: lat2.to_degrees(),
            lon: normalize_lon(lon2.to_degrees()),
        }
    }

    /// Uniformly distributed random point within `radius_km` of `center`.
    pub fn random_in_circle<R: Rng + ?Sized>(center: &Location, radius_km: f64, rng: &mut R) -> Location {
        let bearing = rng.gen_range(0.0..360.0);
        // sqrt keeps the density uniform over the disc instead of clustering at the center
        let distance = radius_km * rng.gen::<f64>().sqrt();

        center.other_in_distance(distance, bearing)
    }
}

fn normalize_lon(lon: f64) -> f64 {
    let wrapped = (lon + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 && lon > 0.0 {
        180.0
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_distance_between_cities() {
        let berlin = Location::new(52.5200, 13.4050);
        let hamburg = Location::new(53.5511, 9.9937);

        let d = berlin.distance_km_to(&hamburg);
        assert!((d - 255.0).abs() < 2.0, "Berlin-Hamburg was {} km", d);

        // symmetric, and zero to itself
        assert!((hamburg.distance_km_to(&berlin) - d).abs() < 1e-9);
        assert_eq!(berlin.distance_km_to(&berlin), 0.0);
    }

    #[test]
    fn test_one_degree_along_equator() {
        let a = Location::new(0.0, 0.0);
        let b = Location::new(0.0, 1.0);

        assert!((a.distance_km_to(&b) - DEG_TO_KM).abs() < 1e-6);
    }

    #[test]
    fn test_other_in_distance_keeps_distance() {
        let origin = Location::new(30.0, 30.0);

        for bearing in [0.0, 45.0, 90.0, 180.0, 270.0, 359.0] {
            let other = origin.other_in_distance(100.0, bearing);
            let d = origin.distance_km_to(&other);
            assert!((d - 100.0).abs() < 1e-6, "bearing {} gave {} km", bearing, d);
        }

        // north increases latitude, east increases longitude
        assert!(origin.other_in_distance(10.0, 0.0).lat > origin.lat);
        assert!(origin.other_in_distance(10.0, 90.0).lon > origin.lon);
    }

    #[test]
    fn test_other_in_distance_wraps_longitude() {
        let near_dateline = Location::new(0.0, 179.9);
        let other = near_dateline.other_in_distance(50.0, 90.0);

        assert!(other.lon < -179.0 && other.lon >= -180.0, "lon was {}", other.lon);
    }

    #[test]
    fn test_random_in_circle_stays_inside() {
        let mut rng = StdRng::seed_from_u64(7);
        let center = Location::new(30.0, 30.0);
        let radius = 5.0 * DEG_TO_KM;

        for _ in 0..1000 {
            let p = Location::random_in_circle(&center, radius, &mut rng);
            assert!(center.distance_km_to(&p) <= radius + 1e-6);
        }
    }
}
