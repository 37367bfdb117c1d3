//! Property tests for the rotation-vector/quaternion conversions

use ibex::math::{quat_from_rotation_vector, rotation_vector, Vec3};
use proptest::prelude::*;

proptest! {
    // Round-tripping a rotation vector through quaternion form preserves it
    // to within 1e-4 relative error across the full angle range.
    #[test]
    fn rotation_vector_round_trip(
        magnitude in 1e-3..(std::f64::consts::PI - 1e-7),
        polar in 0.0..std::f64::consts::PI,
        azimuth in 0.0..(2.0 * std::f64::consts::PI),
    ) {
        let direction = Vec3::new(
            polar.sin() * azimuth.cos(),
            polar.sin() * azimuth.sin(),
            polar.cos(),
        );
        let v = direction * magnitude;
        let round_trip = rotation_vector(&quat_from_rotation_vector(&v));
        let error = (round_trip - v).norm();
        prop_assert!(
            error <= 1e-4 * magnitude,
            "round trip error {:.3e} at magnitude {:.3e}",
            error,
            magnitude
        );
    }

    // Tiny rotations survive with small absolute error even where the
    // relative error degrades from cancellation in 1 - w*w.
    #[test]
    fn tiny_rotation_round_trip(
        magnitude in 0.0..1e-3f64,
        x in -1.0..1.0f64,
        y in -1.0..1.0f64,
    ) {
        let z: f64 = (1.0 - (x * x + y * y).min(1.0)).sqrt();
        let v = Vec3::new(x, y, z).normalize() * magnitude;
        let round_trip = rotation_vector(&quat_from_rotation_vector(&v));
        let error = (round_trip - v).norm();
        prop_assert!(error <= 1e-7, "round trip error {:.3e}", error);
    }
}
