//! Vector and quaternion kernel for the physics core
//!
//! All simulation state uses `nalgebra` vectors and quaternions. The
//! rotation-vector conversions and the align-to-+X routine live here rather
//! than going through `UnitQuaternion` because the integrator needs explicit
//! small-angle branches near zero and near pi where the stock conversions
//! lose precision.

use nalgebra::{Quaternion, Vector3};

/// 3D vector used throughout the engine (meters, newtons, etc. as context demands).
pub type Vec3 = Vector3<f64>;

/// Orientation quaternion. Kept unit length by construction.
pub type Quat = Quaternion<f64>;

/// Rotations below this angle (radians) are treated as zero.
pub const DISCARD_ANGLE_RAD: f64 = 1e-7;

/// Angles below this (radians) take small-angle approximations.
/// Root of atan(t)/t - 1 + 1e-4, keeping the relative error under 1e-4.
pub const SMALL_ANGLE_RAD: f64 = 1.732e-2;

/// Quaternion w above which acos(w) may be replaced by sqrt(2-2w) within 1e-4
/// relative error.
pub const W_THRESH_ACOS2SQRT: f64 = 0.9988;

/// Squared-length form of [`W_THRESH_ACOS2SQRT`]: 1 - w*w at the threshold.
pub const SLTHRESH_ACOS2SQRT: f64 = 2.4e-3;

// f64::EPSILON * 24, the cutoff below which the 4th Taylor term of sin/cos is
// negligible in quat_from_rotation_vector.
const DBL_EPSILON_X24: f64 = 5.328e-15;

/// The identity (no-rotation) quaternion.
#[inline]
pub fn quat_identity() -> Quat {
    Quaternion::new(1.0, 0.0, 0.0, 0.0)
}

/// Rotation angle of a unit quaternion in radians.
#[inline]
pub fn quat_angle(q: &Quat) -> f64 {
    2.0 * q.w.clamp(-1.0, 1.0).acos()
}

/// Builds the quaternion for a rotation vector (axis scaled by angle).
///
/// Uses a 2nd-order Taylor expansion in w and 1st-order in the axis scale when
/// the angle is small enough that the 4th-order term vanishes in f64.
pub fn quat_from_rotation_vector(v: &Vec3) -> Quat {
    let theta = v * 0.5;
    let theta_mag2 = theta.norm_squared();
    let (w, s) = if theta_mag2 * theta_mag2 < DBL_EPSILON_X24 {
        (1.0 - 0.5 * theta_mag2, 1.0 - theta_mag2 / 6.0)
    } else {
        let theta_mag = theta_mag2.sqrt();
        (theta_mag.cos(), theta_mag.sin() / theta_mag)
    };
    Quaternion::new(w, theta.x * s, theta.y * s, theta.z * s)
}

/// Extracts the rotation vector of a unit quaternion.
///
/// Near w = 1 the acos is replaced by sqrt(2 - 2w) to avoid catastrophic
/// cancellation; 1 - w*w is used for the squared axis length because it is
/// less susceptible to w noise than x*x + y*y + z*z.
pub fn rotation_vector(q: &Quat) -> Vec3 {
    if q.w >= 1.0 || q.w <= -1.0 {
        return Vec3::zeros();
    }
    let square_length = 1.0 - q.w * q.w;
    let axis = Vec3::new(q.i, q.j, q.k);
    if square_length < SLTHRESH_ACOS2SQRT {
        axis * (2.0 * ((2.0 - 2.0 * q.w) / square_length).sqrt())
    } else {
        axis * (2.0 * q.w.acos() / square_length.sqrt())
    }
}

/// The minimum rotation mapping `rotate_from` onto the +X axis.
///
/// Specialized for numerical quality: a Taylor branch near zero angle, and an
/// explicit rotation about +Y at (near) 180 degrees where the generic
/// angle-axis construction degenerates.
pub fn quat_from_angle_to_pos_x(rotate_from: &Vec3) -> Quat {
    if *rotate_from == Vec3::zeros() {
        return quat_identity();
    }

    // small angle: w = sqrt(1 - j*j - k*k) ~= 1 + (-j*j - k*k)/2 near zero
    let y_over_x = rotate_from.y / rotate_from.x;
    let z_over_x = rotate_from.z / rotate_from.x;
    if y_over_x < SMALL_ANGLE_RAD
        && y_over_x > -SMALL_ANGLE_RAD
        && z_over_x < SMALL_ANGLE_RAD
        && z_over_x > -SMALL_ANGLE_RAD
        && rotate_from.x > 0.0
    {
        let j = 0.5 * z_over_x;
        let k = -0.5 * y_over_x;
        return Quaternion::new(1.0 + 0.5 * (-j * j - k * k), 0.0, j, k);
    }

    let from_norm = rotate_from.normalize();
    let theta = from_norm.x.clamp(-1.0, 1.0).acos();
    if theta > std::f64::consts::PI - DISCARD_ANGLE_RAD {
        // pointing in -x: rotate 180 degrees about the y axis
        return Quaternion::new(0.0, 0.0, 1.0, 0.0);
    }

    // axis = from x (1,0,0) = (0, z, -y), normalized and rolled into angle-axis
    let axis_mag_inv = 1.0 / (from_norm.z * from_norm.z + from_norm.y * from_norm.y).sqrt();
    let a = 0.5 * theta;
    let s = a.sin();
    Quaternion::new(
        a.cos(),
        0.0,
        from_norm.z * axis_mag_inv * s,
        -from_norm.y * axis_mag_inv * s,
    )
}

/// Rotates vector `f` by unit quaternion `q` (q * f * q').
pub fn rotate_vec(q: &Quat, f: &Vec3) -> Vec3 {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    let tw = f.x * x + f.y * y + f.z * z;
    let tx = f.x * w - f.y * z + f.z * y;
    let ty = f.x * z + f.y * w - f.z * x;
    let tz = -f.x * y + f.y * x + f.z * w;
    Vec3::new(
        w * tx + x * tw + y * tz - z * ty,
        w * ty - x * tz + y * tw + z * tx,
        w * tz + x * ty - y * tx + z * tw,
    )
}

/// Rotates vector `f` by the inverse of unit quaternion `q` (q' * f * q).
pub fn rotate_vec_inv(q: &Quat, f: &Vec3) -> Vec3 {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    let tw = x * f.x + y * f.y + z * f.z;
    let tx = w * f.x - y * f.z + z * f.y;
    let ty = w * f.y + x * f.z - z * f.x;
    let tz = w * f.z - x * f.y + y * f.x;
    Vec3::new(
        tw * x + tx * w + ty * z - tz * y,
        tw * y - tx * z + ty * w + tz * x,
        tw * z + tx * y - ty * x + tz * w,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rotation_vector_round_trip() {
        for &mag in &[1e-5, 1e-3, 0.1, 1.0, 2.0, 3.0] {
            let v = Vec3::new(1.0, -2.0, 0.5).normalize() * mag;
            let rt = rotation_vector(&quat_from_rotation_vector(&v));
            assert_abs_diff_eq!(rt.x, v.x, epsilon = 1e-4 * mag.max(1e-9));
            assert_abs_diff_eq!(rt.y, v.y, epsilon = 1e-4 * mag.max(1e-9));
            assert_abs_diff_eq!(rt.z, v.z, epsilon = 1e-4 * mag.max(1e-9));
        }
    }

    #[test]
    fn zero_rotation_vector_is_identity() {
        let q = quat_from_rotation_vector(&Vec3::zeros());
        assert_abs_diff_eq!(q.w, 1.0, epsilon = 1e-15);
        assert_eq!(rotation_vector(&q), Vec3::zeros());
    }

    #[test]
    fn align_to_pos_x_small_angle() {
        let v = Vec3::new(1.0, 1e-4, -2e-4);
        let q = quat_from_angle_to_pos_x(&v);
        let aligned = rotate_vec(&q, &v);
        assert_abs_diff_eq!(aligned.y, 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(aligned.z, 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(aligned.x, v.norm(), epsilon = 1e-8);
    }

    #[test]
    fn align_to_pos_x_general() {
        let v = Vec3::new(0.3, -0.8, 0.4);
        let q = quat_from_angle_to_pos_x(&v);
        let aligned = rotate_vec(&q, &v);
        assert_abs_diff_eq!(aligned.y, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(aligned.z, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(aligned.x, v.norm(), epsilon = 1e-12);
    }

    #[test]
    fn align_to_pos_x_near_pi() {
        let v = Vec3::new(-1.0, 1e-12, 0.0);
        let q = quat_from_angle_to_pos_x(&v);
        let aligned = rotate_vec(&q, &v);
        assert_abs_diff_eq!(aligned.x, v.norm(), epsilon = 1e-9);
    }

    #[test]
    fn rotate_and_rotate_inv_are_inverses() {
        let q = quat_from_rotation_vector(&Vec3::new(0.4, -0.2, 0.9));
        let f = Vec3::new(1.0, 2.0, 3.0);
        let back = rotate_vec_inv(&q, &rotate_vec(&q, &f));
        assert_abs_diff_eq!(back.x, f.x, epsilon = 1e-12);
        assert_abs_diff_eq!(back.y, f.y, epsilon = 1e-12);
        assert_abs_diff_eq!(back.z, f.z, epsilon = 1e-12);
    }
}
