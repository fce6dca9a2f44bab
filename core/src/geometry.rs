use nalgebra::{Matrix3, Rotation3, Vector3, Vector6};
use serde::{Deserialize, Serialize};

/// Below this angle the closed-form SO(3) expressions switch to their series expansion.
const SMALL_ANGLE: f64 = 1e-5;

/// Camera pose in world-to-camera form: `Xc = R(angle_axis) * X + translation`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub angle_axis: Vector3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(angle_axis: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            angle_axis,
            translation,
        }
    }

    /// Pose from a `[ω; t]` parameter vector.
    pub fn from_vector(params: &Vector6<f64>) -> Self {
        Self {
            angle_axis: params.fixed_rows::<3>(0).into_owned(),
            translation: params.fixed_rows::<3>(3).into_owned(),
        }
    }

    pub fn to_vector(&self) -> Vector6<f64> {
        let mut v = Vector6::zeros();
        v.fixed_rows_mut::<3>(0).copy_from(&self.angle_axis);
        v.fixed_rows_mut::<3>(3).copy_from(&self.translation);
        v
    }

    pub fn rotation(&self) -> Matrix3<f64> {
        angle_axis_to_rotation(&self.angle_axis)
    }

    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation() * point + self.translation
    }

    /// Camera center in world coordinates, `-Rᵀ t`.
    pub fn center(&self) -> Vector3<f64> {
        -(self.rotation().transpose() * self.translation)
    }

    /// Additive update of the six pose parameters.
    pub fn retract(&self, delta: &Vector6<f64>) -> Self {
        Self::from_vector(&(self.to_vector() + delta))
    }

    pub fn is_finite(&self) -> bool {
        self.angle_axis.iter().chain(self.translation.iter()).all(|v| v.is_finite())
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            angle_axis: Vector3::zeros(),
            translation: Vector3::zeros(),
        }
    }
}

pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v[2], v[1], v[2], 0.0, -v[0], -v[1], v[0], 0.0)
}

/// Rodrigues rotation of an axis-angle vector.
pub fn angle_axis_to_rotation(angle_axis: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::new(*angle_axis).into_inner()
}

pub fn rotation_to_angle_axis(rotation: &Matrix3<f64>) -> Vector3<f64> {
    Rotation3::from_matrix(rotation).scaled_axis()
}

/// Right Jacobian of SO(3): `Exp(ω + δ) ≈ Exp(ω) Exp(Jr(ω) δ)`.
pub fn so3_right_jacobian(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta = omega.norm();
    let w = skew_symmetric(omega);
    let w2 = w * w;

    if theta < SMALL_ANGLE {
        return Matrix3::identity() - 0.5 * w + w2 / 6.0;
    }

    let theta2 = theta * theta;
    let a = (1.0 - theta.cos()) / theta2;
    let b = (theta - theta.sin()) / (theta2 * theta);
    Matrix3::identity() - a * w + b * w2
}

/// Derivative of `R(ω) X` with respect to the axis-angle parameters `ω`.
pub fn rotate_point_jacobian(omega: &Vector3<f64>, point: &Vector3<f64>) -> Matrix3<f64> {
    let r = angle_axis_to_rotation(omega);
    -(r * skew_symmetric(point) * so3_right_jacobian(omega))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skew_symmetric_cross_product() {
        let a = Vector3::new(1.0, -2.0, 0.5);
        let b = Vector3::new(0.3, 0.7, -1.1);
        let diff = skew_symmetric(&a) * b - a.cross(&b);
        assert!(diff.norm() < 1e-12);
    }

    #[test]
    fn test_angle_axis_roundtrip() {
        let omega = Vector3::new(0.2, -0.4, 0.1);
        let r = angle_axis_to_rotation(&omega);
        let back = rotation_to_angle_axis(&r);
        assert!((back - omega).norm() < 1e-10);
    }

    #[test]
    fn test_rotate_point_jacobian_matches_finite_difference() {
        let eps = 1e-7;
        for omega in [
            Vector3::new(0.3, -0.2, 0.5),
            Vector3::new(1e-7, 0.0, -2e-7),
            Vector3::new(-1.2, 0.4, 0.9),
        ] {
            let x = Vector3::new(0.5, -1.0, 4.0);
            let analytic = rotate_point_jacobian(&omega, &x);

            for k in 0..3 {
                let mut plus = omega;
                let mut minus = omega;
                plus[k] += eps;
                minus[k] -= eps;
                let numeric = (angle_axis_to_rotation(&plus) * x
                    - angle_axis_to_rotation(&minus) * x)
                    / (2.0 * eps);
                assert!((analytic.column(k) - numeric).norm() < 1e-6);
            }
        }
    }

    #[test]
    fn test_pose_center() {
        let pose = Pose::new(Vector3::new(0.0, 0.3, 0.0), Vector3::new(1.0, 2.0, 3.0));
        let c = pose.center();
        assert!(pose.transform_point(&c).norm() < 1e-12);
    }

    #[test]
    fn test_pose_vector_roundtrip() {
        let pose = Pose::new(Vector3::new(0.1, 0.2, 0.3), Vector3::new(-1.0, 0.0, 5.0));
        assert_eq!(Pose::from_vector(&pose.to_vector()), pose);
        let moved = pose.retract(&Vector6::new(0.0, 0.0, 0.0, 1.0, 1.0, 1.0));
        assert!((moved.translation - Vector3::new(0.0, 1.0, 6.0)).norm() < 1e-12);
    }
}
