//! Perspective camera with a shared six-parameter intrinsic group.
//!
//! Intrinsic layout is `[f, cx, cy, k1, k2, k3]`: one focal length, the
//! principal point, and three radial distortion coefficients applied in
//! normalized image coordinates.

use nalgebra::{Matrix2x3, Matrix2x6, Matrix3, Vector2, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::geometry::{rotate_point_jacobian, Pose};

/// Points closer than this to the image plane are treated as behind the camera.
pub const MIN_DEPTH: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsic {
    pub focal: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
}

impl Intrinsic {
    pub fn new(focal: f64, cx: f64, cy: f64, k1: f64, k2: f64, k3: f64) -> Self {
        Self {
            focal,
            cx,
            cy,
            k1,
            k2,
            k3,
        }
    }

    pub fn pinhole(focal: f64, cx: f64, cy: f64) -> Self {
        Self::new(focal, cx, cy, 0.0, 0.0, 0.0)
    }

    pub fn from_vector(v: &Vector6<f64>) -> Self {
        Self::new(v[0], v[1], v[2], v[3], v[4], v[5])
    }

    pub fn to_vector(&self) -> Vector6<f64> {
        Vector6::new(self.focal, self.cx, self.cy, self.k1, self.k2, self.k3)
    }

    /// Radial factor `1 + k1 r² + k2 r⁴ + k3 r⁶`.
    pub fn radial(&self, r2: f64) -> f64 {
        1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3))
    }

    /// `d(radial)/d(r²)`.
    fn radial_derivative(&self, r2: f64) -> f64 {
        self.k1 + r2 * (2.0 * self.k2 + 3.0 * self.k3 * r2)
    }

    /// Pixel coordinates of a normalized image point.
    pub fn distort(&self, normalized: &Vector2<f64>) -> Vector2<f64> {
        let d = self.radial(normalized.norm_squared());
        Vector2::new(
            self.focal * d * normalized.x + self.cx,
            self.focal * d * normalized.y + self.cy,
        )
    }

    /// `d(pixel)/d(normalized)`.
    pub fn distort_jacobian(&self, normalized: &Vector2<f64>) -> nalgebra::Matrix2<f64> {
        let (x, y) = (normalized.x, normalized.y);
        let r2 = x * x + y * y;
        let d = self.radial(r2);
        let dd = self.radial_derivative(r2);
        let f = self.focal;
        nalgebra::Matrix2::new(
            f * (d + 2.0 * x * x * dd),
            f * 2.0 * x * y * dd,
            f * 2.0 * x * y * dd,
            f * (d + 2.0 * y * y * dd),
        )
    }

    /// `d(pixel)/d[f, cx, cy, k1, k2, k3]` at a normalized image point.
    pub fn parameter_jacobian(&self, normalized: &Vector2<f64>) -> Matrix2x6<f64> {
        let (x, y) = (normalized.x, normalized.y);
        let r2 = x * x + y * y;
        let (r4, r6) = (r2 * r2, r2 * r2 * r2);
        let d = self.radial(r2);
        let (fx, fy) = (self.focal * x, self.focal * y);
        Matrix2x6::new(
            d * x, 1.0, 0.0, fx * r2, fx * r4, fx * r6,
            d * y, 0.0, 1.0, fy * r2, fy * r4, fy * r6,
        )
    }

    pub fn is_finite(&self) -> bool {
        self.to_vector().iter().all(|v| v.is_finite())
    }
}

impl Default for Intrinsic {
    fn default() -> Self {
        Self::pinhole(1.0, 0.0, 0.0)
    }
}

/// Derivatives of a predicted projection.
#[derive(Debug, Clone, Copy)]
pub struct ProjectionJacobian {
    /// With respect to `[ω; t]`.
    pub pose: Matrix2x6<f64>,
    /// With respect to the world point.
    pub point: Matrix2x3<f64>,
    /// With respect to the intrinsic vector `[f, cx, cy, k1, k2, k3]`.
    pub intrinsic: Matrix2x6<f64>,
}

/// Predicted pixel location of `point`, or `None` when it lies behind the camera.
pub fn project(intrinsic: &Intrinsic, pose: &Pose, point: &Vector3<f64>) -> Option<Vector2<f64>> {
    let pc = pose.transform_point(point);
    if pc.z <= MIN_DEPTH {
        return None;
    }
    Some(intrinsic.distort(&Vector2::new(pc.x / pc.z, pc.y / pc.z)))
}

/// Predicted projection together with its analytic pose, point and intrinsic Jacobians.
pub fn project_with_jacobian(
    intrinsic: &Intrinsic,
    pose: &Pose,
    point: &Vector3<f64>,
) -> Option<(Vector2<f64>, ProjectionJacobian)> {
    let rotation = pose.rotation();
    let pc = rotation * point + pose.translation;
    if pc.z <= MIN_DEPTH {
        return None;
    }

    let inv_z = 1.0 / pc.z;
    let normalized = Vector2::new(pc.x * inv_z, pc.y * inv_z);
    let pixel = intrinsic.distort(&normalized);

    let d_normalized = Matrix2x3::new(
        inv_z,
        0.0,
        -pc.x * inv_z * inv_z,
        0.0,
        inv_z,
        -pc.y * inv_z * inv_z,
    );
    let d_camera = intrinsic.distort_jacobian(&normalized) * d_normalized;

    let d_rotation: Matrix3<f64> = rotate_point_jacobian(&pose.angle_axis, point);
    let mut d_pose = Matrix2x6::zeros();
    d_pose
        .fixed_view_mut::<2, 3>(0, 0)
        .copy_from(&(d_camera * d_rotation));
    d_pose.fixed_view_mut::<2, 3>(0, 3).copy_from(&d_camera);

    Some((
        pixel,
        ProjectionJacobian {
            pose: d_pose,
            point: d_camera * rotation,
            intrinsic: intrinsic.parameter_jacobian(&normalized),
        },
    ))
}
