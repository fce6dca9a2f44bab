//! Flat, index-addressed parameter storage.
//!
//! Every block is a single contiguous `Vec<f64>` with a fixed stride per
//! entry. Indices are local problem indices; bounds are checked by the
//! problem, so out-of-range access here panics like slice indexing does.

use nalgebra::{Vector2, Vector3, Vector6};
use sba_core::{Intrinsic, Pose};

pub const POSE_STRIDE: usize = 6;
pub const POINT_STRIDE: usize = 3;
pub const INTRINSIC_STRIDE: usize = 6;

/// Marker for a projection slot that has not been assigned yet.
pub const UNASSIGNED: usize = usize::MAX;

/// `[ω; t]` per pose.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoseBlock {
    data: Vec<f64>,
}

impl PoseBlock {
    pub fn new(pose_num: usize) -> Self {
        Self {
            data: vec![0.0; pose_num * POSE_STRIDE],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len() / POSE_STRIDE
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, idx: usize) -> Pose {
        Pose::from_vector(&self.vector(idx))
    }

    pub fn set(&mut self, idx: usize, pose: &Pose) {
        self.set_vector(idx, &pose.to_vector());
    }

    pub fn vector(&self, idx: usize) -> Vector6<f64> {
        let start = idx * POSE_STRIDE;
        Vector6::from_column_slice(&self.data[start..start + POSE_STRIDE])
    }

    pub fn set_vector(&mut self, idx: usize, v: &Vector6<f64>) {
        let start = idx * POSE_STRIDE;
        self.data[start..start + POSE_STRIDE].copy_from_slice(v.as_slice());
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}

/// Position and display color per point. Colors never enter the optimization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointBlock {
    positions: Vec<f64>,
    colors: Vec<f64>,
}

impl PointBlock {
    pub fn new(point_num: usize) -> Self {
        Self {
            positions: vec![0.0; point_num * POINT_STRIDE],
            colors: vec![0.0; point_num * POINT_STRIDE],
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len() / POINT_STRIDE
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn get(&self, idx: usize) -> Vector3<f64> {
        let start = idx * POINT_STRIDE;
        Vector3::from_column_slice(&self.positions[start..start + POINT_STRIDE])
    }

    pub fn set(&mut self, idx: usize, point: &Vector3<f64>) {
        let start = idx * POINT_STRIDE;
        self.positions[start..start + POINT_STRIDE].copy_from_slice(point.as_slice());
    }

    pub fn color(&self, idx: usize) -> Vector3<f64> {
        let start = idx * POINT_STRIDE;
        Vector3::from_column_slice(&self.colors[start..start + POINT_STRIDE])
    }

    pub fn set_color(&mut self, idx: usize, color: &Vector3<f64>) {
        let start = idx * POINT_STRIDE;
        self.colors[start..start + POINT_STRIDE].copy_from_slice(color.as_slice());
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.positions
    }
}

/// `[f, cx, cy, k1, k2, k3]` per intrinsic group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntrinsicBlock {
    data: Vec<f64>,
}

impl IntrinsicBlock {
    pub fn new(group_num: usize) -> Self {
        let mut block = Self {
            data: vec![0.0; group_num * INTRINSIC_STRIDE],
        };
        for g in 0..group_num {
            block.set(g, &Intrinsic::default());
        }
        block
    }

    pub fn len(&self) -> usize {
        self.data.len() / INTRINSIC_STRIDE
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, idx: usize) -> Intrinsic {
        let start = idx * INTRINSIC_STRIDE;
        Intrinsic::from_vector(&Vector6::from_column_slice(
            &self.data[start..start + INTRINSIC_STRIDE],
        ))
    }

    pub fn set(&mut self, idx: usize, intrinsic: &Intrinsic) {
        let start = idx * INTRINSIC_STRIDE;
        self.data[start..start + INTRINSIC_STRIDE]
            .copy_from_slice(intrinsic.to_vector().as_slice());
    }
}

/// Observations, each tied to one pose and one point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectionBlock {
    pose_index: Vec<usize>,
    point_index: Vec<usize>,
    observations: Vec<f64>,
}

impl ProjectionBlock {
    pub fn new(projection_num: usize) -> Self {
        Self {
            pose_index: vec![UNASSIGNED; projection_num],
            point_index: vec![UNASSIGNED; projection_num],
            observations: vec![0.0; projection_num * 2],
        }
    }

    pub fn len(&self) -> usize {
        self.pose_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pose_index.is_empty()
    }

    pub fn pose(&self, idx: usize) -> usize {
        self.pose_index[idx]
    }

    pub fn point(&self, idx: usize) -> usize {
        self.point_index[idx]
    }

    pub fn observation(&self, idx: usize) -> Vector2<f64> {
        Vector2::new(self.observations[2 * idx], self.observations[2 * idx + 1])
    }

    pub fn set(&mut self, idx: usize, pose: usize, point: usize, observation: &Vector2<f64>) {
        self.pose_index[idx] = pose;
        self.point_index[idx] = point;
        self.observations[2 * idx] = observation.x;
        self.observations[2 * idx + 1] = observation.y;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pose_block_layout() {
        let mut block = PoseBlock::new(2);
        let pose = Pose::new(Vector3::new(0.1, 0.2, 0.3), Vector3::new(1.0, 2.0, 3.0));
        block.set(1, &pose);
        assert_eq!(block.len(), 2);
        assert_eq!(&block.as_slice()[6..], &[0.1, 0.2, 0.3, 1.0, 2.0, 3.0]);
        assert_eq!(block.get(1), pose);
        assert_eq!(block.get(0), Pose::default());
    }

    #[test]
    fn test_point_colors_are_separate() {
        let mut block = PointBlock::new(1);
        block.set(0, &Vector3::new(1.0, 2.0, 3.0));
        block.set_color(0, &Vector3::new(255.0, 0.0, 0.0));
        assert_eq!(block.as_slice(), &[1.0, 2.0, 3.0]);
        assert_eq!(block.color(0).x, 255.0);
    }

    #[test]
    fn test_new_projections_are_unassigned() {
        let mut block = ProjectionBlock::new(2);
        assert_eq!(block.pose(0), UNASSIGNED);
        block.set(1, 3, 4, &Vector2::new(10.0, 20.0));
        assert_eq!((block.pose(1), block.point(1)), (3, 4));
        assert_eq!(block.observation(1), Vector2::new(10.0, 20.0));
    }

    #[test]
    fn test_intrinsic_block_defaults() {
        let mut block = IntrinsicBlock::new(2);
        assert_eq!(block.get(0), Intrinsic::default());
        let k = Intrinsic::new(500.0, 320.0, 240.0, 0.1, 0.0, 0.0);
        block.set(1, &k);
        assert_eq!(block.get(1), k);
    }
}
