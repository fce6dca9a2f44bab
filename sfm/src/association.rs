//! Read-only adjacency built once per problem setup.
//!
//! All adjacency lists are sorted by neighbor index, which both enables
//! binary-search lookups and fixes the summation order of every reduction
//! that walks them.

use std::collections::HashMap;

use crate::data_block::ProjectionBlock;
use crate::{Result, SfmError};

/// Bijection between dense local indices and the ids of the external model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexMap {
    origin: Vec<u64>,
    local: HashMap<u64, usize>,
}

impl IndexMap {
    pub fn identity(n: usize) -> Self {
        let origin: Vec<u64> = (0..n as u64).collect();
        let local = origin.iter().map(|&o| (o, o as usize)).collect();
        Self { origin, local }
    }

    pub fn from_origins(kind: &'static str, origin: Vec<u64>) -> Result<Self> {
        let mut local = HashMap::with_capacity(origin.len());
        for (idx, &id) in origin.iter().enumerate() {
            if local.insert(id, idx).is_some() {
                return Err(SfmError::InvalidStructure(format!(
                    "duplicate {kind} id {id}"
                )));
            }
        }
        Ok(Self { origin, local })
    }

    pub fn len(&self) -> usize {
        self.origin.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origin.is_empty()
    }

    pub fn origin(&self, local: usize) -> Option<u64> {
        self.origin.get(local).copied()
    }

    pub fn local(&self, origin: u64) -> Option<usize> {
        self.local.get(&origin).copied()
    }
}

/// Pose/point/projection adjacency, group membership and the camera graph.
#[derive(Debug, Clone, Default)]
pub struct Associations {
    /// Per pose: `(point, projection)` sorted by point.
    pub pose_projections: Vec<Vec<(usize, usize)>>,
    /// Per point: `(pose, projection)` sorted by pose.
    pub point_projections: Vec<Vec<(usize, usize)>>,
    pub pose_group: Vec<usize>,
    pub group_poses: Vec<Vec<usize>>,
    /// Per pose: `(other pose, common points)` sorted by other pose, both directions stored.
    pub common_points: Vec<Vec<(usize, Vec<usize>)>>,
    max_degree: usize,
}

impl Associations {
    /// Validate the problem structure and derive all maps from the projections.
    pub fn build(
        pose_group: &[usize],
        group_num: usize,
        point_num: usize,
        projections: &ProjectionBlock,
    ) -> Result<Self> {
        let pose_num = pose_group.len();

        let mut group_poses = vec![Vec::new(); group_num];
        for (pose, &group) in pose_group.iter().enumerate() {
            if group >= group_num {
                return Err(SfmError::InvalidStructure(format!(
                    "pose {pose} is not assigned to a valid intrinsic group"
                )));
            }
            group_poses[group].push(pose);
        }
        if let Some(empty) = group_poses.iter().position(|p| p.is_empty()) {
            return Err(SfmError::InvalidStructure(format!(
                "intrinsic group {empty} has no poses"
            )));
        }

        let mut pose_projections = vec![Vec::new(); pose_num];
        let mut point_projections = vec![Vec::new(); point_num];
        for proj in 0..projections.len() {
            let (pose, point) = (projections.pose(proj), projections.point(proj));
            if pose >= pose_num {
                return Err(SfmError::IndexOutOfRange {
                    kind: "pose",
                    index: pose,
                    size: pose_num,
                });
            }
            if point >= point_num {
                return Err(SfmError::IndexOutOfRange {
                    kind: "point",
                    index: point,
                    size: point_num,
                });
            }
            pose_projections[pose].push((point, proj));
            point_projections[point].push((pose, proj));
        }

        for (pose, list) in pose_projections.iter_mut().enumerate() {
            list.sort_unstable();
            if let Some(w) = list.windows(2).find(|w| w[0].0 == w[1].0) {
                return Err(SfmError::InvalidStructure(format!(
                    "point {} is observed twice by pose {pose}",
                    w[0].0
                )));
            }
        }
        for list in &mut point_projections {
            list.sort_unstable();
        }

        let mut associations = Self {
            pose_projections,
            point_projections,
            pose_group: pose_group.to_vec(),
            group_poses,
            common_points: Vec::new(),
            max_degree: 0,
        };
        associations.derive_common_points();
        Ok(associations)
    }

    fn derive_common_points(&mut self) {
        let mut pairs: Vec<HashMap<usize, Vec<usize>>> =
            vec![HashMap::new(); self.pose_projections.len()];
        for (point, observers) in self.point_projections.iter().enumerate() {
            for (i, &(a, _)) in observers.iter().enumerate() {
                for &(b, _) in &observers[i + 1..] {
                    pairs[a].entry(b).or_default().push(point);
                    pairs[b].entry(a).or_default().push(point);
                }
            }
        }
        self.common_points = pairs
            .into_iter()
            .map(|map| {
                let mut list: Vec<(usize, Vec<usize>)> = map.into_iter().collect();
                list.sort_unstable_by_key(|(other, _)| *other);
                list
            })
            .collect();
        self.update_degree();
    }

    fn update_degree(&mut self) {
        self.max_degree = self.common_points.iter().map(Vec::len).max().unwrap_or(0);
    }

    /// Replace the common-point list of one pose pair, both directions.
    pub fn set_common_points(&mut self, pose1: usize, pose2: usize, points: &[usize]) -> Result<()> {
        let pose_num = self.pose_num();
        for &pose in &[pose1, pose2] {
            if pose >= pose_num {
                return Err(SfmError::IndexOutOfRange {
                    kind: "pose",
                    index: pose,
                    size: pose_num,
                });
            }
        }
        if pose1 == pose2 {
            return Err(SfmError::InvalidStructure(format!(
                "common points of pose {pose1} with itself"
            )));
        }
        if let Some(&bad) = points.iter().find(|&&p| p >= self.point_num()) {
            return Err(SfmError::IndexOutOfRange {
                kind: "point",
                index: bad,
                size: self.point_num(),
            });
        }

        let mut sorted = points.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        set_sorted_entry(&mut self.common_points[pose1], pose2, sorted.clone());
        set_sorted_entry(&mut self.common_points[pose2], pose1, sorted);
        self.update_degree();
        Ok(())
    }

    pub fn pose_num(&self) -> usize {
        self.pose_projections.len()
    }

    pub fn point_num(&self) -> usize {
        self.point_projections.len()
    }

    pub fn group_num(&self) -> usize {
        self.group_poses.len()
    }

    /// Maximum number of poses any pose shares a point with.
    pub fn max_degree(&self) -> usize {
        self.max_degree
    }

    pub fn projection(&self, pose: usize, point: usize) -> Option<usize> {
        let list = self.pose_projections.get(pose)?;
        list.binary_search_by_key(&point, |&(p, _)| p)
            .ok()
            .map(|i| list[i].1)
    }

    pub fn common_points(&self, pose1: usize, pose2: usize) -> &[usize] {
        self.common_points
            .get(pose1)
            .and_then(|list| {
                list.binary_search_by_key(&pose2, |(other, _)| *other)
                    .ok()
                    .map(|i| list[i].1.as_slice())
            })
            .unwrap_or(&[])
    }
}

fn set_sorted_entry(list: &mut Vec<(usize, Vec<usize>)>, other: usize, points: Vec<usize>) {
    match list.binary_search_by_key(&other, |(o, _)| *o) {
        Ok(i) if points.is_empty() => {
            list.remove(i);
        }
        Ok(i) => list[i].1 = points,
        Err(_) if points.is_empty() => {}
        Err(i) => list.insert(i, (other, points)),
    }
}
