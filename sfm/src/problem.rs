use std::path::{Path, PathBuf};
use std::sync::Arc;

use nalgebra::{Vector2, Vector3};
use sba_core::{Intrinsic, Pose};
use sba_optimize::LinearSolverType;
use sba_runtime::ResourceGroup;

use crate::association::{Associations, IndexMap};
use crate::bundle_adjustment::{self, BundleAdjustmentConfig, SolveSummary};
use crate::bundle_block::BundleBlock;
use crate::data_block::{IntrinsicBlock, PointBlock, PoseBlock, ProjectionBlock, UNASSIGNED};
use crate::evaluator::{Evaluator, ReprojectionStats, Residuals};
use crate::report::{self, ProblemSize};
use crate::strategy::{SchurStrategy, StandardSchur};
use crate::{Result, SfmError};

/// A bundle adjustment problem: parameter blocks, their associations and a
/// dedicated worker pool.
///
/// Sizes change only through [`create`](Self::create) or
/// [`initialize`](Self::initialize). Mutating the structure (projections,
/// group membership) drops the associations, which are rebuilt on the next
/// solve.
pub struct BaProblem {
    config: BundleAdjustmentConfig,
    pub(crate) group: Arc<ResourceGroup>,
    pub(crate) poses: PoseBlock,
    pub(crate) points: PointBlock,
    intrinsics: IntrinsicBlock,
    projections: ProjectionBlock,
    pose_group: Vec<usize>,
    common_point_overrides: Vec<(usize, usize, Vec<usize>)>,
    pub(crate) associations: Option<Associations>,
    pose_ids: IndexMap,
    point_ids: IndexMap,
    group_ids: IndexMap,
    residuals: Option<Residuals>,
    last_summary: Option<SolveSummary>,
}

impl BaProblem {
    pub fn new(config: BundleAdjustmentConfig) -> Result<Self> {
        config.validate()?;
        let group = ResourceGroup::from_config("ba", &config.threads)?;
        Ok(Self {
            config,
            group: Arc::new(group),
            poses: PoseBlock::default(),
            points: PointBlock::default(),
            intrinsics: IntrinsicBlock::default(),
            projections: ProjectionBlock::default(),
            pose_group: Vec::new(),
            common_point_overrides: Vec::new(),
            associations: None,
            pose_ids: IndexMap::default(),
            point_ids: IndexMap::default(),
            group_ids: IndexMap::default(),
            residuals: None,
            last_summary: None,
        })
    }

    pub fn with_size(
        config: BundleAdjustmentConfig,
        pose_num: usize,
        group_num: usize,
        point_num: usize,
        projection_num: usize,
    ) -> Result<Self> {
        let mut problem = Self::new(config)?;
        problem.create(pose_num, group_num, point_num, projection_num);
        Ok(problem)
    }

    /// Allocate zeroed storage. Every pose must then be assigned a group and
    /// every projection set before solving.
    pub fn create(&mut self, pose_num: usize, group_num: usize, point_num: usize, projection_num: usize) {
        self.poses = PoseBlock::new(pose_num);
        self.points = PointBlock::new(point_num);
        self.intrinsics = IntrinsicBlock::new(group_num);
        self.projections = ProjectionBlock::new(projection_num);
        self.pose_group = vec![UNASSIGNED; pose_num];
        self.common_point_overrides.clear();
        self.associations = None;
        self.pose_ids = IndexMap::identity(pose_num);
        self.point_ids = IndexMap::identity(point_num);
        self.group_ids = IndexMap::identity(group_num);
        self.residuals = None;
        self.last_summary = None;
    }

    pub fn initialize(&mut self, block: &BundleBlock) -> Result<()> {
        let cameras: Vec<u64> = block.cameras.iter().map(|c| c.id).collect();
        self.initialize_subset(block, &cameras)
    }

    /// Build a problem over the given cameras only. Tracks without a view in
    /// the subset are left out, as are their views in other cameras.
    pub fn initialize_subset(&mut self, block: &BundleBlock, camera_ids: &[u64]) -> Result<()> {
        let pose_ids = IndexMap::from_origins("camera", camera_ids.to_vec())?;
        let mut cameras = Vec::with_capacity(camera_ids.len());
        for &id in camera_ids {
            let camera = block
                .camera(id)
                .ok_or_else(|| SfmError::InvalidStructure(format!("unknown camera id {id}")))?;
            cameras.push(camera);
        }

        let used_groups: Vec<u64> = block
            .groups
            .iter()
            .map(|g| g.id)
            .filter(|id| cameras.iter().any(|c| c.group_id == *id))
            .collect();
        let group_ids = IndexMap::from_origins("group", used_groups)?;

        let tracks: Vec<_> = block
            .tracks
            .iter()
            .filter(|t| t.views.iter().any(|v| pose_ids.local(v.camera_id).is_some()))
            .collect();
        let point_ids = IndexMap::from_origins("track", tracks.iter().map(|t| t.id).collect())?;
        let projection_num = tracks
            .iter()
            .flat_map(|t| &t.views)
            .filter(|v| pose_ids.local(v.camera_id).is_some())
            .count();

        self.create(cameras.len(), group_ids.len(), tracks.len(), projection_num);

        for (pose, camera) in cameras.iter().enumerate() {
            let group = group_ids.local(camera.group_id).ok_or_else(|| {
                SfmError::InvalidStructure(format!(
                    "camera {} references unknown group {}",
                    camera.id, camera.group_id
                ))
            })?;
            self.poses.set(pose, &camera.pose);
            self.pose_group[pose] = group;
        }
        for g in &block.groups {
            if let Some(group) = group_ids.local(g.id) {
                self.intrinsics.set(group, &g.intrinsic);
            }
        }

        let mut proj = 0;
        for (point, track) in tracks.iter().enumerate() {
            self.points.set(point, &track.position);
            self.points.set_color(point, &track.color);
            for view in &track.views {
                if let Some(pose) = pose_ids.local(view.camera_id) {
                    self.projections.set(proj, pose, point, &view.observation);
                    proj += 1;
                }
            }
        }

        for ((a, b), shared) in block.common_tracks() {
            if let (Some(pa), Some(pb)) = (pose_ids.local(a), pose_ids.local(b)) {
                let points: Vec<usize> = shared.iter().filter_map(|&t| point_ids.local(t)).collect();
                self.common_point_overrides.push((pa, pb, points));
            }
        }

        self.pose_ids = pose_ids;
        self.point_ids = point_ids;
        self.group_ids = group_ids;
        self.build_associations()?;

        tracing::info!(
            poses = self.pose_num(),
            points = self.point_num(),
            groups = self.group_num(),
            projections = self.projection_num(),
            max_degree = self.max_degree(),
            "initialized bundle adjustment problem"
        );
        Ok(())
    }

    pub fn build_associations(&mut self) -> Result<()> {
        let mut associations = Associations::build(
            &self.pose_group,
            self.intrinsics.len(),
            self.points.len(),
            &self.projections,
        )?;
        for (a, b, points) in &self.common_point_overrides {
            associations.set_common_points(*a, *b, points)?;
        }
        self.associations = Some(associations);
        Ok(())
    }

    pub(crate) fn ensure_associations(&mut self) -> Result<()> {
        if self.associations.is_none() {
            self.build_associations()?;
        }
        Ok(())
    }

    pub fn associations(&self) -> Option<&Associations> {
        self.associations.as_ref()
    }

    pub fn config(&self) -> &BundleAdjustmentConfig {
        &self.config
    }

    pub fn set_linear_solver(&mut self, linear_solver: LinearSolverType) {
        self.config.linear_solver = linear_solver;
    }

    pub fn thread_num(&self) -> usize {
        self.group.num_threads()
    }

    pub fn pose_num(&self) -> usize {
        self.poses.len()
    }

    pub fn point_num(&self) -> usize {
        self.points.len()
    }

    pub fn group_num(&self) -> usize {
        self.intrinsics.len()
    }

    pub fn projection_num(&self) -> usize {
        self.projections.len()
    }

    pub fn max_degree(&self) -> usize {
        self.associations.as_ref().map_or(0, Associations::max_degree)
    }

    pub fn size(&self) -> ProblemSize {
        ProblemSize {
            poses: self.pose_num(),
            points: self.point_num(),
            groups: self.group_num(),
            projections: self.projection_num(),
            max_degree: self.max_degree(),
        }
    }

    pub fn pose_ids(&self) -> &IndexMap {
        &self.pose_ids
    }

    pub fn point_ids(&self) -> &IndexMap {
        &self.point_ids
    }

    pub fn group_ids(&self) -> &IndexMap {
        &self.group_ids
    }

    fn check(kind: &'static str, index: usize, size: usize) -> Result<()> {
        if index < size {
            Ok(())
        } else {
            Err(SfmError::IndexOutOfRange { kind, index, size })
        }
    }

    pub fn get_pose(&self, idx: usize) -> Result<Pose> {
        Self::check("pose", idx, self.pose_num())?;
        Ok(self.poses.get(idx))
    }

    pub fn set_pose(&mut self, idx: usize, pose: &Pose) -> Result<()> {
        Self::check("pose", idx, self.pose_num())?;
        self.poses.set(idx, pose);
        self.residuals = None;
        Ok(())
    }

    pub fn get_point(&self, idx: usize) -> Result<Vector3<f64>> {
        Self::check("point", idx, self.point_num())?;
        Ok(self.points.get(idx))
    }

    pub fn set_point(&mut self, idx: usize, point: &Vector3<f64>) -> Result<()> {
        Self::check("point", idx, self.point_num())?;
        self.points.set(idx, point);
        self.residuals = None;
        Ok(())
    }

    pub fn get_color(&self, idx: usize) -> Result<Vector3<f64>> {
        Self::check("point", idx, self.point_num())?;
        Ok(self.points.color(idx))
    }

    pub fn set_color(&mut self, idx: usize, color: &Vector3<f64>) -> Result<()> {
        Self::check("point", idx, self.point_num())?;
        self.points.set_color(idx, color);
        Ok(())
    }

    pub fn get_intrinsic(&self, idx: usize) -> Result<Intrinsic> {
        Self::check("group", idx, self.group_num())?;
        Ok(self.intrinsics.get(idx))
    }

    pub fn set_intrinsic(&mut self, idx: usize, intrinsic: &Intrinsic) -> Result<()> {
        Self::check("group", idx, self.group_num())?;
        self.intrinsics.set(idx, intrinsic);
        self.residuals = None;
        Ok(())
    }

    pub fn get_pose_group(&self, pose: usize) -> Result<usize> {
        Self::check("pose", pose, self.pose_num())?;
        match self.pose_group[pose] {
            UNASSIGNED => Err(SfmError::InvalidStructure(format!(
                "pose {pose} has no intrinsic group"
            ))),
            group => Ok(group),
        }
    }

    pub fn get_pose_intrinsic(&self, pose: usize) -> Result<Intrinsic> {
        let group = self.get_pose_group(pose)?;
        self.get_intrinsic(group)
    }

    pub fn set_pose_group(&mut self, pose: usize, group: usize) -> Result<()> {
        Self::check("pose", pose, self.pose_num())?;
        Self::check("group", group, self.group_num())?;
        self.pose_group[pose] = group;
        self.associations = None;
        self.residuals = None;
        Ok(())
    }

    /// Assign `pose` to `group` and set the group's intrinsic.
    pub fn set_pose_intrinsic(&mut self, group: usize, pose: usize, intrinsic: &Intrinsic) -> Result<()> {
        self.set_pose_group(pose, group)?;
        self.set_intrinsic(group, intrinsic)
    }

    pub fn set_projection(
        &mut self,
        idx: usize,
        pose: usize,
        point: usize,
        observation: &Vector2<f64>,
    ) -> Result<()> {
        Self::check("projection", idx, self.projection_num())?;
        Self::check("pose", pose, self.pose_num())?;
        Self::check("point", point, self.point_num())?;
        self.projections.set(idx, pose, point, observation);
        self.associations = None;
        self.residuals = None;
        Ok(())
    }

    pub fn get_projection(&self, pose: usize, point: usize) -> Option<usize> {
        self.associations.as_ref()?.projection(pose, point)
    }

    pub fn get_observation(&self, idx: usize) -> Result<Vector2<f64>> {
        Self::check("projection", idx, self.projection_num())?;
        Ok(self.projections.observation(idx))
    }

    /// Override the common points of a pose pair, kept across association rebuilds.
    pub fn set_common_points(&mut self, pose1: usize, pose2: usize, points: &[usize]) -> Result<()> {
        Self::check("pose", pose1, self.pose_num())?;
        Self::check("pose", pose2, self.pose_num())?;
        if let Some(associations) = self.associations.as_mut() {
            associations.set_common_points(pose1, pose2, points)?;
        }
        self.common_point_overrides
            .retain(|(a, b, _)| !((*a == pose1 && *b == pose2) || (*a == pose2 && *b == pose1)));
        self.common_point_overrides.push((pose1, pose2, points.to_vec()));
        Ok(())
    }

    pub(crate) fn evaluator(&self) -> Evaluator<'_> {
        Evaluator {
            poses: &self.poses,
            points: &self.points,
            intrinsics: &self.intrinsics,
            projections: &self.projections,
            pose_group: &self.pose_group,
            loss: self.config.loss,
        }
    }

    /// Current residuals, recomputed when `update` is set or nothing is cached.
    pub fn residuals(&mut self, update: bool) -> Result<&Residuals> {
        if update || self.residuals.is_none() {
            self.ensure_associations()?;
            let group = Arc::clone(&self.group);
            let evaluator = self.evaluator();
            let residuals = group.install(|| evaluator.residuals());
            self.residuals = Some(residuals);
        }
        self.residuals
            .as_ref()
            .ok_or_else(|| SfmError::InvalidStructure("residuals are not available".to_string()))
    }

    /// Mean, median and max reprojection error over valid projections.
    pub fn reprojection_error(&mut self, update: bool) -> Result<ReprojectionStats> {
        Ok(self.residuals(update)?.stats())
    }

    /// Robust cost `Σ ρ(‖e‖)` at the current parameters.
    pub fn evaluate_cost(&mut self) -> Result<f64> {
        let loss = self.config.loss;
        Ok(self.residuals(true)?.cost(&loss))
    }

    pub fn solve(&mut self) -> Result<SolveSummary> {
        self.solve_with(&StandardSchur)
    }

    pub fn solve_with(&mut self, strategy: &dyn SchurStrategy) -> Result<SolveSummary> {
        bundle_adjustment::run(self, strategy)
    }

    pub(crate) fn finish(&mut self, residuals: Residuals, summary: SolveSummary) {
        self.residuals = Some(residuals);
        self.last_summary = Some(summary);
    }

    pub fn last_summary(&self) -> Option<&SolveSummary> {
        self.last_summary.as_ref()
    }

    /// Write current poses, points and intrinsics back into `block`, matching by id.
    pub fn update(&self, block: &mut BundleBlock) -> Result<()> {
        for camera in &mut block.cameras {
            if let Some(pose) = self.pose_ids.local(camera.id) {
                camera.pose = self.poses.get(pose);
            }
        }
        for group in &mut block.groups {
            if let Some(idx) = self.group_ids.local(group.id) {
                group.intrinsic = self.intrinsics.get(idx);
            }
        }
        for track in &mut block.tracks {
            if let Some(point) = self.point_ids.local(track.id) {
                track.position = self.points.get(point);
                track.color = self.points.color(point);
            }
        }
        Ok(())
    }

    /// The problem as a standalone model, using origin ids.
    pub fn export(&self) -> BundleBlock {
        let mut block = BundleBlock::new();
        for group in 0..self.group_num() {
            let id = self.group_ids.origin(group).unwrap_or(group as u64);
            block.add_group(id, self.intrinsics.get(group));
        }
        for pose in 0..self.pose_num() {
            let id = self.pose_ids.origin(pose).unwrap_or(pose as u64);
            let group = self.pose_group[pose];
            let group_id = self.group_ids.origin(group).unwrap_or(group as u64);
            block.add_camera(id, group_id, self.poses.get(pose));
        }

        let mut views = vec![Vec::new(); self.point_num()];
        for proj in 0..self.projection_num() {
            let (pose, point) = (self.projections.pose(proj), self.projections.point(proj));
            if point < views.len() && pose < self.pose_num() {
                let camera_id = self.pose_ids.origin(pose).unwrap_or(pose as u64);
                views[point].push((camera_id, self.projections.observation(proj)));
            }
        }
        for (point, point_views) in views.into_iter().enumerate() {
            let id = self.point_ids.origin(point).unwrap_or(point as u64);
            block.add_track(id, self.points.get(point), point_views).color = self.points.color(point);
        }
        block
    }

    pub fn set_debug_folder<P: Into<PathBuf>>(&mut self, folder: P) {
        self.config.debug_folder = Some(folder.into());
    }

    pub fn debug_folder(&self) -> Option<&Path> {
        self.config.debug_folder.as_deref()
    }

    pub fn save_report<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let summary = self.last_summary.as_ref().ok_or(SfmError::NotSolved)?;
        report::save_report(path, summary)
    }
}

impl std::fmt::Debug for BaProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaProblem")
            .field("size", &self.size())
            .field("threads", &self.thread_num())
            .field("linear_solver", &self.config.linear_solver)
            .finish()
    }
}
