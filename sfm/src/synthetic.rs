//! Deterministic synthetic scenes for tests and benchmarks.

use nalgebra::{Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sba_core::{project, Intrinsic, Pose};
use serde::{Deserialize, Serialize};

use crate::bundle_block::BundleBlock;

pub const IMAGE_WIDTH: f64 = 640.0;
pub const IMAGE_HEIGHT: f64 = 480.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub cameras: usize,
    pub points: usize,
    pub groups: usize,
    /// Half-width of the uniform noise added to observations, in pixels.
    pub pixel_noise: f64,
    /// Half-width of the uniform noise added to each pose parameter.
    pub pose_noise: f64,
    /// Half-width of the uniform noise added to each point coordinate.
    pub point_noise: f64,
    pub seed: u64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            cameras: 8,
            points: 200,
            groups: 1,
            pixel_noise: 0.0,
            pose_noise: 1e-2,
            point_noise: 5e-2,
            seed: 7,
        }
    }
}

impl SceneConfig {
    pub fn new(cameras: usize, points: usize, seed: u64) -> Self {
        Self {
            cameras,
            points,
            seed,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticScene {
    pub ground_truth: BundleBlock,
    /// Same structure and observations, with perturbed poses and points.
    pub perturbed: BundleBlock,
}

/// Cameras on a line along x looking down +z, points in a box in front of
/// them. Only in-image views are kept and tracks with fewer than two views
/// are dropped.
pub fn generate(config: &SceneConfig) -> SyntheticScene {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let groups = config.groups.clamp(1, config.cameras.max(1));
    let mut truth = BundleBlock::new();

    for g in 0..groups {
        let focal = 500.0 + 10.0 * g as f64;
        truth.add_group(g as u64, Intrinsic::pinhole(focal, IMAGE_WIDTH / 2.0, IMAGE_HEIGHT / 2.0));
    }

    let span = 2.0;
    for i in 0..config.cameras {
        let x = if config.cameras > 1 {
            -span / 2.0 + span * i as f64 / (config.cameras - 1) as f64
        } else {
            0.0
        };
        let yaw = rng.gen_range(-0.05..0.05);
        let angle_axis = Vector3::new(0.0, yaw, 0.0);
        let center = Vector3::new(x, rng.gen_range(-0.1..0.1), 0.0);
        let rotation = sba_core::angle_axis_to_rotation(&angle_axis);
        let pose = Pose::new(angle_axis, -(rotation * center));
        truth.add_camera(i as u64, (i % groups) as u64, pose);
    }

    for p in 0..config.points {
        let position = Vector3::new(
            rng.gen_range(-1.5..1.5),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(4.0..8.0),
        );
        let mut views = Vec::new();
        for camera in &truth.cameras {
            let intrinsic = truth.groups[camera.group_id as usize].intrinsic;
            let Some(uv) = project(&intrinsic, &camera.pose, &position) else {
                continue;
            };
            if uv.x < 0.0 || uv.x >= IMAGE_WIDTH || uv.y < 0.0 || uv.y >= IMAGE_HEIGHT {
                continue;
            }
            let noise = Vector2::new(uniform(&mut rng, config.pixel_noise), uniform(&mut rng, config.pixel_noise));
            views.push((camera.id, uv + noise));
        }
        if views.len() >= 2 {
            let color = Vector3::new(rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0));
            truth.add_track(p as u64, position, views).color = color;
        }
    }

    let mut perturbed = truth.clone();
    for camera in &mut perturbed.cameras {
        let mut v = camera.pose.to_vector();
        for value in v.iter_mut() {
            *value += uniform(&mut rng, config.pose_noise);
        }
        camera.pose = Pose::from_vector(&v);
    }
    for track in &mut perturbed.tracks {
        for value in track.position.iter_mut() {
            *value += uniform(&mut rng, config.point_noise);
        }
    }

    tracing::debug!(
        cameras = truth.cameras.len(),
        tracks = truth.tracks.len(),
        projections = truth.projection_count(),
        "generated synthetic scene"
    );
    SyntheticScene {
        ground_truth: truth,
        perturbed,
    }
}

fn uniform(rng: &mut StdRng, half_width: f64) -> f64 {
    if half_width > 0.0 {
        rng.gen_range(-half_width..half_width)
    } else {
        0.0
    }
}
