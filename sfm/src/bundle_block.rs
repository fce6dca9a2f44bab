//! External reconstruction model consumed by `BaProblem::initialize` and
//! written back by `BaProblem::update`.
//!
//! Entities carry their own origin ids; the problem maps them to dense local
//! indices.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use nalgebra::{Vector2, Vector3};
use sba_core::{Intrinsic, Pose};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Cameras sharing one calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleGroup {
    pub id: u64,
    pub intrinsic: Intrinsic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleCamera {
    pub id: u64,
    pub group_id: u64,
    pub pose: Pose,
}

/// One observation of a track in one camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleView {
    pub camera_id: u64,
    pub observation: Vector2<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleTrack {
    pub id: u64,
    pub position: Vector3<f64>,
    #[serde(default = "no_color")]
    pub color: Vector3<f64>,
    pub views: Vec<BundleView>,
}

fn no_color() -> Vector3<f64> {
    Vector3::zeros()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleBlock {
    pub groups: Vec<BundleGroup>,
    pub cameras: Vec<BundleCamera>,
    pub tracks: Vec<BundleTrack>,
}

impl BundleBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&mut self, id: u64, intrinsic: Intrinsic) {
        self.groups.push(BundleGroup { id, intrinsic });
    }

    pub fn add_camera(&mut self, id: u64, group_id: u64, pose: Pose) {
        self.cameras.push(BundleCamera { id, group_id, pose });
    }

    pub fn add_track(
        &mut self,
        id: u64,
        position: Vector3<f64>,
        views: Vec<(u64, Vector2<f64>)>,
    ) -> &mut BundleTrack {
        self.tracks.push(BundleTrack {
            id,
            position,
            color: Vector3::zeros(),
            views: views
                .into_iter()
                .map(|(camera_id, observation)| BundleView {
                    camera_id,
                    observation,
                })
                .collect(),
        });
        let last = self.tracks.len() - 1;
        &mut self.tracks[last]
    }

    pub fn projection_count(&self) -> usize {
        self.tracks.iter().map(|t| t.views.len()).sum()
    }

    pub fn camera(&self, id: u64) -> Option<&BundleCamera> {
        self.cameras.iter().find(|c| c.id == id)
    }

    pub fn track(&self, id: u64) -> Option<&BundleTrack> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Tracks seen by both cameras of each pair, keyed by `(smaller id, larger id)`.
    pub fn common_tracks(&self) -> BTreeMap<(u64, u64), Vec<u64>> {
        let mut common: BTreeMap<(u64, u64), Vec<u64>> = BTreeMap::new();
        for track in &self.tracks {
            let cameras: BTreeSet<u64> = track.views.iter().map(|v| v.camera_id).collect();
            let cameras: Vec<u64> = cameras.into_iter().collect();
            for (i, &a) in cameras.iter().enumerate() {
                for &b in &cameras[i + 1..] {
                    common.entry((a, b)).or_default().push(track.id);
                }
            }
        }
        common
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_camera_block() -> BundleBlock {
        let mut block = BundleBlock::new();
        block.add_group(7, Intrinsic::pinhole(500.0, 320.0, 240.0));
        block.add_camera(10, 7, Pose::default());
        block.add_camera(20, 7, Pose::default());
        block.add_camera(30, 7, Pose::default());
        block.add_track(
            1,
            Vector3::new(0.0, 0.0, 5.0),
            vec![(10, Vector2::new(320.0, 240.0)), (20, Vector2::new(300.0, 240.0))],
        );
        block
            .add_track(
                2,
                Vector3::new(1.0, 0.0, 5.0),
                vec![
                    (30, Vector2::new(420.0, 240.0)),
                    (10, Vector2::new(420.0, 240.0)),
                    (20, Vector2::new(400.0, 240.0)),
                ],
            )
            .color = Vector3::new(10.0, 20.0, 30.0);
        block
    }

    #[test]
    fn test_common_tracks() {
        let common = two_camera_block().common_tracks();
        assert_eq!(common[&(10, 20)], vec![1, 2]);
        assert_eq!(common[&(10, 30)], vec![2]);
        assert_eq!(common[&(20, 30)], vec![2]);
        assert_eq!(common.len(), 3);
    }

    #[test]
    fn test_json_roundtrip() {
        let block = two_camera_block();
        let path = std::env::temp_dir().join(format!("sba_block_{}.json", std::process::id()));
        block.save_json(&path).unwrap();
        let loaded = BundleBlock::load_json(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, block);
        assert_eq!(loaded.projection_count(), 5);
        assert_eq!(loaded.track(2).unwrap().color.z, 30.0);
    }
}
