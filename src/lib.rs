pub use sba_core as core;
pub use sba_optimize as optimize;
pub use sba_runtime as runtime;
pub use sba_sfm as sfm;

pub use sba_sfm::{
    bundle_adjust, bundle_adjust_with, BaProblem, BundleAdjustmentConfig, BundleBlock, SfmError,
    SolveSummary,
};
