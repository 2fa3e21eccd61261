//! The calibration stages, from single-camera intrinsics to the joint
//! bundle adjustment of the whole rig.
//!
//! * [`intrinsic`]: camera matrix and distortion of one camera.
//! * [`covisibility`], [`chain`] and [`relative`]: which cameras share
//!   frames, the spanning tree rooted at the reference camera, and the
//!   relative pose along each of its edges.
//! * [`triangulation`]: board corners in the reference frame.
//! * [`bundle_adjustment`]: problem layout, filtering and write-back around
//!   a [`BundleSolver`](crate::optimization::BundleSolver).

pub mod bundle_adjustment;
pub mod chain;
pub mod covisibility;
pub mod intrinsic;
pub mod relative;
pub mod triangulation;

pub use bundle_adjustment::{
    run_bundle_adjustment, BundleAdjustmentProblem, BundleAdjustmentResult, FilterStatistics,
};
pub use chain::{chain_poses, resolve_pose_chain, ExtrinsicPose, PoseChain};
pub use covisibility::{build_covisibility_graph, CovisibilityGraph};
pub use intrinsic::{calibrate_camera, usable_frames, IntrinsicParameters};
pub use relative::{estimate_relative_pose, RelativePose};
pub use triangulation::{triangulate_all, triangulate_point, CalibratedCamera, TriangulatedPoint};
