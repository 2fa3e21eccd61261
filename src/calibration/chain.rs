//! Spanning tree over the covisibility graph and composition of the edge
//! transforms into per-camera extrinsics.

use crate::calibration::covisibility::CovisibilityGraph;
use crate::calibration::relative::RelativePose;
use crate::detection::DetectionStore;
use crate::error::CalibrationError;
use crate::geometry::RigidTransform;

use log::{info, warn};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Breadth-first spanning tree rooted at the reference camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoseChain {
    pub reference: usize,
    /// Child camera to parent camera.
    pub parents: BTreeMap<usize, usize>,
    /// Cameras with no path to the reference, ascending.
    pub unreachable: Vec<usize>,
}

impl PoseChain {
    /// Edges `(parent, child)` in child order.
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.parents.iter().map(|(child, parent)| (*parent, *child))
    }

    pub fn is_reachable(&self, camera: usize) -> bool {
        camera == self.reference || self.parents.contains_key(&camera)
    }

    /// One [`CalibrationError::UnreachableCamera`] per unreachable camera.
    pub fn unreachable_diagnostics(&self, store: &DetectionStore) -> Vec<CalibrationError> {
        self.unreachable
            .iter()
            .map(|camera| CalibrationError::UnreachableCamera {
                camera: store.camera_name(*camera),
                reason: format!(
                    "no covisible frames connect it to '{}'",
                    store.camera_name(self.reference)
                ),
            })
            .collect()
    }
}

/// BFS from `reference` over non-empty edges, visiting neighbours in
/// ascending camera index.
///
/// # Errors
///
/// * [`CalibrationError::MalformedInput`]: If `reference` is not a camera of
///   `graph`.
pub fn resolve_pose_chain(
    graph: &CovisibilityGraph,
    reference: usize,
) -> Result<PoseChain, CalibrationError> {
    let camera_count = graph.camera_count();
    if reference >= camera_count {
        return Err(CalibrationError::MalformedInput(format!(
            "reference camera index {reference} out of range ({camera_count} camera(s))"
        )));
    }

    let mut visited = vec![false; camera_count];
    let mut parents = BTreeMap::new();
    let mut queue = VecDeque::from([reference]);
    visited[reference] = true;
    while let Some(camera) = queue.pop_front() {
        for neighbour in graph.neighbours(camera) {
            if !visited[neighbour] {
                visited[neighbour] = true;
                parents.insert(neighbour, camera);
                queue.push_back(neighbour);
            }
        }
    }

    let unreachable: Vec<usize> = (0..camera_count).filter(|c| !visited[*c]).collect();
    for camera in &unreachable {
        warn!("Camera #{camera} is not connected to reference #{reference}");
    }
    Ok(PoseChain {
        reference,
        parents,
        unreachable,
    })
}

/// Pose of a camera relative to the reference camera: `X_cam = R · X_ref + t`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtrinsicPose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    /// Axis-angle form of `rotation`.
    pub rvec: Vector3<f64>,
    /// Mean edge error along the chain.
    pub error: f64,
}

impl ExtrinsicPose {
    pub fn identity() -> Self {
        ExtrinsicPose {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
            rvec: Vector3::zeros(),
            error: 0.0,
        }
    }

    pub fn from_transform(transform: &RigidTransform, error: f64) -> Self {
        ExtrinsicPose {
            rotation: transform.rotation,
            translation: transform.translation,
            rvec: transform.axis_angle(),
            error,
        }
    }

    pub fn transform(&self) -> RigidTransform {
        RigidTransform::new(self.rotation, self.translation)
    }
}

/// Extrinsics of every camera whose chain could be composed, plus failures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainedPoses {
    pub poses: BTreeMap<usize, ExtrinsicPose>,
    pub failures: Vec<CalibrationError>,
}

/// Composes edge transforms from the reference down to each camera.
///
/// `relatives` holds the successfully estimated edges keyed by child. A
/// camera whose path crosses a missing edge is reported and left out.
pub fn chain_poses(
    chain: &PoseChain,
    relatives: &BTreeMap<usize, RelativePose>,
    store: &DetectionStore,
) -> ChainedPoses {
    let mut result = ChainedPoses::default();
    result.poses.insert(chain.reference, ExtrinsicPose::identity());

    'cameras: for camera in chain.parents.keys().copied() {
        // child-to-root order
        let mut path = Vec::new();
        let mut current = camera;
        while current != chain.reference {
            let parent = match chain.parents.get(&current) {
                Some(parent) if path.len() < chain.parents.len() => *parent,
                _ => {
                    result.failures.push(CalibrationError::UnreachableCamera {
                        camera: store.camera_name(camera),
                        reason: "parent links do not lead to the reference".to_string(),
                    });
                    continue 'cameras;
                }
            };
            let Some(edge) = relatives.get(&current) else {
                result.failures.push(CalibrationError::UnreachableCamera {
                    camera: store.camera_name(camera),
                    reason: format!(
                        "edge '{}' -> '{}' has no relative pose",
                        store.camera_name(parent),
                        store.camera_name(current)
                    ),
                });
                continue 'cameras;
            };
            path.push(edge);
            current = parent;
        }

        let mut rotation = Matrix3::identity();
        let mut translation = Vector3::zeros();
        for edge in path.iter().rev() {
            rotation = edge.transform.rotation * rotation;
            translation = edge.transform.rotation * translation + edge.transform.translation;
        }
        let error = path.iter().map(|edge| edge.error).sum::<f64>() / path.len().max(1) as f64;
        result.poses.insert(
            camera,
            ExtrinsicPose::from_transform(&RigidTransform::new(rotation, translation), error),
        );
    }

    info!(
        "Chained extrinsics for {} of {} camera(s)",
        result.poses.len(),
        store.camera_count()
    );
    result
}
