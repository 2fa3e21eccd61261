//! Which camera pairs see the same board corners, and in which frames.

use crate::board::BoardModel;
use crate::detection::DetectionStore;
use crate::exclusion::ExclusionSet;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One frame in which both cameras of an edge see enough common corners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CovisibleFrame {
    pub frame: u32,
    pub corners: BTreeSet<u32>,
}

/// Covisibility between every unordered camera pair.
///
/// Edges are stored once under `(min, max)`; lookups are symmetric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CovisibilityGraph {
    camera_count: usize,
    edges: BTreeMap<(usize, usize), Vec<CovisibleFrame>>,
}

fn key(a: usize, b: usize) -> (usize, usize) {
    (a.min(b), a.max(b))
}

impl CovisibilityGraph {
    pub fn camera_count(&self) -> usize {
        self.camera_count
    }

    /// Covisible frames of `a` and `b`, in frame order. Empty for `a == b`
    /// and for out-of-range cameras.
    pub fn edge(&self, a: usize, b: usize) -> &[CovisibleFrame] {
        self.edges
            .get(&key(a, b))
            .map(|frames| frames.as_slice())
            .unwrap_or(&[])
    }

    /// Cameras sharing at least one covisible frame with `camera`, ascending.
    pub fn neighbours(&self, camera: usize) -> Vec<usize> {
        (0..self.camera_count)
            .filter(|other| *other != camera && !self.edge(camera, *other).is_empty())
            .collect()
    }

    /// Every pair `(a, b)` with `a < b` and its frames, including empty edges.
    pub fn edges(&self) -> impl Iterator<Item = ((usize, usize), &[CovisibleFrame])> {
        self.edges.iter().map(|(pair, frames)| (*pair, frames.as_slice()))
    }
}

/// Builds the covisibility graph.
///
/// A frame joins the edge `(a, b)` when both detections carry at least
/// `threshold` on-board corners and share at least `threshold` corner ids.
/// Frames excluded from the extrinsic stage are skipped.
///
/// # Arguments
///
/// * `store` - Detections of every camera.
/// * `board` - Board geometry; corners off the board do not count.
/// * `exclusions` - Extrinsic frame exclusions.
/// * `threshold` - Minimum shared corners per frame.
pub fn build_covisibility_graph(
    store: &DetectionStore,
    board: &BoardModel,
    exclusions: &ExclusionSet,
    threshold: usize,
) -> CovisibilityGraph {
    let camera_count = store.camera_count();
    let mut edges: BTreeMap<(usize, usize), Vec<CovisibleFrame>> = BTreeMap::new();
    for a in 0..camera_count {
        for b in a + 1..camera_count {
            edges.insert((a, b), Vec::new());
        }
    }

    for frame in store.frames() {
        if exclusions.is_extrinsic_excluded(frame) {
            debug!("Frame {frame} excluded from covisibility");
            continue;
        }
        let on_board: Vec<Option<BTreeSet<u32>>> = (0..camera_count)
            .map(|camera| {
                store.get(camera, frame).and_then(|detection| {
                    let ids: BTreeSet<u32> = detection
                        .ids()
                        .into_iter()
                        .filter(|id| board.corner_position(*id).is_some())
                        .collect();
                    (ids.len() >= threshold).then_some(ids)
                })
            })
            .collect();

        for a in 0..camera_count {
            let Some(ids_a) = &on_board[a] else {
                continue;
            };
            for b in a + 1..camera_count {
                let Some(ids_b) = &on_board[b] else {
                    continue;
                };
                let common: BTreeSet<u32> = ids_a.intersection(ids_b).copied().collect();
                if common.len() >= threshold {
                    if let Some(edge) = edges.get_mut(&(a, b)) {
                        edge.push(CovisibleFrame {
                            frame,
                            corners: common,
                        });
                    }
                }
            }
        }
    }

    let connected = edges.values().filter(|frames| !frames.is_empty()).count();
    info!(
        "Covisibility graph: {camera_count} camera(s), {connected} connected pair(s) of {}",
        edges.len()
    );

    CovisibilityGraph {
        camera_count,
        edges,
    }
}
