//! Frame exclusion state for the intrinsic and extrinsic stages.
//!
//! [`ExclusionSet`] is a value: every update returns a new set with a bumped
//! version together with the stage that has to be recomputed. Intrinsic
//! exclusions are keyed by the stable frame index, never by the position of a
//! frame in a filtered list.

use crate::error::CalibrationError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionSet {
    /// Camera index to excluded intrinsic frames.
    intrinsic: BTreeMap<usize, BTreeSet<u32>>,
    /// Frames excluded from extrinsics and triangulation, for all cameras.
    extrinsic: BTreeSet<u32>,
    version: u64,
}

/// The downstream stage an exclusion change makes stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidatedStage {
    /// Intrinsics of one camera, and everything built on them.
    Intrinsics(usize),
    /// Extrinsics and triangulation.
    Extrinsics,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionUpdate {
    pub exclusions: ExclusionSet,
    pub invalidated: InvalidatedStage,
    /// `false` when the request did not change the set (e.g. excluding an
    /// already excluded frame).
    pub changed: bool,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_intrinsic_excluded(&self, camera: usize, frame: u32) -> bool {
        self.intrinsic
            .get(&camera)
            .is_some_and(|frames| frames.contains(&frame))
    }

    pub fn intrinsic_frames(&self, camera: usize) -> BTreeSet<u32> {
        self.intrinsic.get(&camera).cloned().unwrap_or_default()
    }

    pub fn is_extrinsic_excluded(&self, frame: u32) -> bool {
        self.extrinsic.contains(&frame)
    }

    pub fn extrinsic_frames(&self) -> &BTreeSet<u32> {
        &self.extrinsic
    }

    pub fn set_intrinsic(&self, camera: usize, frame: u32, excluded: bool) -> ExclusionUpdate {
        let mut next = self.clone();
        let frames = next.intrinsic.entry(camera).or_default();
        let changed = if excluded {
            frames.insert(frame)
        } else {
            frames.remove(&frame)
        };
        if frames.is_empty() {
            next.intrinsic.remove(&camera);
        }
        next.finish(InvalidatedStage::Intrinsics(camera), changed)
    }

    pub fn toggle_intrinsic(&self, camera: usize, frame: u32) -> ExclusionUpdate {
        let excluded = self.is_intrinsic_excluded(camera, frame);
        self.set_intrinsic(camera, frame, !excluded)
    }

    /// Toggle by position in the camera's usable-frame list.
    ///
    /// `usable` is the ordered list the position refers to (as returned by
    /// `calibration::intrinsic::usable_frames`). The position is resolved to a
    /// frame index before anything is stored.
    pub fn toggle_intrinsic_position(
        &self,
        camera: usize,
        usable: &[u32],
        position: usize,
    ) -> Result<ExclusionUpdate, CalibrationError> {
        let frame = usable.get(position).copied().ok_or_else(|| {
            CalibrationError::MalformedInput(format!(
                "position {position} is outside the {} usable frame(s) of camera #{camera}",
                usable.len()
            ))
        })?;
        Ok(self.toggle_intrinsic(camera, frame))
    }

    pub fn set_extrinsic(&self, frame: u32, excluded: bool) -> ExclusionUpdate {
        let mut next = self.clone();
        let changed = if excluded {
            next.extrinsic.insert(frame)
        } else {
            next.extrinsic.remove(&frame)
        };
        next.finish(InvalidatedStage::Extrinsics, changed)
    }

    pub fn toggle_extrinsic(&self, frame: u32) -> ExclusionUpdate {
        self.set_extrinsic(frame, !self.is_extrinsic_excluded(frame))
    }

    fn finish(mut self, invalidated: InvalidatedStage, changed: bool) -> ExclusionUpdate {
        if changed {
            self.version += 1;
        }
        ExclusionUpdate {
            exclusions: self,
            invalidated,
            changed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_returns_new_version() {
        let base = ExclusionSet::new();
        let update = base.toggle_intrinsic(1, 42);
        assert!(update.changed);
        assert_eq!(update.invalidated, InvalidatedStage::Intrinsics(1));
        assert_eq!(update.exclusions.version(), 1);
        assert!(update.exclusions.is_intrinsic_excluded(1, 42));
        assert!(!update.exclusions.is_intrinsic_excluded(0, 42));
        // base untouched
        assert!(!base.is_intrinsic_excluded(1, 42));

        let back = update.exclusions.toggle_intrinsic(1, 42);
        assert!(!back.exclusions.is_intrinsic_excluded(1, 42));
        assert_eq!(back.exclusions.version(), 2);
        assert!(back.exclusions.intrinsic_frames(1).is_empty());
    }

    #[test]
    fn test_noop_update_keeps_version() {
        let set = ExclusionSet::new().set_extrinsic(3, true).exclusions;
        let again = set.set_extrinsic(3, true);
        assert!(!again.changed);
        assert_eq!(again.exclusions.version(), set.version());
        assert_eq!(again.invalidated, InvalidatedStage::Extrinsics);
    }

    #[test]
    fn test_position_resolves_to_frame_index() {
        let usable = [4, 9, 15];
        let update = ExclusionSet::new()
            .toggle_intrinsic_position(0, &usable, 1)
            .unwrap();
        assert_eq!(update.exclusions.intrinsic_frames(0), BTreeSet::from([9]));

        // A different filtered list later does not shift the stored exclusion.
        assert!(update.exclusions.is_intrinsic_excluded(0, 9));
        assert!(ExclusionSet::new()
            .toggle_intrinsic_position(0, &usable, 3)
            .is_err());
    }
}
