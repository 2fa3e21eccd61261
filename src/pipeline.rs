//! Stage runner over an immutable calibration state.
//!
//! A [`CalibrationSession`] owns the inputs and the current
//! [`CalibrationState`]. Every stage reads the current state, computes its
//! output from scratch and installs a new state with a bumped version. Stages
//! report what happened as [`CalibrationEvent`]s instead of calling back into
//! a presentation layer.

use crate::board::BoardModel;
use crate::calibration::bundle_adjustment::{run_bundle_adjustment, BundleAdjustmentResult};
use crate::calibration::chain::{chain_poses, resolve_pose_chain, ExtrinsicPose, PoseChain};
use crate::calibration::covisibility::{build_covisibility_graph, CovisibilityGraph};
use crate::calibration::intrinsic::{calibrate_camera, usable_frames, IntrinsicParameters};
use crate::calibration::relative::{estimate_relative_pose, RelativePose};
use crate::calibration::triangulation::{triangulate_all, CalibratedCamera, Triangulation};
use crate::config::CalibrationConfig;
use crate::detection::DetectionStore;
use crate::error::CalibrationError;
use crate::exclusion::{ExclusionUpdate, InvalidatedStage};
use crate::export::{CalibrationRecord, DiagnosticRecord};
use crate::optimization::BundleSolver;

pub use crate::exclusion::ExclusionSet;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Intrinsics,
    Extrinsics,
    Triangulation,
    BundleAdjustment,
}

/// Structured progress and diagnostics of a stage run.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationEvent {
    CameraCalibrated {
        camera: String,
        frames: usize,
        rms_error: f64,
    },
    EdgeEstimated {
        parent: String,
        child: String,
        frames: usize,
        error: f64,
    },
    PointsTriangulated {
        points: usize,
    },
    /// A camera, edge, frame or point that could not be processed.
    Failure(CalibrationError),
    /// The solver stopped without converging; its result is still usable.
    SolverWarning {
        status: String,
    },
    StageInvalidated(Stage),
    StageFinished {
        stage: Stage,
        version: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntrinsicStage {
    /// Indexed by camera; `None` where calibration failed or is stale.
    pub cameras: Vec<Option<IntrinsicParameters>>,
    /// Why a camera has no intrinsics, keyed by camera index.
    pub failures: BTreeMap<usize, CalibrationError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtrinsicStage {
    pub graph: CovisibilityGraph,
    pub chain: PoseChain,
    /// Estimated spanning-tree edges keyed by child camera.
    pub relatives: BTreeMap<usize, RelativePose>,
    pub poses: BTreeMap<usize, ExtrinsicPose>,
    pub failures: Vec<CalibrationError>,
}

/// One immutable snapshot of everything derived so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationState {
    pub version: u64,
    pub exclusions: ExclusionSet,
    pub intrinsics: Option<IntrinsicStage>,
    pub extrinsics: Option<ExtrinsicStage>,
    pub triangulation: Option<Triangulation>,
}

impl CalibrationState {
    fn next(&self) -> CalibrationState {
        CalibrationState {
            version: self.version + 1,
            ..self.clone()
        }
    }

    pub fn camera_intrinsics(&self, camera: usize) -> Option<&IntrinsicParameters> {
        self.intrinsics.as_ref()?.cameras.get(camera)?.as_ref()
    }

    pub fn camera_extrinsics(&self, camera: usize) -> Option<&ExtrinsicPose> {
        self.extrinsics.as_ref()?.poses.get(&camera)
    }

    /// Every failure recorded by the current stages.
    pub fn failures(&self) -> Vec<CalibrationError> {
        let mut failures = Vec::new();
        if let Some(stage) = &self.intrinsics {
            failures.extend(stage.failures.values().cloned());
        }
        if let Some(stage) = &self.extrinsics {
            failures.extend(stage.failures.iter().cloned());
        }
        if let Some(stage) = &self.triangulation {
            failures.extend(stage.failures.iter().cloned());
        }
        failures
    }
}

pub struct CalibrationSession {
    store: DetectionStore,
    board: BoardModel,
    config: CalibrationConfig,
    state: CalibrationState,
}

impl CalibrationSession {
    pub fn new(
        store: DetectionStore,
        board: BoardModel,
        config: CalibrationConfig,
    ) -> Result<Self, CalibrationError> {
        board.validate()?;
        config.validate()?;
        if store.camera_count() == 0 {
            return Err(CalibrationError::MalformedInput(
                "detection store has no cameras".to_string(),
            ));
        }
        Ok(CalibrationSession {
            store,
            board,
            config,
            state: CalibrationState::default(),
        })
    }

    pub fn store(&self) -> &DetectionStore {
        &self.store
    }

    pub fn board(&self) -> &BoardModel {
        &self.board
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    /// Reference camera index from the configuration, camera 0 by default.
    pub fn reference_camera(&self) -> Result<usize, CalibrationError> {
        match &self.config.extrinsic.reference_camera {
            None => Ok(0),
            Some(name) => self.store.camera_index(name).ok_or_else(|| {
                CalibrationError::MalformedInput(format!("unknown reference camera '{name}'"))
            }),
        }
    }

    fn install(&mut self, state: CalibrationState, stage: Stage, events: &mut Vec<CalibrationEvent>) {
        events.push(CalibrationEvent::StageFinished {
            stage,
            version: state.version,
        });
        self.state = state;
    }

    fn calibrate(&self, camera: usize) -> (Option<IntrinsicParameters>, CalibrationEvent) {
        match calibrate_camera(
            &self.store,
            &self.board,
            camera,
            &self.state.exclusions,
            &self.config.intrinsic,
        ) {
            Ok(params) => {
                let event = CalibrationEvent::CameraCalibrated {
                    camera: self.store.camera_name(camera),
                    frames: params.frame_poses.len(),
                    rms_error: params.rms_error,
                };
                (Some(params), event)
            }
            Err(err) => {
                warn!("{err}");
                (None, CalibrationEvent::Failure(err))
            }
        }
    }

    /// Calibrates every camera. Downstream stages are dropped.
    pub fn run_intrinsics(&mut self) -> Vec<CalibrationEvent> {
        let mut events = Vec::new();
        let mut stage = IntrinsicStage {
            cameras: Vec::with_capacity(self.store.camera_count()),
            failures: BTreeMap::new(),
        };
        for camera in 0..self.store.camera_count() {
            let (params, event) = self.calibrate(camera);
            if let CalibrationEvent::Failure(err) = &event {
                stage.failures.insert(camera, err.clone());
            }
            stage.cameras.push(params);
            events.push(event);
        }

        let mut next = self.state.next();
        next.intrinsics = Some(stage);
        next.extrinsics = None;
        next.triangulation = None;
        self.install(next, Stage::Intrinsics, &mut events);
        events
    }

    /// Recalibrates one camera, keeping the others.
    pub fn run_camera_intrinsics(&mut self, camera: usize) -> Result<Vec<CalibrationEvent>, CalibrationError> {
        if camera >= self.store.camera_count() {
            return Err(CalibrationError::MalformedInput(format!(
                "camera index {camera} out of range"
            )));
        }
        let mut events = Vec::new();
        let (params, event) = self.calibrate(camera);

        let mut stage = self.state.intrinsics.clone().unwrap_or_else(|| IntrinsicStage {
            cameras: vec![None; self.store.camera_count()],
            failures: BTreeMap::new(),
        });
        stage.failures.remove(&camera);
        if let CalibrationEvent::Failure(err) = &event {
            stage.failures.insert(camera, err.clone());
        }
        stage.cameras[camera] = params;
        events.push(event);

        let mut next = self.state.next();
        next.intrinsics = Some(stage);
        next.extrinsics = None;
        next.triangulation = None;
        self.install(next, Stage::Intrinsics, &mut events);
        Ok(events)
    }

    /// Covisibility, spanning tree, edge poses and chaining.
    pub fn run_extrinsics(&mut self) -> Result<Vec<CalibrationEvent>, CalibrationError> {
        let intrinsics = self.state.intrinsics.as_ref().ok_or_else(|| {
            CalibrationError::MalformedInput("intrinsics have not been computed".to_string())
        })?;
        let reference = self.reference_camera()?;
        let mut events = Vec::new();
        let mut failures = Vec::new();

        let graph = build_covisibility_graph(
            &self.store,
            &self.board,
            &self.state.exclusions,
            self.config.extrinsic.min_common_corners,
        );
        let chain = resolve_pose_chain(&graph, reference)?;
        failures.extend(chain.unreachable_diagnostics(&self.store));

        let mut relatives = BTreeMap::new();
        for (parent, child) in chain.edges() {
            let parent_params = intrinsics.cameras.get(parent).and_then(Option::as_ref);
            let child_params = intrinsics.cameras.get(child).and_then(Option::as_ref);
            let estimate = match (parent_params, child_params) {
                (Some(parent_params), Some(child_params)) => {
                    self.estimate_edge(&graph, parent, parent_params, child, child_params)
                }
                (missing_parent, _) => {
                    let missing = if missing_parent.is_none() { parent } else { child };
                    Err(CalibrationError::UnreachableCamera {
                        camera: self.store.camera_name(child),
                        reason: format!(
                            "camera '{}' has no intrinsics",
                            self.store.camera_name(missing)
                        ),
                    })
                }
            };
            match estimate {
                Ok(relative) => {
                    events.push(CalibrationEvent::EdgeEstimated {
                        parent: self.store.camera_name(parent),
                        child: self.store.camera_name(child),
                        frames: relative.frames,
                        error: relative.error,
                    });
                    relatives.insert(child, relative);
                }
                Err(err) => {
                    warn!("{err}");
                    failures.push(err);
                }
            }
        }

        let chained = chain_poses(&chain, &relatives, &self.store);
        failures.extend(chained.failures.iter().cloned());
        events.extend(failures.iter().cloned().map(CalibrationEvent::Failure));

        let mut next = self.state.next();
        next.extrinsics = Some(ExtrinsicStage {
            graph,
            chain,
            relatives,
            poses: chained.poses,
            failures,
        });
        next.triangulation = None;
        self.install(next, Stage::Extrinsics, &mut events);
        Ok(events)
    }

    fn estimate_edge(
        &self,
        graph: &CovisibilityGraph,
        parent: usize,
        parent_params: &IntrinsicParameters,
        child: usize,
        child_params: &IntrinsicParameters,
    ) -> Result<RelativePose, CalibrationError> {
        estimate_relative_pose(
            &self.store,
            &self.board,
            graph,
            &self.state.exclusions,
            parent,
            &parent_params.model()?,
            child,
            &child_params.model()?,
            &self.config.extrinsic,
        )
    }

    /// Cameras with both intrinsics and extrinsics.
    pub fn calibrated_cameras(&self) -> Result<Vec<CalibratedCamera>, CalibrationError> {
        let mut cameras = Vec::new();
        for index in 0..self.store.camera_count() {
            if let (Some(intrinsics), Some(extrinsics)) = (
                self.state.camera_intrinsics(index),
                self.state.camera_extrinsics(index),
            ) {
                cameras.push(CalibratedCamera {
                    index,
                    model: intrinsics.model()?,
                    extrinsic: extrinsics.transform(),
                });
            }
        }
        Ok(cameras)
    }

    pub fn run_triangulation(&mut self) -> Result<Vec<CalibrationEvent>, CalibrationError> {
        if self.state.extrinsics.is_none() {
            return Err(CalibrationError::MalformedInput(
                "extrinsics have not been computed".to_string(),
            ));
        }
        let cameras = self.calibrated_cameras()?;
        let triangulation = triangulate_all(
            &self.store,
            &self.board,
            &cameras,
            &self.state.exclusions,
            &self.config.triangulation,
        );
        let mut events = vec![CalibrationEvent::PointsTriangulated {
            points: triangulation.points.len(),
        }];
        events.extend(
            triangulation
                .failures
                .iter()
                .cloned()
                .map(CalibrationEvent::Failure),
        );

        let mut next = self.state.next();
        next.triangulation = Some(triangulation);
        self.install(next, Stage::Triangulation, &mut events);
        Ok(events)
    }

    /// Intrinsics, extrinsics and triangulation in order.
    pub fn run_all(&mut self) -> Result<Vec<CalibrationEvent>, CalibrationError> {
        let mut events = self.run_intrinsics();
        events.extend(self.run_extrinsics()?);
        events.extend(self.run_triangulation()?);
        Ok(events)
    }

    pub fn diagnostic_record(&self) -> Result<DiagnosticRecord, CalibrationError> {
        let intrinsics = self
            .state
            .intrinsics
            .as_ref()
            .map(|stage| stage.cameras.clone())
            .unwrap_or_else(|| vec![None; self.store.camera_count()]);
        let extrinsics = self
            .state
            .extrinsics
            .as_ref()
            .map(|stage| stage.poses.clone())
            .unwrap_or_default();
        let reference = match &self.state.extrinsics {
            Some(stage) => stage.chain.reference,
            None => self.reference_camera()?,
        };
        let points = self
            .state
            .triangulation
            .as_ref()
            .map(|t| t.points.as_slice())
            .unwrap_or(&[]);
        Ok(DiagnosticRecord::new(
            self.state.version,
            &self.store,
            &self.board,
            reference,
            &intrinsics,
            &extrinsics,
            points,
            &self.state.failures(),
        ))
    }

    /// Runs bundle adjustment on the current state without changing it.
    pub fn bundle_adjust(
        &self,
        solver: &dyn BundleSolver,
    ) -> Result<(BundleAdjustmentResult, Vec<CalibrationEvent>), CalibrationError> {
        if self.state.triangulation.is_none() {
            return Err(CalibrationError::MalformedInput(
                "triangulation has not been computed".to_string(),
            ));
        }
        let record = self.diagnostic_record()?;
        let mut config = self.config.bundle_adjustment.clone();
        config.reference_camera = record.reference_camera;

        let result = run_bundle_adjustment(&record, config, solver)?;
        let mut events = Vec::new();
        if !result.converged {
            events.push(CalibrationEvent::SolverWarning {
                status: result.status.clone(),
            });
        }
        events.push(CalibrationEvent::StageFinished {
            stage: Stage::BundleAdjustment,
            version: self.state.version,
        });
        Ok((result, events))
    }

    /// Swaps the parameters of a bundle-adjustment result in. The result must
    /// come from the current state; triangulated points are left as they are.
    /// Cameras the run did not cover keep their parameters.
    pub fn apply_bundle_adjustment(
        &mut self,
        result: &BundleAdjustmentResult,
    ) -> Result<Vec<CalibrationEvent>, CalibrationError> {
        if result.source_version != self.state.version {
            return Err(CalibrationError::MalformedInput(format!(
                "bundle adjustment result is for state version {}, current is {}",
                result.source_version, self.state.version
            )));
        }
        let (Some(intrinsics), Some(extrinsics)) = (&self.state.intrinsics, &self.state.extrinsics)
        else {
            return Err(CalibrationError::MalformedInput(
                "no calibration to update".to_string(),
            ));
        };
        let camera_count = self.store.camera_count();
        if let Some(camera) = result
            .intrinsics
            .keys()
            .chain(result.extrinsics.keys())
            .find(|camera| **camera >= camera_count)
        {
            return Err(CalibrationError::MalformedInput(format!(
                "bundle adjustment result names camera #{camera}, the rig has {camera_count}"
            )));
        }

        let mut intrinsics = intrinsics.clone();
        for (camera, parameters) in &result.intrinsics {
            if let Some(entry) = intrinsics.cameras.get_mut(*camera) {
                *entry = Some(parameters.clone());
            }
        }
        let mut extrinsics = extrinsics.clone();
        for (camera, pose) in &result.extrinsics {
            extrinsics.poses.insert(*camera, *pose);
        }

        let mut next = self.state.next();
        next.intrinsics = Some(intrinsics);
        next.extrinsics = Some(extrinsics);
        let mut events = Vec::new();
        info!("Applied bundle adjustment result ({})", result.status);
        self.install(next, Stage::BundleAdjustment, &mut events);
        Ok(events)
    }

    /// Installs a new exclusion set and drops the stages it invalidates.
    pub fn update_exclusions(&mut self, update: ExclusionUpdate) -> Vec<CalibrationEvent> {
        if !update.changed {
            return Vec::new();
        }
        let mut next = self.state.next();
        next.exclusions = update.exclusions;
        let mut events = Vec::new();
        match update.invalidated {
            InvalidatedStage::Intrinsics(camera) => {
                if let Some(entry) = next
                    .intrinsics
                    .as_mut()
                    .and_then(|stage| stage.cameras.get_mut(camera))
                {
                    *entry = None;
                }
                events.push(CalibrationEvent::StageInvalidated(Stage::Intrinsics));
                if next.extrinsics.take().is_some() {
                    events.push(CalibrationEvent::StageInvalidated(Stage::Extrinsics));
                }
            }
            InvalidatedStage::Extrinsics => {
                if next.extrinsics.take().is_some() {
                    events.push(CalibrationEvent::StageInvalidated(Stage::Extrinsics));
                }
            }
        }
        if next.triangulation.take().is_some() {
            events.push(CalibrationEvent::StageInvalidated(Stage::Triangulation));
        }
        self.state = next;
        events
    }

    pub fn toggle_intrinsic_frame(&mut self, camera: usize, frame: u32) -> Vec<CalibrationEvent> {
        let update = self.state.exclusions.toggle_intrinsic(camera, frame);
        self.update_exclusions(update)
    }

    /// Toggles the frame at `position` in the camera's usable-frame list.
    pub fn toggle_intrinsic_position(
        &mut self,
        camera: usize,
        position: usize,
    ) -> Result<Vec<CalibrationEvent>, CalibrationError> {
        let usable = usable_frames(
            &self.store,
            &self.board,
            camera,
            self.config.intrinsic.min_corners,
        );
        let update = self
            .state
            .exclusions
            .toggle_intrinsic_position(camera, &usable, position)?;
        Ok(self.update_exclusions(update))
    }

    pub fn toggle_extrinsic_frame(&mut self, frame: u32) -> Vec<CalibrationEvent> {
        let update = self.state.exclusions.toggle_extrinsic(frame);
        self.update_exclusions(update)
    }

    /// Export records of every camera with intrinsics and extrinsics.
    pub fn calibration_records(&self) -> Vec<CalibrationRecord> {
        (0..self.store.camera_count())
            .filter_map(|camera| {
                let name = self.store.camera_name(camera);
                match (
                    self.state.camera_intrinsics(camera),
                    self.state.camera_extrinsics(camera),
                ) {
                    (Some(intrinsics), Some(extrinsics)) => {
                        Some(CalibrationRecord::new(name, intrinsics, extrinsics))
                    }
                    _ => {
                        warn!("Camera '{name}' is not fully calibrated and is not exported");
                        None
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::LevenbergMarquardtSolver;
    use crate::test_utils::SyntheticRig;
    use approx::assert_relative_eq;

    fn session(rig: &SyntheticRig) -> CalibrationSession {
        CalibrationSession::new(rig.detections(), rig.board.clone(), CalibrationConfig::default())
            .unwrap()
    }

    #[test]
    fn test_four_camera_scenario() {
        let rig = SyntheticRig::four_cameras();
        let mut session = session(&rig);
        let events = session.run_all().unwrap();
        assert!(
            !events.iter().any(|e| matches!(e, CalibrationEvent::Failure(_))),
            "{events:?}"
        );

        let state = session.state();
        for (index, camera) in rig.cameras.iter().enumerate() {
            let intrinsics = state.camera_intrinsics(index).unwrap();
            let k = intrinsics.camera_matrix;
            assert_relative_eq!(k[(0, 0)], camera.model.intrinsics.fx, max_relative = 5e-3);
            assert_relative_eq!(k[(1, 1)], camera.model.intrinsics.fy, max_relative = 5e-3);
            assert_relative_eq!(k[(0, 2)], camera.model.intrinsics.cx, max_relative = 5e-3);
            assert_relative_eq!(k[(1, 2)], camera.model.intrinsics.cy, max_relative = 5e-3);

            let extrinsics = state.camera_extrinsics(index).unwrap();
            assert_relative_eq!(extrinsics.translation, camera.extrinsic.translation, epsilon = 1e-3);
        }
        assert_eq!(state.camera_extrinsics(0), Some(&ExtrinsicPose::identity()));
        assert_eq!(
            state.triangulation.as_ref().unwrap().points.len(),
            rig.frames.len() * rig.board.corner_count() as usize
        );
        assert_eq!(session.calibration_records().len(), 4);
    }

    #[test]
    fn test_stage_order_is_enforced() {
        let rig = SyntheticRig::four_cameras();
        let mut session = session(&rig);
        assert!(session.run_extrinsics().is_err());
        assert!(session.run_triangulation().is_err());
        assert!(session.bundle_adjust(&LevenbergMarquardtSolver::default()).is_err());
        assert_eq!(session.state().version, 0);
    }

    #[test]
    fn test_exclusion_invalidates_downstream() {
        let rig = SyntheticRig::four_cameras();
        let mut session = session(&rig);
        session.run_all().unwrap();
        let version = session.state().version;

        let events = session.toggle_extrinsic_frame(rig.frames[1]);
        assert_eq!(
            events,
            vec![
                CalibrationEvent::StageInvalidated(Stage::Extrinsics),
                CalibrationEvent::StageInvalidated(Stage::Triangulation),
            ]
        );
        assert_eq!(session.state().version, version + 1);
        assert!(session.state().intrinsics.is_some());
        assert!(session.state().extrinsics.is_none());

        session.toggle_intrinsic_position(1, 0).unwrap();
        assert!(session.state().camera_intrinsics(1).is_none());
        assert!(session.state().camera_intrinsics(0).is_some());
        assert!(session.state().exclusions.is_intrinsic_excluded(1, rig.frames[0]));

        let events = session.run_camera_intrinsics(1).unwrap();
        assert!(matches!(events[0], CalibrationEvent::CameraCalibrated { frames, .. } if frames == rig.frames.len() - 1));
        assert!(session.state().camera_intrinsics(1).is_some());
    }

    #[test]
    fn test_unchanged_exclusion_is_a_no_op() {
        let rig = SyntheticRig::four_cameras();
        let mut session = session(&rig);
        let update = session.state().exclusions.set_extrinsic(3, false);
        assert!(session.update_exclusions(update).is_empty());
        assert_eq!(session.state().version, 0);
    }

    #[test]
    fn test_isolated_reference_camera() {
        let rig = SyntheticRig::four_cameras();
        let mut store = rig.detections();
        store
            .add_camera("lonely", rig.cameras[0].model.resolution)
            .unwrap();
        // the lonely camera sees the board in frames nobody else saw
        for position in 0..rig.frames.len() {
            store
                .insert(4, 100 + position as u32, rig.detection(0, position))
                .unwrap();
        }
        let config = CalibrationConfig {
            extrinsic: crate::config::ExtrinsicConfig {
                reference_camera: Some("lonely".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut session = CalibrationSession::new(store, rig.board.clone(), config).unwrap();
        session.run_intrinsics();
        let events = session.run_extrinsics().unwrap();

        let unreachable: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CalibrationEvent::Failure(CalibrationError::UnreachableCamera { camera, .. }) => {
                    Some(camera.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(unreachable, vec!["cam0", "cam1", "cam2", "cam3"]);
        assert_eq!(session.state().camera_extrinsics(4), Some(&ExtrinsicPose::identity()));
        assert_eq!(session.state().extrinsics.as_ref().unwrap().poses.len(), 1);
    }

    #[test]
    fn test_bundle_adjustment_is_applied_explicitly() {
        let rig = SyntheticRig::four_cameras();
        let store = rig.detections_for_frames(&rig.frames[..4]);
        let mut session =
            CalibrationSession::new(store, rig.board.clone(), CalibrationConfig::default()).unwrap();
        session.run_all().unwrap();
        let before = session.state().clone();

        let (result, events) = session
            .bundle_adjust(&LevenbergMarquardtSolver::default())
            .unwrap();
        assert_eq!(session.state(), &before);
        assert!(matches!(
            events.last(),
            Some(CalibrationEvent::StageFinished { stage: Stage::BundleAdjustment, .. })
        ));
        assert!(result.converged, "{}", result.status);
        assert!(result.final_cost <= result.initial_cost);
        assert_eq!(result.camera_indices, vec![0, 1, 2, 3]);
        for (camera, intrinsics) in &result.intrinsics {
            assert!(intrinsics.rms_error < 1e-3, "camera {camera}: {}", intrinsics.rms_error);
        }

        session.apply_bundle_adjustment(&result).unwrap();
        assert_eq!(session.state().version, before.version + 1);
        assert_eq!(session.state().triangulation, before.triangulation);
        let k = session.state().camera_intrinsics(2).unwrap().camera_matrix;
        assert_eq!(k[(0, 0)], result.cameras[2].focal[0]);

        // stale results are refused
        assert!(session.apply_bundle_adjustment(&result).is_err());
    }

    #[test]
    fn test_bundle_adjustment_skips_disconnected_camera() {
        let rig = SyntheticRig::four_cameras();
        let mut store = rig.detections_for_frames(&rig.frames[..4]);
        store
            .add_camera("lonely", rig.cameras[0].model.resolution)
            .unwrap();
        for position in 0..rig.frames.len() {
            store
                .insert(4, 100 + position as u32, rig.detection(0, position))
                .unwrap();
        }
        let mut session =
            CalibrationSession::new(store, rig.board.clone(), CalibrationConfig::default()).unwrap();
        let events = session.run_all().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            CalibrationEvent::Failure(CalibrationError::UnreachableCamera { camera, .. }) if camera == "lonely"
        )));
        let lonely_intrinsics = session.state().camera_intrinsics(4).cloned();
        assert!(lonely_intrinsics.is_some());

        let (result, _) = session
            .bundle_adjust(&LevenbergMarquardtSolver::default())
            .unwrap();
        assert!(result.converged, "{}", result.status);
        assert_eq!(result.camera_indices, vec![0, 1, 2, 3]);
        assert!(!result.intrinsics.contains_key(&4));
        assert!(!result.extrinsics.contains_key(&4));

        session.apply_bundle_adjustment(&result).unwrap();
        let state = session.state();
        assert_eq!(state.camera_intrinsics(4).cloned(), lonely_intrinsics);
        assert!(state.camera_extrinsics(4).is_none());
        assert_eq!(
            state.camera_intrinsics(1).unwrap().camera_matrix[(1, 1)],
            result.cameras[1].focal[1]
        );
        assert_eq!(session.calibration_records().len(), 4);
    }

    #[test]
    fn test_recalibration_is_reproducible() {
        let rig = SyntheticRig::four_cameras();
        let mut first = session(&rig);
        let mut second = session(&rig);
        first.run_all().unwrap();
        second.run_all().unwrap();
        assert_eq!(first.state().intrinsics, second.state().intrinsics);
        assert_eq!(first.state().triangulation, second.state().triangulation);
    }
}
