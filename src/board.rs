//! Planar ChArUco-style target description.

use crate::detection::Detection;
use crate::error::CalibrationError;
use log::debug;
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Immutable board geometry.
///
/// Corners are the interior intersections of the square grid, numbered
/// row-major starting at the intersection nearest the board origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardModel {
    /// Number of squares along x.
    pub columns: u32,
    /// Number of squares along y.
    pub rows: u32,
    pub square_length: f64,
    pub marker_length: f64,
    /// Marker dictionary identifier, e.g. `DICT_5X5_1000`.
    pub dictionary: String,
}

impl BoardModel {
    pub fn new(
        columns: u32,
        rows: u32,
        square_length: f64,
        marker_length: f64,
        dictionary: impl Into<String>,
    ) -> Result<Self, CalibrationError> {
        let board = BoardModel {
            columns,
            rows,
            square_length,
            marker_length,
            dictionary: dictionary.into(),
        };
        board.validate()?;
        Ok(board)
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.columns < 2 || self.rows < 2 {
            return Err(CalibrationError::MalformedInput(format!(
                "board needs at least 2x2 squares, got {}x{}",
                self.columns, self.rows
            )));
        }
        if !(self.square_length.is_finite() && self.square_length > 0.0) {
            return Err(CalibrationError::MalformedInput(format!(
                "square length must be positive, got {}",
                self.square_length
            )));
        }
        if !(self.marker_length > 0.0 && self.marker_length < self.square_length) {
            return Err(CalibrationError::MalformedInput(format!(
                "marker length must be in (0, {}), got {}",
                self.square_length, self.marker_length
            )));
        }
        Ok(())
    }

    pub fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let contents = std::fs::read_to_string(path)?;
        let board: BoardModel = serde_yaml::from_str(&contents)?;
        board.validate()?;
        Ok(board)
    }

    /// Interior corners per row.
    fn corners_per_row(&self) -> u32 {
        self.columns - 1
    }

    pub fn corner_count(&self) -> u32 {
        (self.columns - 1) * (self.rows - 1)
    }

    pub fn corner_position(&self, id: u32) -> Option<Vector3<f64>> {
        if id >= self.corner_count() {
            return None;
        }
        let col = id % self.corners_per_row();
        let row = id / self.corners_per_row();
        Some(Vector3::new(
            (col + 1) as f64 * self.square_length,
            (row + 1) as f64 * self.square_length,
            0.0,
        ))
    }

    /// Inverse of [`corner_position`](Self::corner_position) in grid units.
    pub fn corner_id(&self, col: u32, row: u32) -> Option<u32> {
        if col >= self.corners_per_row() || row >= self.rows - 1 {
            return None;
        }
        Some(row * self.corners_per_row() + col)
    }

    /// Board points and observed pixels for every in-board corner of `detection`.
    pub fn object_points(&self, detection: &Detection) -> (Vec<Vector3<f64>>, Vec<Vector2<f64>>) {
        let mut points3d = Vec::with_capacity(detection.len());
        let mut points2d = Vec::with_capacity(detection.len());
        for corner in detection.corners() {
            match self.corner_position(corner.id) {
                Some(position) => {
                    points3d.push(position);
                    points2d.push(corner.pixel);
                }
                None => debug!("Skipping corner id {} outside the board", corner.id),
            }
        }
        (points3d, points2d)
    }

    /// Number of corners of `detection` that lie on this board.
    pub fn count_on_board(&self, detection: &Detection) -> usize {
        detection
            .corners()
            .iter()
            .filter(|c| c.id < self.corner_count())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::CornerObservation;
    use approx::assert_relative_eq;
    use std::collections::HashSet;

    #[test]
    fn test_corner_mapping_is_bijection() {
        for (columns, rows) in [(2, 2), (5, 7), (11, 8)] {
            let board = BoardModel::new(columns, rows, 0.04, 0.03, "DICT_5X5_1000").unwrap();
            assert_eq!(board.corner_count(), (columns - 1) * (rows - 1));

            let mut seen = HashSet::new();
            for id in 0..board.corner_count() {
                let p = board.corner_position(id).unwrap();
                assert_eq!(p.z, 0.0);
                let col = (p.x / board.square_length).round() as u32 - 1;
                let row = (p.y / board.square_length).round() as u32 - 1;
                assert_eq!(board.corner_id(col, row), Some(id));
                assert!(seen.insert((col, row)));
                // deterministic
                assert_eq!(board.corner_position(id), Some(p));
            }
            assert_eq!(seen.len() as u32, board.corner_count());
            assert!(board.corner_position(board.corner_count()).is_none());
            assert!(board.corner_id(columns - 1, 0).is_none());
        }
    }

    #[test]
    fn test_corner_position_row_major() {
        let board = BoardModel::new(5, 4, 0.1, 0.07, "DICT_4X4_50").unwrap();
        assert_relative_eq!(board.corner_position(0).unwrap(), Vector3::new(0.1, 0.1, 0.0));
        assert_relative_eq!(board.corner_position(3).unwrap(), Vector3::new(0.4, 0.1, 0.0));
        assert_relative_eq!(board.corner_position(4).unwrap(), Vector3::new(0.1, 0.2, 0.0));
    }

    #[test]
    fn test_load_sample_board() {
        let board = BoardModel::load_from_yaml("samples/board.yaml").unwrap();
        assert_eq!(board, BoardModel::new(9, 7, 0.05, 0.037, "DICT_5X5_100").unwrap());
        assert_eq!(board.corner_count(), 48);
    }

    #[test]
    fn test_board_validation() {
        assert!(BoardModel::new(1, 5, 0.1, 0.05, "d").is_err());
        assert!(BoardModel::new(5, 5, 0.0, 0.05, "d").is_err());
        assert!(BoardModel::new(5, 5, 0.1, 0.1, "d").is_err());
        assert!(BoardModel::new(5, 5, 0.1, -0.01, "d").is_err());
    }

    #[test]
    fn test_object_points_skips_unknown_ids() {
        let board = BoardModel::new(3, 3, 1.0, 0.5, "d").unwrap();
        let detection = Detection::new(vec![
            CornerObservation::new(0, 10.0, 20.0),
            CornerObservation::new(3, 30.0, 40.0),
            CornerObservation::new(99, 50.0, 60.0),
        ])
        .unwrap();
        let (p3, p2) = board.object_points(&detection);
        assert_eq!(p3.len(), 2);
        assert_eq!(p2[1], Vector2::new(30.0, 40.0));
        assert_eq!(board.count_on_board(&detection), 2);
    }
}
