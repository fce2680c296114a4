//! Planar chessboard geometry.

use nalgebra::{Point2, Point3};

/// Inner-corner grid of the calibration chessboard.
///
/// Corners are indexed row-major: index `row * cols + col`. The world frame
/// has its origin at corner 0, +X along a row, +Y down the columns and Z = 0
/// on the board plane (vision convention).
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationPattern {
    cols: usize,
    rows: usize,
    square_size: f64,
    selected: Vec<usize>,
}

impl CalibrationPattern {
    pub fn new(cols: usize, rows: usize, square_size: f64, selected: Vec<usize>) -> Self {
        Self {
            cols,
            rows,
            square_size,
            selected,
        }
    }

    /// A pattern that uses every corner for solving.
    pub fn full(cols: usize, rows: usize, square_size: f64) -> Self {
        Self::new(cols, rows, square_size, (0..cols * rows).collect())
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn square_size(&self) -> f64 {
        self.square_size
    }

    pub fn corner_count(&self) -> usize {
        self.cols * self.rows
    }

    /// Row-major indices of the corners fed to the pose solver.
    pub fn selected_indices(&self) -> &[usize] {
        &self.selected
    }

    /// Grid position (col, row) of a row-major index.
    pub fn grid_position(&self, index: usize) -> (usize, usize) {
        (index % self.cols, index / self.cols)
    }

    /// World position of a single corner.
    pub fn world_point(&self, index: usize) -> Point3<f64> {
        let (col, row) = self.grid_position(index);
        Point3::new(
            col as f64 * self.square_size,
            row as f64 * self.square_size,
            0.0,
        )
    }

    /// World positions of every corner, row-major.
    pub fn all_world_points(&self) -> Vec<Point3<f64>> {
        (0..self.corner_count()).map(|i| self.world_point(i)).collect()
    }

    /// World positions of the selected corners, in selection order.
    pub fn selected_world_points(&self) -> Vec<Point3<f64>> {
        self.selected.iter().map(|&i| self.world_point(i)).collect()
    }

    /// Pick the selected corners out of a full row-major detection.
    ///
    /// Returns `None` when the detection does not cover the whole grid.
    pub fn select_image_points(&self, grid: &[Point2<f64>]) -> Option<Vec<Point2<f64>>> {
        if grid.len() != self.corner_count() {
            return None;
        }
        self.selected.iter().map(|&i| grid.get(i).copied()).collect()
    }

    /// Whether every selected index falls inside the grid.
    pub fn is_consistent(&self) -> bool {
        self.selected.iter().all(|&i| i < self.corner_count())
    }

    /// Centre of the inner-corner grid in the vision frame.
    pub fn center(&self) -> Point3<f64> {
        Point3::new(
            (self.cols as f64 - 1.0) * self.square_size / 2.0,
            (self.rows as f64 - 1.0) * self.square_size / 2.0,
            0.0,
        )
    }
}
