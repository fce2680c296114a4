//! Chessboard corner detection.
//!
//! Detection runs in three stages:
//!
//! 1. `chess-corners` finds ChESS X-junction candidates on the grayscale frame
//!    and refines each to sub-pixel accuracy.
//! 2. A lattice is grown from a seed candidate: each accepted corner predicts
//!    its four neighbours from the local grid steps, and the nearest candidate
//!    within tolerance is accepted. Steps are re-estimated per corner so the
//!    growth follows perspective distortion.
//! 3. A lattice that exactly covers the configured inner-corner grid is put in
//!    a canonical row-major order.
//!
//! Anything short of a complete grid is reported as "not found".

use std::collections::{HashMap, HashSet, VecDeque};

use chess_corners::{find_chess_corners_image, ChessConfig, CornerDescriptor};
use image::{GrayImage, RgbImage};
use nalgebra::{Point2, Vector2};

use super::pattern::CalibrationPattern;

/// Frames smaller than this cannot hold a ChESS sampling ring.
const MIN_SIDE: u32 = 13;

/// Tuning knobs for [`ChessboardDetector`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorParams {
    /// ChESS candidates must exceed this fraction of the strongest response.
    pub threshold_rel: f32,
    /// Non-maximum suppression radius in pixels.
    pub nms_radius: u32,
    /// How many of the strongest candidates to try as lattice seeds.
    pub max_seeds: usize,
    /// Neighbour search radius as a fraction of the local grid step.
    pub step_tolerance: f32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            threshold_rel: 0.2,
            nms_radius: 2,
            max_seeds: 8,
            step_tolerance: 0.35,
        }
    }
}

impl DetectorParams {
    fn chess_config(&self) -> ChessConfig {
        let mut cfg = ChessConfig::single_scale();
        cfg.params.threshold_rel = self.threshold_rel;
        cfg.params.nms_radius = self.nms_radius;
        cfg
    }
}

/// A refined corner candidate.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    pos: Vector2<f32>,
    response: f32,
}

impl From<&CornerDescriptor> for Candidate {
    fn from(c: &CornerDescriptor) -> Self {
        Self {
            pos: Vector2::new(c.x as f32, c.y as f32),
            response: c.response as f32,
        }
    }
}

/// Detected corners for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CornerSet {
    /// Every inner corner, row-major, refined.
    pub grid: Vec<Point2<f64>>,
    /// The solver subset, in the pattern's selection order.
    pub selected: Vec<Point2<f64>>,
}

impl CornerSet {
    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }
}

/// Finds the configured inner-corner grid in a frame.
#[derive(Debug, Clone)]
pub struct ChessboardDetector {
    cols: usize,
    rows: usize,
    params: DetectorParams,
}

impl ChessboardDetector {
    pub fn new(cols: usize, rows: usize) -> Self {
        Self::with_params(cols, rows, DetectorParams::default())
    }

    pub fn with_params(cols: usize, rows: usize, params: DetectorParams) -> Self {
        Self { cols, rows, params }
    }

    pub fn for_pattern(pattern: &CalibrationPattern) -> Self {
        Self::new(pattern.cols(), pattern.rows())
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Detect the pattern in an RGB frame and pick the selected corners.
    pub fn detect(&self, frame: &RgbImage, pattern: &CalibrationPattern) -> Option<CornerSet> {
        let gray = image::imageops::grayscale(frame);
        let grid = self.detect_grid(&gray)?;
        let selected = pattern.select_image_points(&grid)?;
        Some(CornerSet { grid, selected })
    }

    /// Detect every inner corner, row-major, at sub-pixel accuracy.
    pub fn detect_grid(&self, gray: &GrayImage) -> Option<Vec<Point2<f64>>> {
        if self.cols < 2 || self.rows < 2 {
            return None;
        }
        if gray.width() < MIN_SIDE || gray.height() < MIN_SIDE {
            return None;
        }

        let candidates: Vec<Candidate> = find_chess_corners_image(gray, &self.params.chess_config())
            .iter()
            .map(Candidate::from)
            .collect();
        let needed = self.cols * self.rows;
        if candidates.len() < needed {
            log::trace!(
                "chessboard: {} candidates, need {}",
                candidates.len(),
                needed
            );
            return None;
        }

        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by(|&a, &b| candidates[b].response.total_cmp(&candidates[a].response));

        order
            .iter()
            .take(self.params.max_seeds)
            .filter_map(|&seed| self.grow_lattice(seed, &candidates))
            .find_map(|lattice| self.order_lattice(&lattice, &candidates))
            .map(|ordered| {
                ordered
                    .iter()
                    .map(|p| Point2::new(p.x as f64, p.y as f64))
                    .collect()
            })
    }

    fn nearest(
        candidates: &[Candidate],
        target: Vector2<f32>,
        used: &HashSet<usize>,
    ) -> Option<(usize, f32)> {
        candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| !used.contains(i))
            .map(|(i, c)| (i, (c.pos - target).norm()))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Initial grid steps at the seed: nearest neighbour, then the nearest
    /// candidate roughly perpendicular to it.
    fn seed_steps(seed: usize, candidates: &[Candidate]) -> Option<(Vector2<f32>, Vector2<f32>)> {
        let origin = candidates[seed].pos;
        let mut by_distance: Vec<(usize, f32)> = candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != seed)
            .map(|(i, c)| (i, (c.pos - origin).norm()))
            .collect();
        by_distance.sort_by(|a, b| a.1.total_cmp(&b.1));

        let &(first, first_dist) = by_distance.first()?;
        if first_dist < 1.0 {
            return None;
        }
        let step_u = candidates[first].pos - origin;

        let step_v = by_distance.iter().skip(1).find_map(|&(i, dist)| {
            if dist > 2.0 * first_dist {
                return None;
            }
            let d = candidates[i].pos - origin;
            let cos = step_u.dot(&d) / (first_dist * dist);
            (cos.abs() < 0.5).then_some(d)
        })?;
        Some((step_u, step_v))
    }

    /// Breadth-first lattice growth from one seed.
    fn grow_lattice(&self, seed: usize, candidates: &[Candidate]) -> Option<HashMap<(i32, i32), usize>> {
        let (step_u, step_v) = Self::seed_steps(seed, candidates)?;
        let limit = 2 * self.cols * self.rows;

        let mut lattice: HashMap<(i32, i32), usize> = HashMap::new();
        let mut used: HashSet<usize> = HashSet::new();
        let mut queue = VecDeque::new();

        lattice.insert((0, 0), seed);
        used.insert(seed);
        queue.push_back(((0, 0), seed, step_u, step_v));

        while let Some(((i, j), idx, su, sv)) = queue.pop_front() {
            let origin = candidates[idx].pos;
            let tolerance = self.params.step_tolerance * su.norm().min(sv.norm());

            for (di, dj) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
                let key = (i + di, j + dj);
                if lattice.contains_key(&key) {
                    continue;
                }
                let predicted = origin + su * di as f32 + sv * dj as f32;
                let Some((found, dist)) = Self::nearest(candidates, predicted, &used) else {
                    continue;
                };
                if dist > tolerance {
                    continue;
                }

                let actual = candidates[found].pos - origin;
                let (child_u, child_v) = if di != 0 {
                    (actual * di as f32, sv)
                } else {
                    (su, actual * dj as f32)
                };
                lattice.insert(key, found);
                used.insert(found);
                queue.push_back((key, found, child_u, child_v));

                if lattice.len() > limit {
                    return None;
                }
            }
        }
        Some(lattice)
    }

    /// Map a complete lattice onto row-major pattern order.
    ///
    /// The column axis is the one running along +x in the image (or +y for
    /// boards turned more than 45 degrees), and rows advance clockwise from it.
    fn order_lattice(
        &self,
        lattice: &HashMap<(i32, i32), usize>,
        candidates: &[Candidate],
    ) -> Option<Vec<Vector2<f32>>> {
        if lattice.len() != self.cols * self.rows {
            return None;
        }
        let min_i = lattice.keys().map(|k| k.0).min()?;
        let max_i = lattice.keys().map(|k| k.0).max()?;
        let min_j = lattice.keys().map(|k| k.1).min()?;
        let max_j = lattice.keys().map(|k| k.1).max()?;
        let width = (max_i - min_i + 1) as usize;
        let height = (max_j - min_j + 1) as usize;

        let i_is_col = if width == self.cols && height == self.rows {
            true
        } else if width == self.rows && height == self.cols {
            false
        } else {
            return None;
        };

        let (cols, rows) = (self.cols, self.rows);
        let at = |col: usize, row: usize| -> Option<Vector2<f32>> {
            let key = if i_is_col {
                (min_i + col as i32, min_j + row as i32)
            } else {
                (min_i + row as i32, min_j + col as i32)
            };
            lattice.get(&key).map(|&idx| candidates[idx].pos)
        };

        let mut grid = Vec::with_capacity(cols * rows);
        for row in 0..rows {
            for col in 0..cols {
                grid.push(at(col, row)?);
            }
        }

        let col_dir = |g: &[Vector2<f32>]| g[cols - 1] - g[0];
        let row_dir = |g: &[Vector2<f32>]| g[(rows - 1) * cols] - g[0];

        let dc = col_dir(&grid);
        let flip_cols = if dc.x.abs() >= dc.y.abs() {
            dc.x < 0.0
        } else {
            dc.y < 0.0
        };
        if flip_cols {
            for row in grid.chunks_mut(cols) {
                row.reverse();
            }
        }

        let dc = col_dir(&grid);
        let dr = row_dir(&grid);
        if dc.x * dr.y - dc.y * dr.x < 0.0 {
            let flipped: Vec<Vector2<f32>> = grid
                .chunks(cols)
                .rev()
                .flat_map(|row| row.iter().copied())
                .collect();
            grid = flipped;
        }
        Some(grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{project_points, render_board, BoardView};
    use nalgebra::{Rotation3, Vector3};

    fn max_error(found: &[Point2<f64>], expected: &[Point2<f64>]) -> f64 {
        found
            .iter()
            .zip(expected)
            .map(|(a, b)| (a - b).norm())
            .fold(0.0, f64::max)
    }

    #[test]
    fn test_detects_frontal_board_in_row_major_order() {
        let view = BoardView::frontal();
        let img = render_board(&view);
        let pattern = view.pattern();

        let detector = ChessboardDetector::for_pattern(&pattern);
        let gray = image::imageops::grayscale(&img);
        let grid = detector.detect_grid(&gray).expect("board should be found");

        let expected = project_points(
            &view.intrinsics,
            &view.rotation,
            &view.translation,
            &pattern.all_world_points(),
        );
        assert_eq!(grid.len(), 70);
        assert!(max_error(&grid, &expected) < 0.5, "error {}", max_error(&grid, &expected));
    }

    #[test]
    fn test_detects_tilted_board() {
        let mut view = BoardView::frontal();
        view.rotation = Rotation3::from_euler_angles(0.35, -0.25, 0.15);
        view.translation = view.translation_for_center(Vector3::new(0.0, 0.0, 0.5));
        let img = render_board(&view);
        let pattern = view.pattern();

        let corners = ChessboardDetector::for_pattern(&pattern)
            .detect(&img, &pattern)
            .expect("tilted board should be found");
        let expected = project_points(
            &view.intrinsics,
            &view.rotation,
            &view.translation,
            &pattern.all_world_points(),
        );
        assert!(max_error(&corners.grid, &expected) < 0.5);
        assert_eq!(corners.selected.len(), pattern.selected_indices().len());
        assert_eq!(corners.selected[0], corners.grid[pattern.selected_indices()[0]]);
    }

    #[test]
    fn test_blank_frame_not_found() {
        let img = RgbImage::from_pixel(320, 240, image::Rgb([200, 200, 200]));
        let pattern = CalibrationPattern::full(10, 7, 0.02);
        assert!(ChessboardDetector::for_pattern(&pattern).detect(&img, &pattern).is_none());
    }

    #[test]
    fn test_partially_visible_board_not_found() {
        let mut view = BoardView::frontal();
        // push the board half out of frame
        view.translation = view.translation_for_center(Vector3::new(0.15, 0.0, 0.5));
        let img = render_board(&view);
        let pattern = view.pattern();
        assert!(ChessboardDetector::for_pattern(&pattern).detect(&img, &pattern).is_none());
    }

    #[test]
    fn test_wrong_grid_size_not_found() {
        let view = BoardView::frontal();
        let img = render_board(&view);
        let pattern = CalibrationPattern::full(9, 7, view.square_size);
        assert!(ChessboardDetector::for_pattern(&pattern).detect(&img, &pattern).is_none());
    }

    #[test]
    fn test_tiny_image_not_found() {
        let gray = GrayImage::new(8, 8);
        assert!(ChessboardDetector::new(3, 3).detect_grid(&gray).is_none());
    }
}
