//! Planar perspective-n-point solver.
//!
//! Image points are normalized with the inverse intrinsics, a homography from
//! the board plane is estimated by normalized DLT, and the homography is
//! decomposed into an initial rotation and translation. Levenberg-Marquardt on
//! the pixel reprojection error then polishes the pose.

use nalgebra::{
    DMatrix, Matrix3, Matrix6, Point2, Point3, Rotation3, Vector3, Vector6, SVD,
};
use thiserror::Error;

/// Pose solving failures. Each one means "no valid pose this frame".
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoseSolveError {
    #[error("need at least 4 correspondences, got {0}")]
    TooFewPoints(usize),
    #[error("world and image point counts differ ({world} vs {image})")]
    CountMismatch { world: usize, image: usize },
    #[error("degenerate point configuration: {0}")]
    Degenerate(&'static str),
    #[error("solved pose places the pattern behind the camera")]
    BehindCamera,
    #[error("reprojection error {rms:.2}px exceeds {limit:.2}px")]
    ReprojectionTooLarge { rms: f64, limit: f64 },
}

/// Pinhole intrinsics without distortion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Project a camera-frame point to pixels.
    pub fn project(&self, p: &Point3<f64>) -> Point2<f64> {
        Point2::new(
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        )
    }

    /// Pixel to normalized image coordinates.
    pub fn normalize(&self, p: &Point2<f64>) -> Point2<f64> {
        Point2::new((p.x - self.cx) / self.fx, (p.y - self.cy) / self.fy)
    }
}

/// Camera extrinsics: `x_cam = rotation * x_world + translation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extrinsics {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
    /// RMS reprojection error in pixels.
    pub rms: f64,
}

/// PnP solver for planar targets.
#[derive(Debug, Clone)]
pub struct PnpSolver {
    /// Levenberg-Marquardt iteration cap.
    pub max_iterations: usize,
    /// Reject solutions with a larger RMS reprojection error (pixels).
    pub max_rms: f64,
}

impl Default for PnpSolver {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            max_rms: 5.0,
        }
    }
}

/// Hartley normalization: centroid to origin, mean distance sqrt(2).
fn normalization(points: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist <= f64::EPSILON {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0))
}

fn apply(h: &Matrix3<f64>, p: &Point2<f64>) -> Point2<f64> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    Point2::new(v.x / v.z, v.y / v.z)
}

/// Homography mapping `plane` to `image` by normalized DLT.
fn estimate_homography(
    plane: &[Point2<f64>],
    image: &[Point2<f64>],
) -> Result<Matrix3<f64>, PoseSolveError> {
    let t_plane = normalization(plane).ok_or(PoseSolveError::Degenerate("coincident world points"))?;
    let t_image = normalization(image).ok_or(PoseSolveError::Degenerate("coincident image points"))?;

    let n = plane.len();
    // pad to at least 9 rows so the SVD yields a full right basis
    let rows = (2 * n).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (k, (pw, pi)) in plane.iter().zip(image).enumerate() {
        let w = apply(&t_plane, pw);
        let i = apply(&t_image, pi);
        let r0 = 2 * k;
        let r1 = r0 + 1;
        a[(r0, 0)] = -w.x;
        a[(r0, 1)] = -w.y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = i.x * w.x;
        a[(r0, 7)] = i.x * w.y;
        a[(r0, 8)] = i.x;
        a[(r1, 3)] = -w.x;
        a[(r1, 4)] = -w.y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = i.y * w.x;
        a[(r1, 7)] = i.y * w.y;
        a[(r1, 8)] = i.y;
    }

    let svd = SVD::new(a, false, true);
    let v_t = svd.v_t.ok_or(PoseSolveError::Degenerate("SVD failed"))?;
    let singular = &svd.singular_values;

    let mut sorted: Vec<(usize, f64)> = singular.iter().copied().enumerate().collect();
    sorted.sort_by(|a, b| b.1.total_cmp(&a.1));
    let (smallest, _) = sorted[sorted.len() - 1];
    // a second vanishing singular value means the points are collinear
    let second_smallest = sorted[sorted.len() - 2].1;
    if second_smallest <= 1e-9 * sorted[0].1 {
        return Err(PoseSolveError::Degenerate("collinear points"));
    }

    let h = v_t.row(smallest);
    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    let t_image_inv = t_image
        .try_inverse()
        .ok_or(PoseSolveError::Degenerate("singular normalization"))?;
    let mut h = t_image_inv * hn * t_plane;
    let scale = h[(2, 2)];
    if scale.abs() > f64::EPSILON {
        h /= scale;
    }
    Ok(h)
}

/// Decompose a plane-to-normalized-image homography into a pose.
fn decompose_homography(h: &Matrix3<f64>) -> Result<(Rotation3<f64>, Vector3<f64>), PoseSolveError> {
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let norm = (h1.norm() + h2.norm()) / 2.0;
    if norm <= f64::EPSILON {
        return Err(PoseSolveError::Degenerate("homography has no scale"));
    }
    let mut lambda = 1.0 / norm;
    // the board origin must be in front of the camera
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);
    let t = h3 * lambda;

    let approx = Matrix3::from_columns(&[r1, r2, r3]);
    let svd = approx.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(PoseSolveError::Degenerate("rotation projection failed")),
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        r = u_fixed * v_t;
    }
    Ok((Rotation3::from_matrix_unchecked(r), t))
}

impl PnpSolver {
    /// Solve for the camera pose from planar world points (Z = 0) and pixels.
    pub fn solve(
        &self,
        world: &[Point3<f64>],
        image: &[Point2<f64>],
        intrinsics: &CameraIntrinsics,
    ) -> Result<Extrinsics, PoseSolveError> {
        if world.len() != image.len() {
            return Err(PoseSolveError::CountMismatch {
                world: world.len(),
                image: image.len(),
            });
        }
        if world.len() < 4 {
            return Err(PoseSolveError::TooFewPoints(world.len()));
        }
        if world.iter().any(|p| p.z.abs() > 1e-9) {
            return Err(PoseSolveError::Degenerate("world points are not on the Z=0 plane"));
        }

        let plane: Vec<Point2<f64>> = world.iter().map(|p| Point2::new(p.x, p.y)).collect();
        let normalized: Vec<Point2<f64>> = image.iter().map(|p| intrinsics.normalize(p)).collect();

        let h = estimate_homography(&plane, &normalized)?;
        let (rotation, translation) = decompose_homography(&h)?;
        let (rotation, translation) = self.refine(world, image, intrinsics, rotation, translation);

        if world.iter().any(|p| (rotation * p).z + translation.z <= 0.0) {
            return Err(PoseSolveError::BehindCamera);
        }

        let rms = rms_error(world, image, intrinsics, &rotation, &translation);
        if !rms.is_finite() || rms > self.max_rms {
            return Err(PoseSolveError::ReprojectionTooLarge {
                rms,
                limit: self.max_rms,
            });
        }

        Ok(Extrinsics {
            rotation,
            translation,
            rms,
        })
    }

    /// Levenberg-Marquardt over a left rotation perturbation and translation.
    fn refine(
        &self,
        world: &[Point3<f64>],
        image: &[Point2<f64>],
        intrinsics: &CameraIntrinsics,
        rotation: Rotation3<f64>,
        translation: Vector3<f64>,
    ) -> (Rotation3<f64>, Vector3<f64>) {
        let perturb = |r: &Rotation3<f64>, t: &Vector3<f64>, d: &Vector6<f64>| {
            let dr = Rotation3::new(Vector3::new(d[0], d[1], d[2]));
            (dr * r, t + Vector3::new(d[3], d[4], d[5]))
        };

        let mut r = rotation;
        let mut t = translation;
        let mut residual = residuals(world, image, intrinsics, &r, &t);
        let mut cost = residual.iter().map(|v| v * v).sum::<f64>();
        let mut lambda = 1e-3;
        let step = 1e-7;

        for _ in 0..self.max_iterations {
            if cost < 1e-24 {
                break;
            }

            // numeric Jacobian by central differences
            let m = residual.len();
            let mut jacobian = DMatrix::<f64>::zeros(m, 6);
            for k in 0..6 {
                let mut d = Vector6::zeros();
                d[k] = step;
                let (rp, tp) = perturb(&r, &t, &d);
                let (rm, tm) = perturb(&r, &t, &(-d));
                let plus = residuals(world, image, intrinsics, &rp, &tp);
                let minus = residuals(world, image, intrinsics, &rm, &tm);
                for row in 0..m {
                    jacobian[(row, k)] = (plus[row] - minus[row]) / (2.0 * step);
                }
            }

            let jt = jacobian.transpose();
            let jtj = &jt * &jacobian;
            let jtr = &jt * nalgebra::DVector::from_vec(residual.clone());
            let mut normal = Matrix6::<f64>::zeros();
            let mut gradient = Vector6::<f64>::zeros();
            for i in 0..6 {
                gradient[i] = jtr[i];
                for j in 0..6 {
                    normal[(i, j)] = jtj[(i, j)];
                }
            }

            let mut improved = false;
            for _ in 0..10 {
                let mut damped = normal;
                for i in 0..6 {
                    damped[(i, i)] += lambda * normal[(i, i)].max(1e-12);
                }
                let Some(chol) = damped.cholesky() else {
                    lambda *= 10.0;
                    continue;
                };
                let delta = chol.solve(&(-gradient));
                let (rn, tn) = perturb(&r, &t, &delta);
                let next = residuals(world, image, intrinsics, &rn, &tn);
                let next_cost = next.iter().map(|v| v * v).sum::<f64>();
                if next_cost < cost {
                    let converged = delta.norm() < 1e-12 || (cost - next_cost) < 1e-16 * cost;
                    r = rn;
                    t = tn;
                    residual = next;
                    cost = next_cost;
                    lambda = (lambda / 10.0).max(1e-12);
                    improved = !converged;
                    break;
                }
                lambda *= 10.0;
            }
            if !improved {
                break;
            }
        }
        (r, t)
    }
}

fn residuals(
    world: &[Point3<f64>],
    image: &[Point2<f64>],
    intrinsics: &CameraIntrinsics,
    rotation: &Rotation3<f64>,
    translation: &Vector3<f64>,
) -> Vec<f64> {
    let mut out = Vec::with_capacity(world.len() * 2);
    for (pw, pi) in world.iter().zip(image) {
        let pc = Point3::from(rotation * pw.coords + translation);
        let projected = intrinsics.project(&pc);
        out.push(projected.x - pi.x);
        out.push(projected.y - pi.y);
    }
    out
}

/// RMS reprojection error in pixels.
pub fn rms_error(
    world: &[Point3<f64>],
    image: &[Point2<f64>],
    intrinsics: &CameraIntrinsics,
    rotation: &Rotation3<f64>,
    translation: &Vector3<f64>,
) -> f64 {
    let r = residuals(world, image, intrinsics, rotation, translation);
    if r.is_empty() {
        return 0.0;
    }
    (r.iter().map(|v| v * v).sum::<f64>() / world.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::CalibrationPattern;
    use crate::testutil::project_points;
    use approx::assert_relative_eq;

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::new(1400.0, 1400.0, 960.0, 540.0)
    }

    fn ground_truth() -> (Rotation3<f64>, Vector3<f64>) {
        let rotation = Rotation3::from_euler_angles(0.3, -0.2, 0.1);
        let center = Vector3::new(0.045, 0.03, 0.0);
        // board centre 0.4 m in front of the camera
        let translation = Vector3::new(0.01, -0.02, 0.4) - rotation * center;
        (rotation, translation)
    }

    #[test]
    fn test_recovers_synthetic_pose() {
        let pattern = CalibrationPattern::new(10, 7, 0.01, (20..50).collect());
        let world = pattern.selected_world_points();
        let (rotation, translation) = ground_truth();
        let image = project_points(&intrinsics(), &rotation, &translation, &world);

        let solved = PnpSolver::default().solve(&world, &image, &intrinsics()).unwrap();
        assert!((solved.translation - translation).norm() < 1e-4);
        assert!(solved.rotation.angle_to(&rotation) < 1e-3);
        assert!(solved.rms < 1e-6);
    }

    #[test]
    fn test_recovers_pose_from_four_points() {
        let pattern = CalibrationPattern::new(10, 7, 0.01, vec![0, 9, 60, 69]);
        let world = pattern.selected_world_points();
        let (rotation, translation) = ground_truth();
        let image = project_points(&intrinsics(), &rotation, &translation, &world);

        let solved = PnpSolver::default().solve(&world, &image, &intrinsics()).unwrap();
        assert!((solved.translation - translation).norm() < 1e-4);
        assert!(solved.rotation.angle_to(&rotation) < 1e-3);
    }

    #[test]
    fn test_noisy_points_stay_close() {
        let pattern = CalibrationPattern::full(10, 7, 0.01);
        let world = pattern.selected_world_points();
        let (rotation, translation) = ground_truth();
        let mut image = project_points(&intrinsics(), &rotation, &translation, &world);
        for (k, p) in image.iter_mut().enumerate() {
            // deterministic +-0.3 px jitter
            p.x += 0.3 * ((k * 7 % 5) as f64 / 2.0 - 1.0);
            p.y += 0.3 * ((k * 3 % 5) as f64 / 2.0 - 1.0);
        }

        let solved = PnpSolver::default().solve(&world, &image, &intrinsics()).unwrap();
        assert!((solved.translation - translation).norm() < 2e-3);
        assert!(solved.rms < 0.5);
    }

    #[test]
    fn test_too_few_points() {
        let world = vec![Point3::origin(); 3];
        let image = vec![Point2::origin(); 3];
        assert_eq!(
            PnpSolver::default().solve(&world, &image, &intrinsics()),
            Err(PoseSolveError::TooFewPoints(3))
        );
    }

    #[test]
    fn test_collinear_points_are_degenerate() {
        let world: Vec<Point3<f64>> = (0..6).map(|i| Point3::new(i as f64 * 0.01, 0.0, 0.0)).collect();
        let (rotation, translation) = ground_truth();
        let image = project_points(&intrinsics(), &rotation, &translation, &world);
        assert!(matches!(
            PnpSolver::default().solve(&world, &image, &intrinsics()),
            Err(PoseSolveError::Degenerate(_))
        ));
    }

    #[test]
    fn test_inconsistent_points_rejected() {
        let pattern = CalibrationPattern::full(4, 3, 0.01);
        let world = pattern.selected_world_points();
        let (rotation, translation) = ground_truth();
        let mut image = project_points(&intrinsics(), &rotation, &translation, &world);
        // opposite corners swapped: no single pose explains both
        image.swap(0, 11);
        let result = PnpSolver::default().solve(&world, &image, &intrinsics());
        assert!(result.is_err());
    }

    #[test]
    fn test_intrinsics_round_trip() {
        let k = intrinsics();
        let p = Point2::new(1000.0, 300.0);
        let n = k.normalize(&p);
        let back = k.project(&Point3::new(n.x, n.y, 1.0));
        assert_relative_eq!(back, p, epsilon = 1e-9);
    }
}
