//! Vision and render pose conventions.
//!
//! The solver works in the vision convention: camera looks down +Z, image Y
//! points down, and the chessboard frame has +Z pointing into the board. Its
//! output is `x_cam = R * x_world + t`.
//!
//! A [`VisionPose`] keeps the solver rotation `R` as is, next to the camera
//! position `t_world = -R^T t`. A [`RenderPose`] is the camera-to-world
//! transform the renderer expects, with Y up and the camera looking down -Z.
//! The two are related through the sign flip `S = diag(1, -1, -1)`:
//!
//! ```text
//! render.rotation    = S * R^T * S
//! render.translation = S * t_world
//! ```
//!
//! `S * S = I`, so applying the flip twice silently hands the renderer an
//! inverted camera. This module is the only place the flip exists. Everything
//! downstream receives a typed [`RenderPose`] or [`VisionPose`] and never
//! re-derives the conversion.

use nalgebra::{Matrix3, Matrix4, Vector3};

/// The 3x3 sign flip between vision and render axes.
pub fn sign_flip() -> Matrix3<f64> {
    Matrix3::from_diagonal(&Vector3::new(1.0, -1.0, -1.0))
}

/// Conjugate a rotation block with the sign flip: `S R S`.
pub fn conjugate_rotation(rotation: &Matrix3<f64>) -> Matrix3<f64> {
    let s = sign_flip();
    s * rotation * s
}

fn homogeneous(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix4<f64> {
    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
    m.fixed_view_mut::<3, 1>(0, 3).copy_from(translation);
    m
}

/// Solver rotation plus camera position, vision axes (Y down, Z into the scene).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisionPose(Matrix4<f64>);

/// Camera-to-world pose in the render convention (Y up, Z out of the screen).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPose(Matrix4<f64>);

impl VisionPose {
    /// Build from solver extrinsics `x_cam = R * x_world + t`.
    ///
    /// The rotation block is `R` itself; the translation column is the camera
    /// position in the world frame, `-R^T t`.
    pub fn from_extrinsics(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Self {
        let position = -(rotation.transpose() * translation);
        Self(homogeneous(rotation, &position))
    }

    pub fn from_matrix(matrix: Matrix4<f64>) -> Self {
        Self(matrix)
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.0
    }

    /// Solver rotation `R` (world to camera).
    pub fn rotation(&self) -> Matrix3<f64> {
        self.0.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// Camera position in the world frame.
    pub fn translation(&self) -> Vector3<f64> {
        self.0.fixed_view::<3, 1>(0, 3).into_owned()
    }

    /// Convert to the render convention. This is the only vision→render bridge.
    pub fn to_render(&self) -> RenderPose {
        let rotation = conjugate_rotation(&self.rotation().transpose());
        RenderPose(homogeneous(&rotation, &(sign_flip() * self.translation())))
    }

    /// Axis-view direction `R * (0, 0, -1)`.
    pub fn forward(&self) -> Vector3<f64> {
        self.rotation() * Vector3::new(0.0, 0.0, -1.0)
    }
}

impl RenderPose {
    pub fn from_matrix(matrix: Matrix4<f64>) -> Self {
        Self(matrix)
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.0
    }

    pub fn rotation(&self) -> Matrix3<f64> {
        self.0.fixed_view::<3, 3>(0, 0).into_owned()
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.0.fixed_view::<3, 1>(0, 3).into_owned()
    }

    /// Camera viewing direction in the world: `R * (0, 0, -1)`.
    pub fn forward(&self) -> Vector3<f64> {
        self.rotation() * Vector3::new(0.0, 0.0, -1.0)
    }

    /// Convert back to the vision convention.
    pub fn to_vision(&self) -> VisionPose {
        let rotation = conjugate_rotation(&self.rotation()).transpose();
        VisionPose(homogeneous(&rotation, &(sign_flip() * self.translation())))
    }

    /// Single-precision copy for the render scenes.
    pub fn to_mat4(&self) -> glam::Mat4 {
        let mut cols = [0.0f32; 16];
        for (dst, src) in cols.iter_mut().zip(self.0.as_slice()) {
            *dst = *src as f32;
        }
        // nalgebra storage is column-major, as is glam's
        glam::Mat4::from_cols_array(&cols)
    }
}

/// The two conventions produced for one solved frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PosePair {
    /// Consumed by the render scenes.
    pub render: RenderPose,
    /// Consumed by the axis views.
    pub vision: VisionPose,
}

impl PosePair {
    pub fn from_extrinsics(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Self {
        let vision = VisionPose::from_extrinsics(rotation, translation);
        Self {
            render: vision.to_render(),
            vision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn sample_rotation() -> Matrix3<f64> {
        Rotation3::from_euler_angles(0.3, -0.7, 1.1).into_inner()
    }

    #[test]
    fn test_double_conjugation_is_identity() {
        let r = sample_rotation();
        let twice = conjugate_rotation(&conjugate_rotation(&r));
        assert_relative_eq!(twice, r, epsilon = 1e-12);
    }

    #[test]
    fn test_sign_flip_is_involution() {
        let s = sign_flip();
        assert_relative_eq!(s * s, Matrix3::identity());
    }

    #[test]
    fn test_render_round_trip() {
        let pair = PosePair::from_extrinsics(&sample_rotation(), &Vector3::new(0.05, -0.02, 0.4));
        assert_relative_eq!(
            pair.render.to_vision().matrix(),
            pair.vision.matrix(),
            epsilon = 1e-12
        );
        // the conjugated pose is a different matrix unless R is special
        assert!((pair.render.matrix() - pair.vision.matrix()).norm() > 1e-3);
    }

    #[test]
    fn test_camera_position_is_minus_rt_t() {
        let r = sample_rotation();
        let t = Vector3::new(0.1, 0.2, 0.5);
        let pose = VisionPose::from_extrinsics(&r, &t);
        assert_relative_eq!(pose.translation(), -(r.transpose() * t), epsilon = 1e-12);

        let render = pose.to_render();
        assert_relative_eq!(render.translation(), sign_flip() * pose.translation(), epsilon = 1e-12);
        assert_relative_eq!(
            render.rotation(),
            conjugate_rotation(&r.transpose()),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_frontal_camera_looks_down_negative_z_in_render_frame() {
        // Camera 0.5 m in front of the board, looking straight at it.
        let pair = PosePair::from_extrinsics(&Matrix3::identity(), &Vector3::new(0.0, 0.0, 0.5));

        // vision: camera sits on -Z of the board frame
        assert_relative_eq!(pair.vision.translation(), Vector3::new(0.0, 0.0, -0.5));
        // render: board frame Z flips, camera sits on +Z and looks down -Z
        assert_relative_eq!(pair.render.translation(), Vector3::new(0.0, 0.0, 0.5));
        assert_relative_eq!(pair.render.forward(), Vector3::new(0.0, 0.0, -1.0));
    }

    #[test]
    fn test_vision_pose_keeps_solver_rotation() {
        let r = sample_rotation();
        let pose = VisionPose::from_extrinsics(&r, &Vector3::new(0.0, 0.0, 0.4));
        assert_relative_eq!(pose.rotation(), r, epsilon = 1e-12);
    }

    #[test]
    fn test_vision_forward_uses_solver_rotation() {
        // camera yawed 30 degrees about the board's Y axis
        let r = Rotation3::from_axis_angle(&Vector3::y_axis(), 30f64.to_radians()).into_inner();
        let pose = VisionPose::from_extrinsics(&r, &Vector3::new(0.0, 0.0, 0.4));
        let (s, c) = 30f64.to_radians().sin_cos();
        assert_relative_eq!(pose.forward(), Vector3::new(-s, 0.0, -c), epsilon = 1e-12);
    }

    #[test]
    fn test_to_mat4_preserves_layout() {
        let pair = PosePair::from_extrinsics(&sample_rotation(), &Vector3::new(0.01, 0.02, 0.3));
        let m = pair.render.to_mat4();
        let t = pair.render.translation();
        assert_relative_eq!(m.w_axis.x, t.x as f32, epsilon = 1e-6);
        assert_relative_eq!(m.w_axis.y, t.y as f32, epsilon = 1e-6);
        assert_relative_eq!(m.w_axis.z, t.z as f32, epsilon = 1e-6);
        assert_relative_eq!(m.x_axis.y, pair.render.rotation()[(1, 0)] as f32, epsilon = 1e-6);
    }
}
