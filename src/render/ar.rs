//! The three AR scenes and their per-frame updates.

use glam::{Mat4, Vec3};
use image::RgbImage;

use super::composite::{mix, replace_near_white};
use super::mesh::{SceneAssets, TriMesh};
use super::raycast::{cast_nearest, Ray};
use super::scene::{Material, NodeId, PerspectiveCamera, Scene, Shading};
use super::{Rasterizer, RenderError, SceneRenderer};
use crate::config::AppConfig;
use crate::pose::RenderPose;

const WHITE: [u8; 3] = [255, 255, 255];
const BLACK: [u8; 3] = [0, 0, 0];

const MARKER_RADIUS: f32 = 0.01;
const INDICATOR_RADIUS: f32 = 0.004;
const BOARD_THICKNESS: f32 = 0.001;

/// [`SceneRenderer`] backed by any [`Rasterizer`].
///
/// Scenes are built once in [`ArSceneRenderer::new`]; each render call only
/// moves the camera, light, marker and indicator nodes.
pub struct ArSceneRenderer<R: Rasterizer> {
    rasterizer: R,
    tooth_scene: Scene,
    camera_scene: Scene,
    board_scene: Scene,
    marker: NodeId,
    indicator: NodeId,
    /// Face and teeth, rendered once from the composite viewpoint.
    background: RgbImage,
    /// Teeth surface in its own model frame, for ray casting.
    teeth_mesh: TriMesh,
    teeth_matrix: Mat4,
    teeth_inverse: Mat4,
    far_position: Vec3,
    indicator_position: Vec3,
    released: bool,
}

impl<R: Rasterizer> ArSceneRenderer<R> {
    pub fn new(mut rasterizer: R, assets: SceneAssets, config: &AppConfig) -> Result<Self, RenderError> {
        let head = rasterizer.upload_mesh(&assets.head)?;
        let teeth = rasterizer.upload_mesh(&assets.teeth)?;
        let teeth_eroded = rasterizer.upload_mesh(&assets.teeth_eroded)?;
        let marker_mesh =
            rasterizer.upload_mesh(&TriMesh::cylinder(MARKER_RADIUS, config.arrow_length, 24))?;
        let indicator_mesh = rasterizer.upload_mesh(&TriMesh::uv_sphere(INDICATOR_RADIUS, 12, 24))?;

        let [cols, rows] = config.chessboard_size;
        let sq = config.chessboard_square_size as f32;
        let board_mesh = rasterizer.upload_mesh(&TriMesh::cuboid(Vec3::new(
            (cols as f32 + 1.0) * sq,
            (rows as f32 + 1.0) * sq,
            BOARD_THICKNESS,
        )))?;

        let head_matrix = config.head_matrix();
        let teeth_matrix = config.teeth_matrix();
        let composite_pose = config.composite_camera_pose();
        let render_yfov = config.render_yfov as f32;
        let render_aspect = config.render_aspect();

        // intraoral preview
        let mut tooth_scene = Scene::new(
            WHITE,
            PerspectiveCamera::new(config.teeth_yfov() as f32, render_aspect),
            Shading::Flat,
        );
        tooth_scene.light.intensity = config.light_intensity;
        tooth_scene.add_node(teeth, Material::translucent(0.285, 0.276, 0.255, 0.5), teeth_matrix);
        tooth_scene.add_node(teeth_eroded, Material::opaque(0.21, 0.21, 0.21), teeth_matrix);

        // camera marker over the static background
        let far_position = Vec3::from_array(config.indicator_far_position);
        let mut camera_scene = Scene::new(
            WHITE,
            PerspectiveCamera::new(render_yfov, render_aspect),
            Shading::Lit,
        );
        camera_scene.light.intensity = config.light_intensity;
        camera_scene.set_camera_pose(composite_pose);
        camera_scene.set_light_pose(composite_pose);
        let marker = camera_scene.add_node(marker_mesh, Material::opaque(1.0, 1.0, 0.0), Mat4::IDENTITY);
        let indicator = camera_scene.add_node(
            indicator_mesh,
            Material::opaque(1.0, 0.0, 0.0),
            Mat4::from_translation(far_position),
        );

        // calibration overlay, seen through the physical camera's lens
        let mut board_scene = Scene::new(
            BLACK,
            PerspectiveCamera::new(config.camera_yfov() as f32, config.camera_aspect()),
            Shading::Flat,
        );
        let board_offset = Vec3::new(
            (cols as f32 - 1.0) * sq / 2.0,
            -(rows as f32 - 1.0) * sq / 2.0,
            0.0,
        );
        board_scene.add_node(
            board_mesh,
            Material::translucent(0.0, 1.0, 0.0, 0.5),
            Mat4::from_translation(board_offset),
        );

        let background = render_background(
            &mut rasterizer,
            config,
            head,
            teeth,
            head_matrix,
            teeth_matrix,
            composite_pose,
        )?;

        log::info!(
            "AR scenes ready ({}x{}, {} teeth triangles)",
            background.width(),
            background.height(),
            assets.teeth.triangle_count()
        );

        Ok(Self {
            rasterizer,
            tooth_scene,
            camera_scene,
            board_scene,
            marker,
            indicator,
            background,
            teeth_mesh: assets.teeth,
            teeth_matrix,
            teeth_inverse: teeth_matrix.inverse(),
            far_position,
            indicator_position: far_position,
            released: false,
        })
    }

    /// The precomputed face and teeth image the composite falls back to.
    pub fn background(&self) -> &RgbImage {
        &self.background
    }

    /// Where the indicator was placed by the last composite render.
    pub fn indicator_position(&self) -> Vec3 {
        self.indicator_position
    }

    /// Nearest point where the camera's viewing ray meets the teeth surface.
    ///
    /// The ray is moved into the mesh's model frame, cast, and the hit is
    /// moved back into the world frame.
    pub fn cast_camera_ray(&self, pose: &RenderPose) -> Option<Vec3> {
        let origin = pose.translation();
        let forward = pose.forward();
        let origin = Vec3::new(origin.x as f32, origin.y as f32, origin.z as f32);
        let forward = Vec3::new(forward.x as f32, forward.y as f32, forward.z as f32);

        let ray = Ray::new(
            self.teeth_inverse.transform_point3(origin),
            self.teeth_inverse.transform_vector3(forward),
        );
        cast_nearest(&self.teeth_mesh, &ray).map(|hit| self.teeth_matrix.transform_point3(hit.point))
    }

    fn ensure_live(&self) -> Result<(), RenderError> {
        if self.released {
            Err(RenderError::Released)
        } else {
            Ok(())
        }
    }
}

fn render_background<R: Rasterizer>(
    rasterizer: &mut R,
    config: &AppConfig,
    head: super::MeshHandle,
    teeth: super::MeshHandle,
    head_matrix: Mat4,
    teeth_matrix: Mat4,
    camera_pose: Mat4,
) -> Result<RgbImage, RenderError> {
    let camera = PerspectiveCamera::new(config.render_yfov as f32, config.render_aspect());
    let lit_scene = || {
        let mut scene = Scene::new(WHITE, camera, Shading::Lit);
        scene.light.intensity = config.light_intensity;
        scene.set_camera_pose(camera_pose);
        scene.set_light_pose(camera_pose);
        scene
    };

    let mut face_scene = lit_scene();
    face_scene.add_node(head, Material::opaque(0.82, 0.71, 0.59), head_matrix);
    let face = rasterizer.draw(&face_scene)?;

    let mut teeth_scene = lit_scene();
    teeth_scene.add_node(teeth, Material::opaque(0.95, 0.92, 0.85), teeth_matrix);
    let tooth = rasterizer.draw(&teeth_scene)?;

    mix(&tooth, &face, config.mixed_alpha)
}

impl<R: Rasterizer> SceneRenderer for ArSceneRenderer<R> {
    fn render_tooth(&mut self, pose: &RenderPose) -> Result<RgbImage, RenderError> {
        self.ensure_live()?;
        let m = pose.to_mat4();
        self.tooth_scene.set_camera_pose(m);
        self.tooth_scene.set_light_pose(m);
        self.rasterizer.draw(&self.tooth_scene)
    }

    fn render_camera_composite(&mut self, pose: &RenderPose) -> Result<RgbImage, RenderError> {
        self.ensure_live()?;
        self.camera_scene.set_node_pose(self.marker, pose.to_mat4());

        self.indicator_position = self.cast_camera_ray(pose).unwrap_or(self.far_position);
        self.camera_scene
            .set_node_pose(self.indicator, Mat4::from_translation(self.indicator_position));

        let mut image = self.rasterizer.draw(&self.camera_scene)?;
        replace_near_white(&mut image, &self.background)?;
        Ok(image)
    }

    fn render_chessboard(&mut self, pose: &RenderPose) -> Result<RgbImage, RenderError> {
        self.ensure_live()?;
        self.board_scene.set_camera_pose(pose.to_mat4());
        self.rasterizer.draw(&self.board_scene)
    }

    fn cleanup(&mut self) {
        if self.released {
            return;
        }
        self.rasterizer.release();
        self.released = true;
        log::info!("Scene renderer released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::MeshHandle;
    use image::Rgb;
    use nalgebra::{Matrix4, Vector3};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Paints the scene background and writes the first node's colour at (0, 0).
    struct RecordingRasterizer {
        size: (u32, u32),
        uploads: u32,
        camera_poses: Arc<Mutex<Vec<Mat4>>>,
        releases: Arc<AtomicUsize>,
    }

    impl RecordingRasterizer {
        fn new() -> Self {
            Self {
                size: (8, 6),
                uploads: 0,
                camera_poses: Arc::new(Mutex::new(Vec::new())),
                releases: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Rasterizer for RecordingRasterizer {
        fn upload_mesh(&mut self, _mesh: &TriMesh) -> Result<MeshHandle, RenderError> {
            self.uploads += 1;
            Ok(MeshHandle(self.uploads - 1))
        }

        fn draw(&mut self, scene: &Scene) -> Result<RgbImage, RenderError> {
            self.camera_poses.lock().push(scene.camera_pose());
            let mut image = RgbImage::from_pixel(self.size.0, self.size.1, Rgb(scene.background));
            if let Some(node) = scene.draw_order().next() {
                let c = node.material.color;
                image.put_pixel(
                    0,
                    0,
                    Rgb([(c.x * 255.0) as u8, (c.y * 255.0) as u8, (c.z * 255.0) as u8]),
                );
            }
            Ok(image)
        }

        fn size(&self) -> (u32, u32) {
            self.size
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn assets() -> SceneAssets {
        SceneAssets {
            head: TriMesh::uv_sphere(0.08, 8, 16),
            teeth: TriMesh::uv_sphere(0.01, 16, 32),
            teeth_eroded: TriMesh::uv_sphere(0.009, 8, 16),
        }
    }

    fn camera_at(x: f64, y: f64, z: f64) -> RenderPose {
        RenderPose::from_matrix(Matrix4::new_translation(&Vector3::new(x, y, z)))
    }

    #[test]
    fn test_background_mixes_face_and_teeth() {
        let config = AppConfig::default();
        let renderer = ArSceneRenderer::new(RecordingRasterizer::new(), assets(), &config).unwrap();
        let bg = renderer.background();
        // (0.95*255*0.5 + 0.82*255*0.5) truncated
        assert_eq!(bg.get_pixel(0, 0).0[0], 225);
        assert_eq!(bg.get_pixel(3, 3), &Rgb(WHITE));
    }

    #[test]
    fn test_composite_keeps_marker_and_takes_background() {
        let config = AppConfig::default();
        let mut renderer =
            ArSceneRenderer::new(RecordingRasterizer::new(), assets(), &config).unwrap();
        let out = renderer.render_camera_composite(&camera_at(0.0, 0.0, 0.3)).unwrap();

        assert_eq!(out.get_pixel(0, 0), &Rgb([255, 255, 0]));
        assert_eq!(out.get_pixel(5, 4), renderer.background().get_pixel(5, 4));
    }

    #[test]
    fn test_indicator_follows_ray_hit() {
        let mut config = AppConfig::default();
        config.teeth_translation = [0.045, -0.03, 0.0];
        let mut renderer =
            ArSceneRenderer::new(RecordingRasterizer::new(), assets(), &config).unwrap();

        renderer
            .render_camera_composite(&camera_at(0.045, -0.03, 0.1))
            .unwrap();
        let hit = renderer.indicator_position();
        assert!((hit - Vec3::new(0.045, -0.03, 0.01)).length() < 1e-4, "{:?}", hit);
    }

    #[test]
    fn test_indicator_parks_on_miss() {
        let config = AppConfig::default();
        let mut renderer =
            ArSceneRenderer::new(RecordingRasterizer::new(), assets(), &config).unwrap();

        renderer.render_camera_composite(&camera_at(1.0, 1.0, 0.1)).unwrap();
        assert_eq!(renderer.indicator_position(), Vec3::new(0.0, 0.0, 10.0));
        assert!(renderer.cast_camera_ray(&camera_at(1.0, 1.0, 0.1)).is_none());
    }

    #[test]
    fn test_tooth_camera_uses_render_pose_as_is() {
        let config = AppConfig::default();
        let rasterizer = RecordingRasterizer::new();
        let poses = Arc::clone(&rasterizer.camera_poses);
        let mut renderer = ArSceneRenderer::new(rasterizer, assets(), &config).unwrap();

        let pose = camera_at(0.01, 0.02, 0.25);
        renderer.render_tooth(&pose).unwrap();
        renderer.render_chessboard(&pose).unwrap();

        let poses = poses.lock();
        let n = poses.len();
        assert_eq!(poses[n - 2], pose.to_mat4());
        assert_eq!(poses[n - 1], pose.to_mat4());
    }

    #[test]
    fn test_cleanup_runs_once() {
        let config = AppConfig::default();
        let rasterizer = RecordingRasterizer::new();
        let releases = Arc::clone(&rasterizer.releases);
        let mut renderer = ArSceneRenderer::new(rasterizer, assets(), &config).unwrap();

        renderer.cleanup();
        renderer.cleanup();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(matches!(
            renderer.render_tooth(&camera_at(0.0, 0.0, 0.3)),
            Err(RenderError::Released)
        ));
    }
}
