//! Configuration and serialization module.
//!
//! The configuration is a flat JSON object. Every key is optional: anything
//! missing falls back to the built-in default, so older or hand-written files
//! keep loading. Saving only happens when asked for.

use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pose::{CalibrationPattern, CameraIntrinsics};

/// Errors raised while loading, saving or validating a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read or write config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Capture device index.
    #[serde(default)]
    pub camera_id: u32,
    /// Requested capture resolution (width, height).
    #[serde(default = "default_camera_resolution")]
    pub camera_resolution: [u32; 2],
    /// Requested capture frame rate.
    #[serde(default = "default_camera_fps")]
    pub camera_fps: u32,
    /// Draw the centre marker and the calibration overlay on the raw feed.
    #[serde(default = "default_camera_test")]
    pub camera_test: bool,

    /// Inner corner count (columns, rows).
    #[serde(default = "default_chessboard_size")]
    pub chessboard_size: [u32; 2],
    /// Edge length of one chessboard square in metres.
    #[serde(default = "default_square_size")]
    pub chessboard_square_size: f64,
    /// Row-major corner indices used for pose solving.
    #[serde(default = "default_selected_indices")]
    pub selected_indices: Vec<usize>,

    /// Focal length in pixels (both axes).
    #[serde(default = "default_focal_length")]
    pub focal_length: f64,

    /// Offscreen render resolution (width, height).
    #[serde(default = "default_render_size")]
    pub render_size: [u32; 2],
    /// Vertical field of view of the AR composite viewpoint, radians.
    #[serde(default = "default_render_yfov")]
    pub render_yfov: f64,
    /// Vertical field of view of the tooth preview as a fraction of pi.
    #[serde(default = "default_teeth_fov")]
    pub teeth_fov: f64,

    /// Head mesh offset from the chessboard origin (render frame, metres).
    #[serde(default = "default_head_translation")]
    pub head_translation: [f32; 3],
    /// Uniform head mesh scale.
    #[serde(default = "default_scale")]
    pub head_scale: f32,
    /// Teeth mesh offset from the chessboard origin (render frame, metres).
    #[serde(default = "default_teeth_translation")]
    pub teeth_translation: [f32; 3],
    /// Uniform teeth mesh scale.
    #[serde(default = "default_scale")]
    pub teeth_scale: f32,

    /// Face weight when mixing the precomputed background.
    #[serde(default = "default_mixed_alpha")]
    pub mixed_alpha: f32,
    /// Length of the camera marker in metres.
    #[serde(default = "default_arrow_length")]
    pub arrow_length: f32,
    /// Where the ray indicator is parked when the ray misses the model.
    #[serde(default = "default_far_position")]
    pub indicator_far_position: [f32; 3],
    /// Directional light intensity for lit scenes (0..1).
    #[serde(default = "default_light_intensity")]
    pub light_intensity: f32,

    /// Display refresh rate used by the consumer.
    #[serde(default = "default_ui_fps")]
    pub ui_fps: u32,

    /// Directory holding the preprocessed mesh assets.
    #[serde(default = "default_mesh_dir")]
    pub mesh_dir: PathBuf,
    /// TrueType font for axis view labels. Labels are skipped when unset.
    #[serde(default)]
    pub axis_font_path: Option<PathBuf>,
}

fn default_camera_resolution() -> [u32; 2] {
    [1920, 1080]
}
fn default_camera_fps() -> u32 {
    30
}
fn default_camera_test() -> bool {
    true
}
fn default_chessboard_size() -> [u32; 2] {
    [10, 7]
}
fn default_square_size() -> f64 {
    0.01
}
fn default_selected_indices() -> Vec<usize> {
    (20..50).collect()
}
fn default_focal_length() -> f64 {
    1400.0 // ~5mm sensor
}
fn default_render_size() -> [u32; 2] {
    [640, 480]
}
fn default_render_yfov() -> f64 {
    PI / 3.0
}
fn default_teeth_fov() -> f64 {
    0.25
}
fn default_head_translation() -> [f32; 3] {
    [0.045, -0.02, 0.0]
}
fn default_teeth_translation() -> [f32; 3] {
    [0.045, -0.03, 0.0]
}
fn default_scale() -> f32 {
    1.0
}
fn default_mixed_alpha() -> f32 {
    0.5
}
fn default_arrow_length() -> f32 {
    0.1
}
fn default_far_position() -> [f32; 3] {
    [0.0, 0.0, 10.0]
}
fn default_light_intensity() -> f32 {
    1.0
}
fn default_ui_fps() -> u32 {
    60
}
fn default_mesh_dir() -> PathBuf {
    PathBuf::from("data/mesh")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            camera_id: 0,
            camera_resolution: default_camera_resolution(),
            camera_fps: default_camera_fps(),
            camera_test: default_camera_test(),
            chessboard_size: default_chessboard_size(),
            chessboard_square_size: default_square_size(),
            selected_indices: default_selected_indices(),
            focal_length: default_focal_length(),
            render_size: default_render_size(),
            render_yfov: default_render_yfov(),
            teeth_fov: default_teeth_fov(),
            head_translation: default_head_translation(),
            head_scale: default_scale(),
            teeth_translation: default_teeth_translation(),
            teeth_scale: default_scale(),
            mixed_alpha: default_mixed_alpha(),
            arrow_length: default_arrow_length(),
            indicator_far_position: default_far_position(),
            light_intensity: default_light_intensity(),
            ui_fps: default_ui_fps(),
            mesh_dir: default_mesh_dir(),
            axis_font_path: None,
        }
    }
}

impl AppConfig {
    /// Parse a configuration from a JSON string.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&text)?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a file, using defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            log::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save configuration as pretty-printed JSON.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Check value ranges and cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let [cols, rows] = self.chessboard_size;
        if cols < 2 || rows < 2 {
            return Err(ConfigError::Invalid(format!(
                "chessboard_size must be at least 2x2, got {}x{}",
                cols, rows
            )));
        }
        if self.chessboard_square_size <= 0.0 {
            return Err(ConfigError::Invalid(
                "chessboard_square_size must be positive".to_string(),
            ));
        }
        if self.selected_indices.len() < 4 {
            return Err(ConfigError::Invalid(format!(
                "pose solving needs at least 4 selected corners, got {}",
                self.selected_indices.len()
            )));
        }
        let corner_count = (cols * rows) as usize;
        if let Some(bad) = self.selected_indices.iter().find(|&&i| i >= corner_count) {
            return Err(ConfigError::Invalid(format!(
                "selected corner index {} outside {}x{} grid",
                bad, cols, rows
            )));
        }
        if self.focal_length <= 0.0 {
            return Err(ConfigError::Invalid("focal_length must be positive".to_string()));
        }
        if self.camera_resolution.contains(&0) || self.render_size.contains(&0) {
            return Err(ConfigError::Invalid("resolutions must be non-zero".to_string()));
        }
        if self.camera_fps == 0 || self.ui_fps == 0 {
            return Err(ConfigError::Invalid("frame rates must be non-zero".to_string()));
        }
        if !(0.0..=1.0).contains(&self.mixed_alpha) {
            return Err(ConfigError::Invalid("mixed_alpha must be within 0..1".to_string()));
        }
        Ok(())
    }

    /// Calibration pattern described by the chessboard keys.
    pub fn pattern(&self) -> CalibrationPattern {
        CalibrationPattern::new(
            self.chessboard_size[0] as usize,
            self.chessboard_size[1] as usize,
            self.chessboard_square_size,
            self.selected_indices.clone(),
        )
    }

    /// Pinhole intrinsics with the principal point at the image centre.
    pub fn intrinsics(&self) -> CameraIntrinsics {
        CameraIntrinsics::new(
            self.focal_length,
            self.focal_length,
            self.camera_resolution[0] as f64 / 2.0,
            self.camera_resolution[1] as f64 / 2.0,
        )
    }

    /// Vertical field of view of the physical camera, radians.
    pub fn camera_yfov(&self) -> f64 {
        2.0 * (self.camera_resolution[1] as f64 / 2.0 / self.focal_length).atan()
    }

    /// Width over height of the capture resolution.
    pub fn camera_aspect(&self) -> f32 {
        self.camera_resolution[0] as f32 / self.camera_resolution[1] as f32
    }

    /// Width over height of the render resolution.
    pub fn render_aspect(&self) -> f32 {
        self.render_size[0] as f32 / self.render_size[1] as f32
    }

    /// Vertical field of view of the tooth preview, radians.
    pub fn teeth_yfov(&self) -> f64 {
        PI * self.teeth_fov
    }

    /// Centre of the inner-corner grid in the render frame (Y up).
    pub fn chessboard_center(&self) -> Vec3 {
        let sq = self.chessboard_square_size as f32;
        Vec3::new(
            (self.chessboard_size[0] as f32 - 1.0) * sq / 2.0,
            -(self.chessboard_size[1] as f32 - 1.0) * sq / 2.0,
            0.0,
        )
    }

    /// Fixed viewpoint of the AR composite: above the chessboard centre.
    pub fn composite_camera_pose(&self) -> Mat4 {
        Mat4::from_translation(self.chessboard_center() + Vec3::new(0.0, 0.0, 0.5))
    }

    /// Static alignment of the head mesh relative to the chessboard origin.
    pub fn head_matrix(&self) -> Mat4 {
        alignment_matrix(self.head_translation, self.head_scale)
    }

    /// Static alignment of both teeth meshes relative to the chessboard origin.
    pub fn teeth_matrix(&self) -> Mat4 {
        alignment_matrix(self.teeth_translation, self.teeth_scale)
    }

    /// Interval between consumer polls.
    pub fn ui_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.ui_fps.max(1) as f64)
    }
}

fn alignment_matrix(translation: [f32; 3], scale: f32) -> Mat4 {
    Mat4::from_scale_rotation_translation(
        Vec3::splat(scale),
        glam::Quat::IDENTITY,
        Vec3::from_array(translation),
    )
}
