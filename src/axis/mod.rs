//! Orientation indicator views.
//!
//! Three small plots show the camera's viewing direction projected onto the
//! front (X-Y), top (X-Z) and side (Z-Y) planes. Each plot keeps a persistent
//! canvas whose frame, crosshair and labels are drawn once; per frame only the
//! arrow is erased and redrawn.

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{Rgba, RgbImage, RgbaImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut, draw_polygon_mut, draw_text_mut, text_size};
use imageproc::point::Point;
use imageproc::rect::Rect;
use nalgebra::Vector3;

use crate::config::AppConfig;
use crate::pose::VisionPose;

pub const CANVAS_WIDTH: u32 = 300;
pub const CANVAS_HEIGHT: u32 = 200;
/// Data range on both axes is `-AXIS_RANGE..AXIS_RANGE`.
pub const AXIS_RANGE: f32 = 150.0;
/// Data units per unit of projected direction.
pub const ARROW_SCALE: f32 = 200.0;

const MARGIN_TOP: f32 = 20.0;
const MARGIN_BOTTOM: f32 = 18.0;

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);
const GUIDE: Rgba<u8> = Rgba([128, 128, 128, 255]);

const DASH_ON: f32 = 4.0;
const DASH_OFF: f32 = 3.0;

const SHAFT_HALF_WIDTH: f32 = 1.5;
const HEAD_LENGTH: f32 = 9.0;
const HEAD_HALF_WIDTH: f32 = 5.0;

const LABEL_SCALE: f32 = 11.0;
const TITLE_SCALE: f32 = 13.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisPlane {
    Front,
    Top,
    Side,
}

impl AxisPlane {
    /// Horizontal and vertical axis names.
    pub fn axis_names(self) -> (&'static str, &'static str) {
        match self {
            AxisPlane::Front => ("X", "Y"),
            AxisPlane::Top => ("X", "Z"),
            AxisPlane::Side => ("Z", "Y"),
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            AxisPlane::Front => "Front (X-Y)",
            AxisPlane::Top => "Top (X-Z)",
            AxisPlane::Side => "Side (Z-Y)",
        }
    }

    /// Plot coordinates of a 3D direction on this plane.
    pub fn project(self, v: &Vector3<f64>) -> (f32, f32) {
        let (x, y, z) = (v.x as f32, v.y as f32, v.z as f32);
        match self {
            AxisPlane::Front => (x, y),
            AxisPlane::Top => (x, z),
            AxisPlane::Side => (z, y),
        }
    }
}

/// Square, equal-aspect data area inside the canvas.
#[derive(Debug, Clone, Copy)]
struct PlotFrame {
    left: f32,
    top: f32,
    side: f32,
}

impl PlotFrame {
    fn fit(width: u32, height: u32) -> Self {
        let side = (height as f32 - MARGIN_TOP - MARGIN_BOTTOM).min(width as f32 - 2.0 * MARGIN_BOTTOM);
        Self {
            left: (width as f32 - side) / 2.0,
            top: MARGIN_TOP,
            side,
        }
    }

    fn to_pixel(&self, x: f32, y: f32) -> (f32, f32) {
        let s = self.side / (2.0 * AXIS_RANGE);
        (self.left + (x + AXIS_RANGE) * s, self.top + (AXIS_RANGE - y) * s)
    }
}

/// The single per-frame primitive on a plot, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArrowPrimitive {
    pub tail: (f32, f32),
    pub tip: (f32, f32),
}

impl ArrowPrimitive {
    pub fn length(&self) -> f32 {
        (self.tip.0 - self.tail.0).hypot(self.tip.1 - self.tail.1)
    }

    /// Pixel box covering everything `draw` may touch, clipped to the canvas.
    /// Returned as `(x0, y0, x1, y1)` with exclusive upper bounds.
    pub fn bounds(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let pad = HEAD_HALF_WIDTH + 2.0;
        let clip = |v: f32, max: u32| v.max(0.0).min(max as f32) as u32;
        (
            clip(self.tail.0.min(self.tip.0) - pad, width),
            clip(self.tail.1.min(self.tip.1) - pad, height),
            clip(self.tail.0.max(self.tip.0) + pad + 1.0, width),
            clip(self.tail.1.max(self.tip.1) + pad + 1.0, height),
        )
    }

    pub fn draw(&self, canvas: &mut RgbaImage) {
        let len = self.length();
        if len < 2.0 {
            return;
        }
        let dir = ((self.tip.0 - self.tail.0) / len, (self.tip.1 - self.tail.1) / len);
        let normal = (-dir.1, dir.0);
        let head = HEAD_LENGTH.min(len);
        let base = (self.tip.0 - dir.0 * head, self.tip.1 - dir.1 * head);
        let offset = |p: (f32, f32), w: f32| Point::new((p.0 + normal.0 * w).round() as i32, (p.1 + normal.1 * w).round() as i32);

        if len > head + 1.0 {
            let shaft = [
                offset(self.tail, SHAFT_HALF_WIDTH),
                offset(base, SHAFT_HALF_WIDTH),
                offset(base, -SHAFT_HALF_WIDTH),
                offset(self.tail, -SHAFT_HALF_WIDTH),
            ];
            fill_polygon(canvas, &shaft);
        }
        let tip = Point::new(self.tip.0.round() as i32, self.tip.1.round() as i32);
        fill_polygon(canvas, &[tip, offset(base, HEAD_HALF_WIDTH), offset(base, -HEAD_HALF_WIDTH)]);
    }
}

/// `draw_polygon_mut` rejects polygons that close on themselves.
fn fill_polygon(canvas: &mut RgbaImage, points: &[Point<i32>]) {
    if points.first() == points.last() {
        return;
    }
    draw_polygon_mut(canvas, points, BLACK);
}

fn draw_dashed_line(canvas: &mut RgbaImage, start: (f32, f32), end: (f32, f32)) {
    let len = (end.0 - start.0).hypot(end.1 - start.1);
    if len <= 0.0 {
        return;
    }
    let dir = ((end.0 - start.0) / len, (end.1 - start.1) / len);
    let mut t = 0.0;
    while t < len {
        let stop = (t + DASH_ON).min(len);
        draw_line_segment_mut(
            canvas,
            (start.0 + dir.0 * t, start.1 + dir.1 * t),
            (start.0 + dir.0 * stop, start.1 + dir.1 * stop),
            GUIDE,
        );
        t += DASH_ON + DASH_OFF;
    }
}

/// A persistent plot: static decorations plus at most one arrow.
pub struct PlotCanvas {
    plane: AxisPlane,
    frame: PlotFrame,
    pristine: RgbaImage,
    canvas: RgbaImage,
    arrow: Option<ArrowPrimitive>,
}

impl PlotCanvas {
    pub fn new(plane: AxisPlane, font: Option<&FontVec>) -> Self {
        let frame = PlotFrame::fit(CANVAS_WIDTH, CANVAS_HEIGHT);
        let mut pristine = RgbaImage::from_pixel(CANVAS_WIDTH, CANVAS_HEIGHT, WHITE);

        let (x0, y0) = frame.to_pixel(-AXIS_RANGE, AXIS_RANGE);
        let side = frame.side.round() as u32;
        draw_hollow_rect_mut(
            &mut pristine,
            Rect::at(x0.round() as i32, y0.round() as i32).of_size(side + 1, side + 1),
            BLACK,
        );

        let (ox, oy) = frame.to_pixel(0.0, 0.0);
        let (left, _) = frame.to_pixel(-AXIS_RANGE, 0.0);
        let (right, _) = frame.to_pixel(AXIS_RANGE, 0.0);
        let (_, top) = frame.to_pixel(0.0, AXIS_RANGE);
        let (_, bottom) = frame.to_pixel(0.0, -AXIS_RANGE);
        draw_dashed_line(&mut pristine, (left + 1.0, oy), (right - 1.0, oy));
        draw_dashed_line(&mut pristine, (ox, top + 1.0), (ox, bottom - 1.0));

        if let Some(font) = font {
            draw_labels(&mut pristine, &frame, plane, font);
        }

        Self {
            plane,
            frame,
            canvas: pristine.clone(),
            pristine,
            arrow: None,
        }
    }

    pub fn plane(&self) -> AxisPlane {
        self.plane
    }

    pub fn arrow(&self) -> Option<&ArrowPrimitive> {
        self.arrow.as_ref()
    }

    /// The static decorations without any arrow.
    pub fn decorations(&self) -> &RgbaImage {
        &self.pristine
    }

    /// Erase the current arrow by restoring its box from the decorations.
    pub fn clear_arrow(&mut self) {
        let Some(arrow) = self.arrow.take() else {
            return;
        };
        let (x0, y0, x1, y1) = arrow.bounds(CANVAS_WIDTH, CANVAS_HEIGHT);
        for y in y0..y1 {
            for x in x0..x1 {
                self.canvas.put_pixel(x, y, *self.pristine.get_pixel(x, y));
            }
        }
    }

    /// Replace the arrow with one spanning `-d/2..d/2` around the origin,
    /// `d = direction * ARROW_SCALE` in data units.
    pub fn set_arrow(&mut self, direction: (f32, f32)) {
        self.clear_arrow();
        let half = (direction.0 * ARROW_SCALE / 2.0, direction.1 * ARROW_SCALE / 2.0);
        let arrow = ArrowPrimitive {
            tail: self.frame.to_pixel(-half.0, -half.1),
            tip: self.frame.to_pixel(half.0, half.1),
        };
        arrow.draw(&mut self.canvas);
        self.arrow = Some(arrow);
    }

    /// Current canvas with the alpha channel dropped.
    pub fn to_rgb(&self) -> RgbImage {
        RgbImage::from_fn(CANVAS_WIDTH, CANVAS_HEIGHT, |x, y| {
            let [r, g, b, _] = self.canvas.get_pixel(x, y).0;
            image::Rgb([r, g, b])
        })
    }
}

fn draw_labels(canvas: &mut RgbaImage, frame: &PlotFrame, plane: AxisPlane, font: &FontVec) {
    let label = PxScale::from(LABEL_SCALE);
    let (h, v) = plane.axis_names();
    let (left, top) = frame.to_pixel(-AXIS_RANGE, AXIS_RANGE);
    let (right, bottom) = frame.to_pixel(AXIS_RANGE, -AXIS_RANGE);

    let below = bottom as i32 + 3;
    let h_minus = format!("{}-", h);
    let h_plus = format!("{}+", h);
    let (w_plus, _) = text_size(label, font, &h_plus);
    draw_text_mut(canvas, BLACK, left as i32, below, label, font, &h_minus);
    draw_text_mut(canvas, BLACK, right as i32 - w_plus as i32, below, label, font, &h_plus);

    let v_plus = format!("{}+", v);
    let v_minus = format!("{}-", v);
    let (w_v, h_v) = text_size(label, font, &v_plus);
    let beside = left as i32 - w_v as i32 - 4;
    draw_text_mut(canvas, BLACK, beside, top as i32, label, font, &v_plus);
    draw_text_mut(canvas, BLACK, beside, bottom as i32 - h_v as i32, label, font, &v_minus);

    let title = PxScale::from(TITLE_SCALE);
    let (w_t, _) = text_size(title, font, plane.title());
    draw_text_mut(
        canvas,
        BLACK,
        (CANVAS_WIDTH as i32 - w_t as i32) / 2,
        3,
        title,
        font,
        plane.title(),
    );
}

fn load_font(path: &Path) -> Option<FontVec> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("Axis font {} unreadable ({}), labels disabled", path.display(), e);
            return None;
        }
    };
    match FontVec::try_from_vec(bytes) {
        Ok(font) => Some(font),
        Err(e) => {
            log::warn!("Axis font {} invalid ({}), labels disabled", path.display(), e);
            None
        }
    }
}

/// Owns the three plots and updates them from a vision pose.
pub struct AxisViewGenerator {
    front: PlotCanvas,
    top: PlotCanvas,
    side: PlotCanvas,
}

impl AxisViewGenerator {
    pub fn new(config: &AppConfig) -> Self {
        let font = config.axis_font_path.as_deref().and_then(load_font);
        Self::with_font(font.as_ref())
    }

    pub fn with_font(font: Option<&FontVec>) -> Self {
        Self {
            front: PlotCanvas::new(AxisPlane::Front, font),
            top: PlotCanvas::new(AxisPlane::Top, font),
            side: PlotCanvas::new(AxisPlane::Side, font),
        }
    }

    pub fn plots(&self) -> [&PlotCanvas; 3] {
        [&self.front, &self.top, &self.side]
    }

    /// Front, top and side images for the camera's viewing direction.
    pub fn create_axis_views(&mut self, pose: &VisionPose) -> (RgbImage, RgbImage, RgbImage) {
        let forward = pose.forward();
        for plot in [&mut self.front, &mut self.top, &mut self.side] {
            let projection = plot.plane().project(&forward);
            plot.set_arrow(projection);
        }
        (self.front.to_rgb(), self.top.to_rgb(), self.side.to_rgb())
    }
}
