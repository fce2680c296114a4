//! Per-pixel image compositing.

use image::{Rgb, RgbImage};

use super::RenderError;

/// Channel sum at or above which a rendered pixel counts as empty background.
pub const NEAR_WHITE_SUM: u16 = 763;

fn check_size(a: &RgbImage, b: &RgbImage) -> Result<(), RenderError> {
    if a.dimensions() != b.dimensions() {
        return Err(RenderError::SizeMismatch {
            expected: a.dimensions(),
            actual: b.dimensions(),
        });
    }
    Ok(())
}

/// Replace every near-white pixel of `rendered` with the pixel of `background`.
pub fn replace_near_white(rendered: &mut RgbImage, background: &RgbImage) -> Result<(), RenderError> {
    check_size(rendered, background)?;
    for (px, bg) in rendered.pixels_mut().zip(background.pixels()) {
        let sum: u16 = px.0.iter().map(|&c| c as u16).sum();
        if sum >= NEAR_WHITE_SUM {
            *px = *bg;
        }
    }
    Ok(())
}

/// `a * (1 - alpha) + b * alpha`, truncated to u8.
pub fn mix(a: &RgbImage, b: &RgbImage, alpha: f32) -> Result<RgbImage, RenderError> {
    check_size(a, b)?;
    let alpha = alpha.clamp(0.0, 1.0);
    let mut out = RgbImage::new(a.width(), a.height());
    for ((o, pa), pb) in out.pixels_mut().zip(a.pixels()).zip(b.pixels()) {
        for c in 0..3 {
            o.0[c] = (pa.0[c] as f32 * (1.0 - alpha) + pb.0[c] as f32 * alpha) as u8;
        }
    }
    Ok(out)
}

/// Saturating `a * wa + b * wb`.
pub fn add_weighted(a: &RgbImage, wa: f32, b: &RgbImage, wb: f32) -> Result<RgbImage, RenderError> {
    check_size(a, b)?;
    let mut out = RgbImage::new(a.width(), a.height());
    for ((o, pa), pb) in out.pixels_mut().zip(a.pixels()).zip(b.pixels()) {
        *o = Rgb(std::array::from_fn(|c| {
            (pa.0[c] as f32 * wa + pb.0[c] as f32 * wb).round().clamp(0.0, 255.0) as u8
        }));
    }
    Ok(out)
}
