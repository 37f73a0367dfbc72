//! Bounding-box overlay rendering.
//!
//! Pure drawing: takes the current frame's classification and the detected
//! box, and strokes a rectangle onto an RGB canvas. Nothing is remembered
//! between frames.

use crate::geometry::{FrameClassification, FrameStatus};
use crate::types::BoundingBox;
use image::{Rgb, RgbImage};

pub const DEFAULT_LINE_WIDTH: u32 = 3;

/// Amber, used by the attendance kiosk.
pub const ATTENDANCE_READY: Rgb<u8> = Rgb([0xf5, 0x9e, 0x0b]);
/// Green, used during registration.
pub const REGISTRATION_READY: Rgb<u8> = Rgb([0x22, 0xc5, 0x5e]);
pub const WARNING: Rgb<u8> = Rgb([0xef, 0x44, 0x44]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayStyle {
    pub ready: Rgb<u8>,
    pub warning: Rgb<u8>,
    pub line_width: u32,
}

impl OverlayStyle {
    pub fn attendance() -> Self {
        Self {
            ready: ATTENDANCE_READY,
            warning: WARNING,
            line_width: DEFAULT_LINE_WIDTH,
        }
    }

    pub fn registration() -> Self {
        Self {
            ready: REGISTRATION_READY,
            ..Self::attendance()
        }
    }
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self::attendance()
    }
}

pub fn overlay_color(status: FrameStatus, style: &OverlayStyle) -> Rgb<u8> {
    if status.is_ready() {
        style.ready
    } else {
        style.warning
    }
}

/// Map a box from detector coordinates (`from` = width, height) onto a
/// canvas of size `to`.
pub fn scale_box(bbox: &BoundingBox, from: (u32, u32), to: (u32, u32)) -> BoundingBox {
    if from.0 == 0 || from.1 == 0 {
        return *bbox;
    }
    let sx = to.0 as f32 / from.0 as f32;
    let sy = to.1 as f32 / from.1 as f32;
    BoundingBox::new(bbox.x * sx, bbox.y * sy, bbox.width * sx, bbox.height * sy)
}

/// Stroke `bbox` onto `canvas` in the colour for `classification`.
///
/// The box is clipped to the canvas. Invalid boxes and boxes that miss the
/// canvas entirely draw nothing and the function returns `false`.
pub fn draw_overlay(
    canvas: &mut RgbImage,
    classification: &FrameClassification,
    bbox: &BoundingBox,
    style: &OverlayStyle,
) -> bool {
    if !bbox.is_valid() || bbox.width <= 0.0 || bbox.height <= 0.0 {
        return false;
    }
    let (cw, ch) = canvas.dimensions();
    if cw == 0 || ch == 0 {
        return false;
    }
    if bbox.x + bbox.width <= 0.0
        || bbox.y + bbox.height <= 0.0
        || bbox.x >= cw as f32
        || bbox.y >= ch as f32
    {
        return false;
    }

    let color = overlay_color(classification.status, style);
    let clamp_x = |v: f32| v.round().clamp(0.0, (cw - 1) as f32) as u32;
    let clamp_y = |v: f32| v.round().clamp(0.0, (ch - 1) as f32) as u32;

    let x0 = clamp_x(bbox.x);
    let y0 = clamp_y(bbox.y);
    let x1 = clamp_x(bbox.x + bbox.width - 1.0);
    let y1 = clamp_y(bbox.y + bbox.height - 1.0);
    let line = style.line_width.max(1);

    for y in y0..=y1 {
        for x in x0..=x1 {
            let on_edge = x < x0 + line || x + line > x1 || y < y0 + line || y + line > y1;
            if on_edge {
                canvas.put_pixel(x, y, color);
            }
        }
    }
    true
}
