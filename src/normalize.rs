//! Pixel-space to normalized bounding boxes

use serde::{Deserialize, Serialize};

use crate::panorama::NormalizedBox;

/// Box corners in pixel coordinates of the decoded face image
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PixelBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl PixelBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &PixelBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Convert an XYXY pixel box to center/size fractions of the image.
///
/// Every component is clamped to `[0, 1]`. A non-positive image dimension
/// yields the zero box instead of dividing.
pub fn to_normalized_xywh(bbox: PixelBox, image_width: i64, image_height: i64) -> NormalizedBox {
    if image_width <= 0 || image_height <= 0 {
        return NormalizedBox::ZERO;
    }

    let width = image_width as f32;
    let height = image_height as f32;

    NormalizedBox {
        cx: unit((bbox.x1 + bbox.x2) / 2.0 / width),
        cy: unit((bbox.y1 + bbox.y2) / 2.0 / height),
        w: unit((bbox.x2 - bbox.x1) / width),
        h: unit((bbox.y2 - bbox.y1) / height),
    }
}

fn unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
