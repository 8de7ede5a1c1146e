//! Panorama and detection data model
//!
//! A panorama is a cubemap: up to six face images, one per viewing
//! direction. Panoramas are written by the ingestion tooling and only read
//! here; detections are owned by this crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// One of the six cubemap viewing directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Face {
    Front,
    Back,
    Left,
    Right,
    Top,
    Bottom,
}

impl Face {
    /// Processing order for a panorama's faces
    pub const ALL: [Face; 6] = [
        Face::Front,
        Face::Back,
        Face::Left,
        Face::Right,
        Face::Top,
        Face::Bottom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Face::Front => "front",
            Face::Back => "back",
            Face::Left => "left",
            Face::Right => "right",
            Face::Top => "top",
            Face::Bottom => "bottom",
        }
    }
}

impl fmt::Display for Face {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Face {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "front" => Ok(Face::Front),
            "back" => Ok(Face::Back),
            "left" => Ok(Face::Left),
            "right" => Ok(Face::Right),
            "top" => Ok(Face::Top),
            "bottom" => Ok(Face::Bottom),
            other => Err(StoreError::InvalidFace(other.to_string())),
        }
    }
}

/// Panorama row metadata, without the image payloads
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PanoramaInfo {
    pub id: i64,
    pub level: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub heading_deg: Option<f64>,
    pub captured_at: Option<String>,
    pub image_content_type: Option<String>,
    pub image_byte_length: Option<i64>,
    /// Faces whose image column is non-null, in `Face::ALL` order
    pub faces_present: Vec<Face>,
}

impl PanoramaInfo {
    pub fn has_face(&self, face: Face) -> bool {
        self.faces_present.contains(&face)
    }
}

/// Bounding box as fractions of the image: center x, center y, width, height
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizedBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

impl NormalizedBox {
    pub const ZERO: NormalizedBox = NormalizedBox {
        cx: 0.0,
        cy: 0.0,
        w: 0.0,
        h: 0.0,
    };

    pub fn to_array(&self) -> [f32; 4] {
        [self.cx, self.cy, self.w, self.h]
    }

    pub fn from_array(values: [f32; 4]) -> Self {
        Self {
            cx: values[0],
            cy: values[1],
            w: values[2],
            h: values[3],
        }
    }
}

/// A finished detection, ready to be written for a (panorama, model version) pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewDetection {
    /// Label in the model's own vocabulary
    pub class_label: String,
    pub display_label: String,
    pub confidence: f32,
    pub face: Face,
    pub bbox: NormalizedBox,
    pub mask_ref: Option<String>,
    /// Taxonomy category/description
    pub aux: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A committed detection row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDetection {
    pub id: i64,
    pub panorama_id: i64,
    pub model_version: String,
    pub class_label: String,
    pub display_label: String,
    pub confidence: f32,
    pub face: Face,
    pub bbox: NormalizedBox,
    pub mask_ref: Option<String>,
    pub aux: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Human-readable form of a raw model label: `light_fixture` -> `Light Fixture`
pub fn display_label(raw: &str) -> String {
    raw.split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
