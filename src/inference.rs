//! Inference Engine
//!
//! Decodes face images and runs the object detector over them.
//!
//! Architecture:
//! - `Detector` is the model seam; the engine owns one detector, built once
//!   at startup and injected, so tests can substitute a scripted model
//! - `YoloDetector` runs a YOLOv8-style ONNX export through ONNX Runtime
//! - Boxes leave the engine in pixel coordinates of the decoded image

use image::{imageops, ImageBuffer, Rgb, RgbImage};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use ort::session::Session;
use ort::value::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::InferenceError;
use crate::metrics;
use crate::normalize::PixelBox;

pub type Result<T> = std::result::Result<T, InferenceError>;

/// COCO class names (80 classes), used when no labels file is configured
pub const COCO_CLASSES: &[&str] = &[
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat",
    "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack",
    "umbrella", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball",
    "kite", "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket",
    "bottle", "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple",
    "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair",
    "couch", "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
    "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator",
    "book", "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// Gray used to pad letterboxed inputs
const LETTERBOX_FILL: Rgb<u8> = Rgb([114, 114, 114]);

// ============================================================================
// Data Models
// ============================================================================

/// Decoded RGB pixel buffer of one face
#[derive(Debug, Clone)]
pub struct DecodedImage {
    rgb: RgbImage,
}

impl DecodedImage {
    pub fn from_rgb(rgb: RgbImage) -> Self {
        Self { rgb }
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.rgb
    }
}

/// One box straight out of the detector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub class_id: u32,
    pub confidence: f32,
    pub bbox: PixelBox,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YoloParams {
    pub input_size: u32,
    /// Scores below this are dropped inside the detector
    pub score_floor: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    /// Classes in the model head; 0 when unknown. Used to tell the output
    /// layouts apart when the box count is small.
    #[serde(default)]
    pub num_classes: usize,
}

impl Default for YoloParams {
    fn default() -> Self {
        Self {
            input_size: 640,
            score_floor: 0.25,
            iou_threshold: 0.45,
            max_detections: 300,
            num_classes: 0,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// An object detection model: pixels in, boxes out
pub trait Detector: Send {
    fn detect(&mut self, image: &DecodedImage) -> Result<Vec<RawDetection>>;

    /// Raw vocabulary label for a class id, if the model knows it
    fn class_name(&self, class_id: u32) -> Option<&str>;
}

/// Owns the process-wide detector
pub struct InferenceEngine<D: Detector> {
    detector: D,
}

impl<D: Detector> InferenceEngine<D> {
    pub fn new(detector: D) -> Self {
        Self { detector }
    }

    pub fn decode(bytes: &[u8]) -> Result<DecodedImage> {
        decode(bytes)
    }

    pub fn infer(&mut self, image: &DecodedImage) -> Result<Vec<RawDetection>> {
        let start = Instant::now();
        let detections = self.detector.detect(image)?;
        let elapsed = start.elapsed();
        metrics::INFERENCE_LATENCY.observe(elapsed.as_secs_f64());
        debug!(
            width = image.width(),
            height = image.height(),
            boxes = detections.len(),
            latency_ms = elapsed.as_millis() as u64,
            "Inference completed"
        );
        Ok(detections)
    }

    pub fn label(&self, class_id: u32) -> String {
        self.detector
            .class_name(class_id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("class_{}", class_id))
    }
}

/// Decode encoded image bytes (JPEG, PNG, ...) to RGB
pub fn decode(bytes: &[u8]) -> Result<DecodedImage> {
    let img = image::load_from_memory(bytes)?;
    Ok(DecodedImage::from_rgb(img.to_rgb8()))
}

/// Class names from a labels file (one per line), or COCO when unset or unreadable
pub fn load_class_names(path: Option<&Path>) -> Vec<String> {
    let coco = || COCO_CLASSES.iter().map(|s| s.to_string()).collect();
    let Some(path) = path else {
        return coco();
    };
    match std::fs::read_to_string(path) {
        Ok(raw) => raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Labels file unreadable, using COCO names");
            coco()
        }
    }
}

// ============================================================================
// YOLO over ONNX Runtime
// ============================================================================

pub struct YoloDetector {
    session: Session,
    input_name: String,
    params: YoloParams,
    class_names: Vec<String>,
}

impl YoloDetector {
    /// Load the model weights. Called once per process.
    pub fn load(model_path: &Path, mut params: YoloParams, class_names: Vec<String>) -> Result<Self> {
        if params.num_classes == 0 {
            params.num_classes = class_names.len();
        }

        if !model_path.exists() {
            return Err(InferenceError::ModelLoad(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e| InferenceError::ModelLoad(format!("session builder: {}", e)))?
            .commit_from_file(model_path)
            .map_err(|e| InferenceError::ModelLoad(format!("{}: {}", model_path.display(), e)))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| InferenceError::ModelLoad("model declares no inputs".to_string()))?;

        info!(
            model_path = %model_path.display(),
            input = %input_name,
            input_size = params.input_size,
            classes = class_names.len(),
            "🧠 Detector loaded"
        );

        Ok(Self {
            session,
            input_name,
            params,
            class_names,
        })
    }
}

impl Detector for YoloDetector {
    fn detect(&mut self, image: &DecodedImage) -> Result<Vec<RawDetection>> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = preprocess(image.as_rgb(), self.params.input_size)?;
        let tensor = Tensor::from_array(input)
            .map_err(|e| InferenceError::Execution(format!("input tensor: {}", e)))?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(|e| InferenceError::Execution(e.to_string()))?;

        let output = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| InferenceError::Execution(format!("output tensor: {}", e)))?;

        postprocess(&output, &letterbox, image.width(), image.height(), &self.params)
    }

    fn class_name(&self, class_id: u32) -> Option<&str> {
        self.class_names.get(class_id as usize).map(String::as_str)
    }
}

/// Scale and offset applied when letterboxing, needed to map boxes back
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Letterbox to a square `target_size` canvas and lay out as NCHW in `[0, 1]`
pub fn preprocess(rgb: &RgbImage, target_size: u32) -> Result<(ArrayD<f32>, Letterbox)> {
    let (orig_width, orig_height) = rgb.dimensions();
    let scale = target_size as f32 / orig_width.max(orig_height) as f32;
    let new_width = ((orig_width as f32 * scale).round() as u32).clamp(1, target_size);
    let new_height = ((orig_height as f32 * scale).round() as u32).clamp(1, target_size);

    let resized = imageops::resize(rgb, new_width, new_height, imageops::FilterType::Triangle);

    let pad_x = (target_size - new_width) / 2;
    let pad_y = (target_size - new_height) / 2;
    let mut canvas: RgbImage = ImageBuffer::from_pixel(target_size, target_size, LETTERBOX_FILL);
    imageops::overlay(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    let size = target_size as usize;
    let plane = size * size;
    let mut data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in canvas.enumerate_pixels() {
        let offset = y as usize * size + x as usize;
        for c in 0..3 {
            data[c * plane + offset] = pixel[c] as f32 / 255.0;
        }
    }

    let input = ArrayD::from_shape_vec(IxDyn(&[1, 3, size, size]), data)
        .map_err(|e| InferenceError::Execution(format!("input shape: {}", e)))?;

    Ok((
        input,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    ))
}

/// Decode a YOLOv8 head output into pixel-space boxes.
///
/// Accepts `[1, 4 + C, N]` and the transposed `[1, N, 4 + C]`; rows are
/// `cx, cy, w, h` in letterboxed input pixels followed by per-class scores.
pub fn postprocess(
    output: &ArrayViewD<f32>,
    letterbox: &Letterbox,
    img_width: u32,
    img_height: u32,
    params: &YoloParams,
) -> Result<Vec<RawDetection>> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] != 1 {
        return Err(InferenceError::Execution(format!(
            "unexpected output shape {:?}",
            shape
        )));
    }

    let channels_first = output_is_channels_first(shape[1], shape[2], params.num_classes);
    let (attrs, num_boxes) = if channels_first {
        (shape[1], shape[2])
    } else {
        (shape[2], shape[1])
    };
    if attrs < 5 {
        return Err(InferenceError::Execution(format!(
            "output has {} attributes per box, need at least 5",
            attrs
        )));
    }
    let value = |attr: usize, i: usize| {
        if channels_first {
            output[[0, attr, i]]
        } else {
            output[[0, i, attr]]
        }
    };

    let max_x = img_width as f32;
    let max_y = img_height as f32;
    let mut candidates = Vec::new();

    for i in 0..num_boxes {
        let (class_id, score) = (4..attrs)
            .map(|attr| ((attr - 4) as u32, value(attr, i)))
            .fold((0u32, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

        if !(score >= params.score_floor) {
            continue;
        }

        let (cx, cy, w, h) = (value(0, i), value(1, i), value(2, i), value(3, i));
        let (x1, y1) = letterbox.unmap(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.unmap(cx + w / 2.0, cy + h / 2.0);

        candidates.push(RawDetection {
            class_id,
            confidence: score.min(1.0),
            bbox: PixelBox::new(
                x1.clamp(0.0, max_x),
                y1.clamp(0.0, max_y),
                x2.clamp(0.0, max_x),
                y2.clamp(0.0, max_y),
            ),
        });
    }

    let mut kept = nms(candidates, params.iou_threshold);
    kept.truncate(params.max_detections);
    Ok(kept)
}

/// `[1, 4 + C, N]` vs `[1, N, 4 + C]`. The known class count decides; size
/// comparison is only a fallback since N can be smaller than `4 + C`.
fn output_is_channels_first(dim1: usize, dim2: usize, num_classes: usize) -> bool {
    if num_classes > 0 {
        let attrs = 4 + num_classes;
        if dim1 == attrs {
            return true;
        }
        if dim2 == attrs {
            return false;
        }
    }
    dim1 < dim2
}

/// Per-class non-maximum suppression, result sorted by confidence descending
pub fn nms(detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    let mut by_class: HashMap<u32, Vec<RawDetection>> = HashMap::new();
    for detection in detections {
        by_class.entry(detection.class_id).or_default().push(detection);
    }

    let mut kept = Vec::new();
    for (_, mut group) in by_class {
        group.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let mut suppressed = vec![false; group.len()];
        for i in 0..group.len() {
            if suppressed[i] {
                continue;
            }
            kept.push(group[i]);
            for j in (i + 1)..group.len() {
                if !suppressed[j] && group[i].bbox.iou(&group[j].bbox) > iou_threshold {
                    suppressed[j] = true;
                }
            }
        }
    }

    kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    kept
}

// ============================================================================
// Tests
// ============================================================================
