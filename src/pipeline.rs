//! Detection pipeline
//!
//! Selects panoramas that have no detections under the current model
//! version, runs every available face through decode → inference →
//! normalization → taxonomy, and replaces the panorama's detection set in
//! one transaction. Work is strictly sequential: one panorama at a time,
//! one face at a time, one inference call in flight.
//!
//! Face-level problems (missing face, undecodable image, detector error)
//! only drop that face. Store errors end the loop; the process is expected
//! to be restarted by its supervisor.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::inference::{Detector, InferenceEngine, RawDetection};
use crate::metrics;
use crate::normalize::to_normalized_xywh;
use crate::panorama::{display_label, Face, NewDetection};
use crate::store::PanoramaStore;
use crate::taxonomy::TaxonomyMapper;

type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub model_version: String,
    pub poll_interval: Duration,
    /// Maximum panoramas per cycle, 0 for no limit
    pub batch_limit: usize,
}

/// Why a face contributed nothing to a panorama run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Absent,
    Decode,
    Inference,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Absent => metrics::SKIP_ABSENT,
            SkipReason::Decode => metrics::SKIP_DECODE,
            SkipReason::Inference => metrics::SKIP_INFERENCE,
        }
    }
}

/// Outcome of one panorama run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PanoramaReport {
    pub panorama_id: i64,
    /// Rows committed for the pair
    pub detections: usize,
    pub faces_processed: Vec<Face>,
    pub faces_skipped: Vec<(Face, SkipReason)>,
    /// The panorama row disappeared between selection and processing
    pub vanished: bool,
}

pub struct Pipeline<S: PanoramaStore, D: Detector> {
    store: S,
    engine: InferenceEngine<D>,
    taxonomy: TaxonomyMapper,
    settings: PipelineSettings,
    /// Highest id selected in the previous limited cycle
    cursor: i64,
}

impl<S: PanoramaStore, D: Detector> Pipeline<S, D> {
    pub fn new(
        store: S,
        engine: InferenceEngine<D>,
        taxonomy: TaxonomyMapper,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            engine,
            taxonomy,
            settings,
            cursor: i64::MIN,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn model_version(&self) -> &str {
        &self.settings.model_version
    }

    /// Poll forever: select, process the batch in id order, sleep, repeat.
    ///
    /// Returns only when a store operation fails.
    ///
    /// # Panics
    ///
    /// Must be driven by a multi-thread tokio runtime; each cycle runs under
    /// `block_in_place`, which panics on a current-thread runtime.
    pub async fn run(mut self) -> Result<()> {
        info!(
            model_version = %self.settings.model_version,
            interval_secs = self.settings.poll_interval.as_secs(),
            "🔄 Poll loop started"
        );

        loop {
            // Store and inference calls block; keep them off the async workers
            let outcome = tokio::task::block_in_place(|| self.run_cycle());
            if let Err(e) = outcome {
                error!(error = %e, "Poll loop stopped");
                return Err(e);
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    /// One selection cycle. Returns the reports for the panoramas handled.
    pub fn run_cycle(&mut self) -> Result<Vec<PanoramaReport>> {
        metrics::POLL_CYCLES.inc();

        let batch = self.select_batch()?;
        if batch.is_empty() {
            debug!(model_version = %self.settings.model_version, "No unprocessed panoramas");
            return Ok(Vec::new());
        }

        info!(
            model_version = %self.settings.model_version,
            batch = batch.len(),
            first = batch[0],
            "Processing batch"
        );

        let mut reports = Vec::with_capacity(batch.len());
        for panorama_id in batch {
            reports.push(self.process_panorama(panorama_id)?);
        }
        Ok(reports)
    }

    /// Limited cycles walk the id space with a cursor. Panoramas that yield
    /// no detections stay eligible, so restarting from the lowest id every
    /// time would never get past them.
    fn select_batch(&mut self) -> Result<Vec<i64>> {
        let limit = self.settings.batch_limit;
        let version = &self.settings.model_version;
        if limit == 0 {
            return Ok(self.store.unprocessed(version, 0)?);
        }

        let batch = self.store.unprocessed_after(version, self.cursor, limit)?;
        self.cursor = match batch.last() {
            Some(&last) if batch.len() == limit => last,
            _ => i64::MIN,
        };
        Ok(batch)
    }

    /// Run every face of one panorama and replace its detection set
    pub fn process_panorama(&mut self, panorama_id: i64) -> Result<PanoramaReport> {
        let mut report = PanoramaReport {
            panorama_id,
            ..Default::default()
        };

        let Some(info) = self.store.panorama_info(panorama_id)? else {
            warn!(pano_id = panorama_id, "Panorama no longer exists, skipping");
            report.vanished = true;
            return Ok(report);
        };
        debug!(
            pano_id = panorama_id,
            level = info.level.as_deref().unwrap_or("-"),
            faces = info.faces_present.len(),
            "Processing panorama"
        );

        let created_at = Utc::now();
        let mut detections = Vec::new();

        for face in Face::ALL {
            match self.detect_face(panorama_id, face, created_at)? {
                Ok(found) => {
                    detections.extend(found);
                    report.faces_processed.push(face);
                }
                Err(reason) => {
                    metrics::FACES_SKIPPED.with_label_values(&[reason.as_str()]).inc();
                    report.faces_skipped.push((face, reason));
                }
            }
        }

        if let Err(e) =
            self.store
                .replace_detections(panorama_id, &self.settings.model_version, &detections)
        {
            metrics::WRITE_FAILURES.inc();
            error!(
                pano_id = panorama_id,
                model_version = %self.settings.model_version,
                error = %e,
                "Detection replace failed, prior detections left intact"
            );
            return Err(e.into());
        }

        metrics::PANORAMAS_PROCESSED.inc();
        metrics::DETECTIONS_WRITTEN.inc_by(detections.len() as u64);
        report.detections = detections.len();

        info!(
            pano_id = panorama_id,
            model_version = %self.settings.model_version,
            detections = report.detections,
            faces = report.faces_processed.len(),
            skipped = report.faces_skipped.len(),
            "Panorama processed"
        );
        Ok(report)
    }

    /// Outer error: store failure, fatal. Inner error: this face is skipped.
    fn detect_face(
        &mut self,
        panorama_id: i64,
        face: Face,
        created_at: DateTime<Utc>,
    ) -> Result<std::result::Result<Vec<NewDetection>, SkipReason>> {
        let Some(bytes) = self.store.load_face(panorama_id, face)? else {
            debug!(pano_id = panorama_id, face = %face, "Face absent");
            return Ok(Err(SkipReason::Absent));
        };

        let image = match InferenceEngine::<D>::decode(&bytes) {
            Ok(image) => image,
            Err(e) => {
                warn!(pano_id = panorama_id, face = %face, error = %e, "Face image undecodable, skipping");
                return Ok(Err(SkipReason::Decode));
            }
        };

        let raw = match self.engine.infer(&image) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(pano_id = panorama_id, face = %face, error = %e, "Inference failed, skipping face");
                return Ok(Err(SkipReason::Inference));
            }
        };

        let (width, height) = (image.width() as i64, image.height() as i64);
        Ok(Ok(raw
            .iter()
            .map(|detection| self.finish(detection, face, width, height, created_at))
            .collect()))
    }

    fn finish(
        &self,
        raw: &RawDetection,
        face: Face,
        width: i64,
        height: i64,
        created_at: DateTime<Utc>,
    ) -> NewDetection {
        let class_label = self.engine.label(raw.class_id);
        let entry = self.taxonomy.map(&class_label);
        let confidence = if raw.confidence.is_nan() {
            0.0
        } else {
            raw.confidence.clamp(0.0, 1.0)
        };

        NewDetection {
            display_label: display_label(&class_label),
            class_label,
            confidence,
            face,
            bbox: to_normalized_xywh(raw.bbox, width, height),
            mask_ref: None,
            aux: entry.to_json(),
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InferenceError;
    use crate::inference::DecodedImage;
    use crate::normalize::PixelBox;
    use crate::store::SqliteStore;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    struct OneBox;

    impl Detector for OneBox {
        fn detect(
            &mut self,
            image: &DecodedImage,
        ) -> std::result::Result<Vec<RawDetection>, InferenceError> {
            Ok(vec![RawDetection {
                class_id: 0,
                confidence: 0.7,
                bbox: PixelBox::new(0.0, 0.0, image.width() as f32, image.height() as f32),
            }])
        }

        fn class_name(&self, _class_id: u32) -> Option<&str> {
            Some("light_fixture")
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        RgbImage::from_pixel(width, height, Rgb([0, 0, 0]))
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn pipeline() -> Pipeline<SqliteStore, OneBox> {
        let store = SqliteStore::open_in_memory().unwrap();
        store.apply_schema().unwrap();
        let taxonomy = TaxonomyMapper::from_json(
            r#"{"light_fixture": {"category": "IfcLightFixture", "description": "Ceiling light"}}"#,
        )
        .unwrap();
        Pipeline::new(
            store,
            InferenceEngine::new(OneBox),
            taxonomy,
            PipelineSettings {
                model_version: "test-v1".to_string(),
                poll_interval: Duration::from_millis(10),
                batch_limit: 0,
            },
        )
    }

    #[test]
    fn test_detection_is_enriched() {
        let mut pipeline = pipeline();
        pipeline
            .store()
            .connection()
            .execute(
                "INSERT INTO panoramas (id, img_left, img_top) VALUES (5, ?1, x'00ff')",
                [png(40, 20)],
            )
            .unwrap();

        let report = pipeline.process_panorama(5).unwrap();
        assert_eq!(report.detections, 1);
        assert_eq!(report.faces_processed, vec![Face::Left]);
        assert!(report.faces_skipped.contains(&(Face::Top, SkipReason::Decode)));
        assert!(report.faces_skipped.contains(&(Face::Front, SkipReason::Absent)));

        let rows = pipeline.store().detections_for(5, "test-v1").unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.class_label, "light_fixture");
        assert_eq!(row.display_label, "Light Fixture");
        assert_eq!(row.face, Face::Left);
        assert_eq!(row.bbox.to_array(), [0.5, 0.5, 1.0, 1.0]);
        assert_eq!(row.aux["category"], "IfcLightFixture");
        assert_eq!(row.aux["description"], "Ceiling light");
        assert!(row.mask_ref.is_none());
    }

    #[test]
    fn test_vanished_panorama_writes_nothing() {
        let mut pipeline = pipeline();
        let report = pipeline.process_panorama(99).unwrap();
        assert!(report.vanished);
        assert_eq!(report.detections, 0);
    }

    #[test]
    fn test_skip_reason_labels() {
        assert_eq!(SkipReason::Absent.as_str(), "absent");
        assert_eq!(SkipReason::Decode.as_str(), "decode");
        assert_eq!(SkipReason::Inference.as_str(), "inference");
    }
}
