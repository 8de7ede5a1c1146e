//! End-to-end tests for the detection pipeline
//!
//! Runs the real SQLite store with a scripted detector standing in for the
//! vision model. Faces are told apart by image size.

use image::{Rgb, RgbImage};
use panoscan_detector::error::InferenceError;
use panoscan_detector::inference::{DecodedImage, Detector, InferenceEngine, RawDetection};
use panoscan_detector::normalize::PixelBox;
use panoscan_detector::panorama::{Face, NewDetection, PanoramaInfo, StoredDetection};
use panoscan_detector::pipeline::{Pipeline, PipelineSettings, SkipReason};
use panoscan_detector::store::{PanoramaStore, SqliteStore};
use panoscan_detector::taxonomy::TaxonomyMapper;
use panoscan_detector::{PipelineError, StoreError};
use std::collections::HashMap;
use std::io::Cursor;
use std::time::Duration;

const MODEL_VERSION: &str = "yolo-test-v1";

const FRONT_SIZE: (u32, u32) = (64, 48);
const BACK_SIZE: (u32, u32) = (32, 32);

struct ScriptedDetector {
    by_size: HashMap<(u32, u32), Vec<RawDetection>>,
    fail_on: Option<(u32, u32)>,
}

impl ScriptedDetector {
    fn empty() -> Self {
        Self {
            by_size: HashMap::new(),
            fail_on: None,
        }
    }

    fn with(mut self, size: (u32, u32), detections: Vec<RawDetection>) -> Self {
        self.by_size.insert(size, detections);
        self
    }
}

impl Detector for ScriptedDetector {
    fn detect(&mut self, image: &DecodedImage) -> Result<Vec<RawDetection>, InferenceError> {
        let size = (image.width(), image.height());
        if self.fail_on == Some(size) {
            return Err(InferenceError::Execution("scripted failure".to_string()));
        }
        Ok(self.by_size.get(&size).cloned().unwrap_or_default())
    }

    fn class_name(&self, class_id: u32) -> Option<&str> {
        match class_id {
            0 => Some("door"),
            1 => Some("light_fixture"),
            _ => None,
        }
    }
}

fn png(size: (u32, u32)) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    RgbImage::from_pixel(size.0, size.1, Rgb([128, 128, 128]))
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn raw(class_id: u32, confidence: f32, bbox: PixelBox) -> RawDetection {
    RawDetection {
        class_id,
        confidence,
        bbox,
    }
}

fn create_test_store() -> SqliteStore {
    let store = SqliteStore::open_in_memory().unwrap();
    store.apply_schema().unwrap();
    store
}

/// Panorama with only front and back faces uploaded
fn insert_front_back_panorama(store: &SqliteStore, id: i64) {
    store
        .connection()
        .execute(
            "INSERT INTO panoramas (id, img_front, img_back, image_content_type)
             VALUES (?1, ?2, ?3, 'image/png')",
            rusqlite::params![id, png(FRONT_SIZE), png(BACK_SIZE)],
        )
        .unwrap();
}

fn taxonomy() -> TaxonomyMapper {
    TaxonomyMapper::from_json(r#"{"door": {"category": "IfcDoor", "description": "Door leaf"}}"#)
        .unwrap()
}

fn pipeline<S: PanoramaStore>(store: S, detector: ScriptedDetector) -> Pipeline<S, ScriptedDetector> {
    Pipeline::new(
        store,
        InferenceEngine::new(detector),
        taxonomy(),
        PipelineSettings {
            model_version: MODEL_VERSION.to_string(),
            poll_interval: Duration::from_millis(5),
            batch_limit: 0,
        },
    )
}

fn two_front_boxes() -> ScriptedDetector {
    ScriptedDetector::empty()
        .with(
            FRONT_SIZE,
            vec![
                raw(0, 0.90, PixelBox::new(8.0, 6.0, 24.0, 30.0)),
                raw(1, 0.42, PixelBox::new(40.0, 0.0, 64.0, 12.0)),
            ],
        )
        .with(BACK_SIZE, vec![])
}

#[test]
fn test_front_and_back_only_panorama() {
    let store = create_test_store();
    insert_front_back_panorama(&store, 1);

    let mut pipeline = pipeline(store, two_front_boxes());
    let report = pipeline.process_panorama(1).unwrap();

    assert_eq!(report.detections, 2);
    assert_eq!(report.faces_processed, vec![Face::Front, Face::Back]);
    assert_eq!(report.faces_skipped.len(), 4);
    assert!(report
        .faces_skipped
        .iter()
        .all(|(_, reason)| *reason == SkipReason::Absent));

    let rows = pipeline.store().detections_for(1, MODEL_VERSION).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|d| d.face == Face::Front));
    assert!(rows.iter().all(|d| d.model_version == MODEL_VERSION));

    let mut confidences: Vec<f32> = rows.iter().map(|d| d.confidence).collect();
    confidences.sort_by(|a, b| b.total_cmp(a));
    assert!((confidences[0] - 0.90).abs() < 1e-6);
    assert!((confidences[1] - 0.42).abs() < 1e-6);

    let door = rows.iter().find(|d| d.class_label == "door").unwrap();
    assert_eq!(door.display_label, "Door");
    assert_eq!(door.aux["category"], "IfcDoor");
    // (8..24, 6..30) on a 64x48 face
    assert_eq!(door.bbox.to_array(), [0.25, 0.375, 0.25, 0.5]);

    let lamp = rows.iter().find(|d| d.class_label == "light_fixture").unwrap();
    assert_eq!(lamp.display_label, "Light Fixture");
    assert_eq!(lamp.aux["category"], "Unknown");
    assert_eq!(lamp.aux["description"], "");
}

#[test]
fn test_reprocessing_with_no_boxes_clears_detections() {
    let store = create_test_store();
    insert_front_back_panorama(&store, 1);

    let mut first = pipeline(store, two_front_boxes());
    first.process_panorama(1).unwrap();
    assert_eq!(first.store().detections_for(1, MODEL_VERSION).unwrap().len(), 2);

    let mut second = pipeline(first.into_store(), ScriptedDetector::empty());
    let report = second.process_panorama(1).unwrap();

    assert_eq!(report.detections, 0);
    assert!(second.store().detections_for(1, MODEL_VERSION).unwrap().is_empty());
}

#[test]
fn test_running_twice_keeps_only_second_run() {
    let store = create_test_store();
    insert_front_back_panorama(&store, 1);

    let mut first = pipeline(store, two_front_boxes());
    first.process_panorama(1).unwrap();

    let rerun = ScriptedDetector::empty().with(
        BACK_SIZE,
        vec![raw(0, 0.61, PixelBox::new(0.0, 0.0, 16.0, 16.0))],
    );
    let mut second = pipeline(first.into_store(), rerun);
    second.process_panorama(1).unwrap();

    let rows = second.store().detections_for(1, MODEL_VERSION).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].face, Face::Back);
    assert!((rows[0].confidence - 0.61).abs() < 1e-6);
}

#[test]
fn test_low_confidence_is_persisted() {
    let store = create_test_store();
    insert_front_back_panorama(&store, 1);

    let detector = ScriptedDetector::empty().with(
        FRONT_SIZE,
        vec![
            raw(0, 0.05, PixelBox::new(0.0, 0.0, 10.0, 10.0)),
            raw(0, 0.95, PixelBox::new(20.0, 20.0, 30.0, 30.0)),
        ],
    );
    let mut pipeline = pipeline(store, detector);
    pipeline.process_panorama(1).unwrap();

    let rows = pipeline.store().detections_for(1, MODEL_VERSION).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|d| (d.confidence - 0.05).abs() < 1e-6));
    assert!(rows.iter().any(|d| (d.confidence - 0.95).abs() < 1e-6));
}

#[test]
fn test_bad_face_does_not_abort_panorama() {
    let store = create_test_store();
    store
        .connection()
        .execute(
            "INSERT INTO panoramas (id, img_front, img_back, img_left)
             VALUES (3, x'ffd8ffe000', ?1, ?2)",
            rusqlite::params![png(BACK_SIZE), png((16, 16))],
        )
        .unwrap();

    let mut detector = ScriptedDetector::empty().with(
        BACK_SIZE,
        vec![raw(0, 0.8, PixelBox::new(0.0, 0.0, 8.0, 8.0))],
    );
    detector.fail_on = Some((16, 16));

    let mut pipeline = pipeline(store, detector);
    let report = pipeline.process_panorama(3).unwrap();

    assert_eq!(report.detections, 1);
    assert_eq!(report.faces_processed, vec![Face::Back]);
    assert!(report.faces_skipped.contains(&(Face::Front, SkipReason::Decode)));
    assert!(report.faces_skipped.contains(&(Face::Left, SkipReason::Inference)));
    assert!(report.faces_skipped.contains(&(Face::Top, SkipReason::Absent)));
}

#[test]
fn test_cycle_processes_in_id_order_and_drains_queue() {
    let store = create_test_store();
    for id in [12, 3, 7] {
        insert_front_back_panorama(&store, id);
    }

    let mut pipeline = pipeline(store, two_front_boxes());
    let reports = pipeline.run_cycle().unwrap();
    let order: Vec<i64> = reports.iter().map(|r| r.panorama_id).collect();
    assert_eq!(order, vec![3, 7, 12]);

    assert!(pipeline.store().unprocessed(MODEL_VERSION, 0).unwrap().is_empty());
    assert!(pipeline.run_cycle().unwrap().is_empty());
}

#[test]
fn test_batch_limit_caps_cycle() {
    let store = create_test_store();
    for id in 1..=5 {
        insert_front_back_panorama(&store, id);
    }

    let mut pipeline = Pipeline::new(
        store,
        InferenceEngine::new(two_front_boxes()),
        taxonomy(),
        PipelineSettings {
            model_version: MODEL_VERSION.to_string(),
            poll_interval: Duration::from_millis(5),
            batch_limit: 2,
        },
    );

    assert_eq!(pipeline.run_cycle().unwrap().len(), 2);
    assert_eq!(pipeline.store().unprocessed(MODEL_VERSION, 0).unwrap(), vec![3, 4, 5]);
}

#[test]
fn test_batch_limit_does_not_starve_higher_ids() {
    let store = create_test_store();
    // 1 and 2 are empty rooms: their faces yield nothing and stay eligible
    for id in [1, 2] {
        store
            .connection()
            .execute(
                "INSERT INTO panoramas (id, img_front) VALUES (?1, ?2)",
                rusqlite::params![id, png(BACK_SIZE)],
            )
            .unwrap();
    }
    store
        .connection()
        .execute(
            "INSERT INTO panoramas (id, img_front) VALUES (3, ?1)",
            rusqlite::params![png(FRONT_SIZE)],
        )
        .unwrap();

    let mut pipeline = Pipeline::new(
        store,
        InferenceEngine::new(two_front_boxes()),
        taxonomy(),
        PipelineSettings {
            model_version: MODEL_VERSION.to_string(),
            poll_interval: Duration::from_millis(5),
            batch_limit: 2,
        },
    );

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.extend(pipeline.run_cycle().unwrap().into_iter().map(|r| r.panorama_id));
    }

    assert_eq!(seen, vec![1, 2, 3, 1, 2]);
    assert_eq!(pipeline.store().detections_for(3, MODEL_VERSION).unwrap().len(), 2);
    assert_eq!(pipeline.store().unprocessed(MODEL_VERSION, 0).unwrap(), vec![1, 2]);
}

/// Store whose writes always fail, for exercising the fatal path
struct FailingWrites(SqliteStore);

impl PanoramaStore for FailingWrites {
    fn unprocessed_after(
        &self,
        model_version: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<i64>, StoreError> {
        self.0.unprocessed_after(model_version, after_id, limit)
    }

    fn load_face(&self, panorama_id: i64, face: Face) -> Result<Option<Vec<u8>>, StoreError> {
        self.0.load_face(panorama_id, face)
    }

    fn panorama_info(&self, panorama_id: i64) -> Result<Option<PanoramaInfo>, StoreError> {
        self.0.panorama_info(panorama_id)
    }

    fn replace_detections(
        &mut self,
        _panorama_id: i64,
        _model_version: &str,
        _detections: &[NewDetection],
    ) -> Result<(), StoreError> {
        Err(StoreError::Sqlite {
            operation: "commit replace",
            source: rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR),
                Some("disk I/O error".to_string()),
            ),
        })
    }

    fn detections_for(
        &self,
        panorama_id: i64,
        model_version: &str,
    ) -> Result<Vec<StoredDetection>, StoreError> {
        self.0.detections_for(panorama_id, model_version)
    }
}

#[test]
fn test_write_failure_is_fatal_and_panorama_stays_eligible() {
    let store = create_test_store();
    insert_front_back_panorama(&store, 1);
    insert_front_back_panorama(&store, 2);

    let mut pipeline = pipeline(FailingWrites(store), two_front_boxes());
    let err = pipeline.run_cycle().unwrap_err();
    assert!(matches!(err, PipelineError::Store(StoreError::Sqlite { .. })));

    let store = pipeline.into_store().0;
    assert_eq!(store.unprocessed(MODEL_VERSION, 0).unwrap(), vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_poll_loop_stops_on_store_failure() {
    let store = create_test_store();
    insert_front_back_panorama(&store, 1);

    let pipeline = pipeline(FailingWrites(store), two_front_boxes());
    let result = tokio::time::timeout(Duration::from_secs(10), pipeline.run())
        .await
        .expect("poll loop should stop on its own");

    assert!(matches!(result, Err(PipelineError::Store(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_poll_loop_keeps_polling_when_idle() {
    let store = create_test_store();
    let pipeline = pipeline(store, ScriptedDetector::empty());

    // Empty queue: the loop sleeps and reselects instead of returning
    let result = tokio::time::timeout(Duration::from_millis(100), pipeline.run()).await;
    assert!(result.is_err());
}
