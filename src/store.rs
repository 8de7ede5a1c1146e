//! Relational store access
//!
//! Work selection, face extraction and detection replacement against the
//! `panoramas` / `detections` tables. Every statement is a fixed string;
//! face columns are chosen by matching on [`Face`], never by formatting a
//! column name into SQL.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::StoreError;
use crate::panorama::{Face, NewDetection, NormalizedBox, PanoramaInfo, StoredDetection};

type Result<T> = std::result::Result<T, StoreError>;

/// DDL for the tables this crate reads and writes. The deployed schema is
/// owned by the ingestion side; this copy is applied for tests and local runs.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS panoramas (
    id                 INTEGER PRIMARY KEY,
    property_id        INTEGER,
    level              TEXT,
    lat                REAL,
    lon                REAL,
    alt                REAL,
    heading_deg        REAL,
    captured_at        TEXT,
    faces_json         TEXT,
    img_top            BLOB,
    img_bottom         BLOB,
    img_front          BLOB,
    img_back           BLOB,
    img_left           BLOB,
    img_right          BLOB,
    image_content_type TEXT,
    image_byte_length  INTEGER
);

CREATE TABLE IF NOT EXISTS detections (
    id                 INTEGER PRIMARY KEY,
    pano_id            INTEGER NOT NULL REFERENCES panoramas(id) ON DELETE CASCADE,
    model_version      TEXT NOT NULL,
    ifc_class          TEXT NOT NULL,
    label_display      TEXT NOT NULL,
    confidence         REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    face_id            TEXT NOT NULL
                       CHECK (face_id IN ('front', 'back', 'left', 'right', 'top', 'bottom')),
    bbox_xywh          TEXT NOT NULL,
    mask_ref           TEXT,
    sphere_coords_json TEXT NOT NULL DEFAULT '{}',
    created_at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_detections_pano_model
    ON detections (pano_id, model_version);
"#;

const SELECT_UNPROCESSED: &str = "SELECT p.id FROM panoramas p
     WHERE p.id > ?2
       AND NOT EXISTS (
         SELECT 1 FROM detections d
         WHERE d.pano_id = p.id AND d.model_version = ?1
     )
     ORDER BY p.id ASC
     LIMIT ?3";

const SELECT_FRONT: &str = "SELECT img_front FROM panoramas WHERE id = ?1";
const SELECT_BACK: &str = "SELECT img_back FROM panoramas WHERE id = ?1";
const SELECT_LEFT: &str = "SELECT img_left FROM panoramas WHERE id = ?1";
const SELECT_RIGHT: &str = "SELECT img_right FROM panoramas WHERE id = ?1";
const SELECT_TOP: &str = "SELECT img_top FROM panoramas WHERE id = ?1";
const SELECT_BOTTOM: &str = "SELECT img_bottom FROM panoramas WHERE id = ?1";

const SELECT_PANORAMA_INFO: &str = "SELECT id, level, lat, lon, alt, heading_deg, captured_at,
            image_content_type, image_byte_length,
            img_front IS NOT NULL, img_back IS NOT NULL, img_left IS NOT NULL,
            img_right IS NOT NULL, img_top IS NOT NULL, img_bottom IS NOT NULL
     FROM panoramas WHERE id = ?1";

const DELETE_DETECTIONS: &str = "DELETE FROM detections WHERE pano_id = ?1 AND model_version = ?2";

const INSERT_DETECTION: &str = "INSERT INTO detections
        (pano_id, model_version, ifc_class, label_display, confidence, face_id,
         bbox_xywh, mask_ref, sphere_coords_json, created_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

const SELECT_DETECTIONS: &str = "SELECT id, pano_id, model_version, ifc_class, label_display, confidence,
            face_id, bbox_xywh, mask_ref, sphere_coords_json, created_at
     FROM detections
     WHERE pano_id = ?1 AND model_version = ?2
     ORDER BY id ASC";

/// Store operations the pipeline depends on
pub trait PanoramaStore {
    /// Panorama ids with no detection rows under `model_version`, ascending.
    /// `limit == 0` means no limit.
    fn unprocessed(&self, model_version: &str, limit: usize) -> Result<Vec<i64>> {
        self.unprocessed_after(model_version, i64::MIN, limit)
    }

    /// Same as `unprocessed`, restricted to ids strictly above `after_id`
    fn unprocessed_after(&self, model_version: &str, after_id: i64, limit: usize)
        -> Result<Vec<i64>>;

    /// Raw image bytes for one face, `None` when that face was never uploaded
    fn load_face(&self, panorama_id: i64, face: Face) -> Result<Option<Vec<u8>>>;

    /// Metadata for a panorama, `None` when the row does not exist
    fn panorama_info(&self, panorama_id: i64) -> Result<Option<PanoramaInfo>>;

    /// Atomically swap the detection set of a (panorama, model version) pair
    fn replace_detections(
        &mut self,
        panorama_id: i64,
        model_version: &str,
        detections: &[NewDetection],
    ) -> Result<()>;

    fn detections_for(&self, panorama_id: i64, model_version: &str)
        -> Result<Vec<StoredDetection>>;
}

/// SQLite-backed store holding one connection for the process lifetime
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Self::configure(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: ":memory:".to_string(),
            source,
        })?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(StoreError::sqlite("set busy timeout"))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(StoreError::sqlite("enable foreign keys"))?;
        Ok(Self { conn })
    }

    pub fn apply_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .map_err(StoreError::sqlite("apply schema"))
    }

    /// Underlying connection, for ingestion-side tooling and tests
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn load_front(&self, panorama_id: i64) -> Result<Option<Vec<u8>>> {
        self.load_face_column(SELECT_FRONT, panorama_id)
    }

    pub fn load_back(&self, panorama_id: i64) -> Result<Option<Vec<u8>>> {
        self.load_face_column(SELECT_BACK, panorama_id)
    }

    pub fn load_left(&self, panorama_id: i64) -> Result<Option<Vec<u8>>> {
        self.load_face_column(SELECT_LEFT, panorama_id)
    }

    pub fn load_right(&self, panorama_id: i64) -> Result<Option<Vec<u8>>> {
        self.load_face_column(SELECT_RIGHT, panorama_id)
    }

    pub fn load_top(&self, panorama_id: i64) -> Result<Option<Vec<u8>>> {
        self.load_face_column(SELECT_TOP, panorama_id)
    }

    pub fn load_bottom(&self, panorama_id: i64) -> Result<Option<Vec<u8>>> {
        self.load_face_column(SELECT_BOTTOM, panorama_id)
    }

    fn load_face_column(&self, sql: &'static str, panorama_id: i64) -> Result<Option<Vec<u8>>> {
        let blob = self
            .conn
            .prepare_cached(sql)
            .and_then(|mut stmt| {
                stmt.query_row([panorama_id], |row| row.get::<_, Option<Vec<u8>>>(0))
                    .optional()
            })
            .map_err(StoreError::sqlite("load face"))?;
        Ok(blob.flatten())
    }
}

impl PanoramaStore for SqliteStore {
    fn unprocessed_after(
        &self,
        model_version: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<i64>> {
        // SQLite treats a negative LIMIT as unbounded
        let limit = if limit == 0 { -1 } else { limit as i64 };
        let mut stmt = self
            .conn
            .prepare_cached(SELECT_UNPROCESSED)
            .map_err(StoreError::sqlite("select unprocessed"))?;
        let ids = stmt
            .query_map(params![model_version, after_id, limit], |row| row.get::<_, i64>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<i64>>>())
            .map_err(StoreError::sqlite("select unprocessed"))?;
        Ok(ids)
    }

    fn load_face(&self, panorama_id: i64, face: Face) -> Result<Option<Vec<u8>>> {
        match face {
            Face::Front => self.load_front(panorama_id),
            Face::Back => self.load_back(panorama_id),
            Face::Left => self.load_left(panorama_id),
            Face::Right => self.load_right(panorama_id),
            Face::Top => self.load_top(panorama_id),
            Face::Bottom => self.load_bottom(panorama_id),
        }
    }

    fn panorama_info(&self, panorama_id: i64) -> Result<Option<PanoramaInfo>> {
        let mut stmt = self
            .conn
            .prepare_cached(SELECT_PANORAMA_INFO)
            .map_err(StoreError::sqlite("select panorama"))?;
        stmt.query_row([panorama_id], |row| {
            // Presence flags follow Face::ALL order
            let flags = [
                row.get::<_, bool>(9)?,
                row.get::<_, bool>(10)?,
                row.get::<_, bool>(11)?,
                row.get::<_, bool>(12)?,
                row.get::<_, bool>(13)?,
                row.get::<_, bool>(14)?,
            ];
            let faces_present = Face::ALL
                .iter()
                .zip(flags)
                .filter_map(|(face, present)| present.then_some(*face))
                .collect();
            Ok(PanoramaInfo {
                id: row.get(0)?,
                level: row.get(1)?,
                lat: row.get(2)?,
                lon: row.get(3)?,
                alt: row.get(4)?,
                heading_deg: row.get(5)?,
                captured_at: row.get(6)?,
                image_content_type: row.get(7)?,
                image_byte_length: row.get(8)?,
                faces_present,
            })
        })
        .optional()
        .map_err(StoreError::sqlite("select panorama"))
    }

    fn replace_detections(
        &mut self,
        panorama_id: i64,
        model_version: &str,
        detections: &[NewDetection],
    ) -> Result<()> {
        // Dropping `tx` on any early return rolls back the delete as well
        let tx = self
            .conn
            .transaction()
            .map_err(StoreError::sqlite("begin replace"))?;

        let deleted = tx
            .execute(DELETE_DETECTIONS, params![panorama_id, model_version])
            .map_err(StoreError::sqlite("delete detections"))?;

        {
            let mut insert = tx
                .prepare_cached(INSERT_DETECTION)
                .map_err(StoreError::sqlite("insert detection"))?;
            for detection in detections {
                let bbox = serde_json::to_string(&detection.bbox.to_array()).map_err(
                    |source| StoreError::Serialization {
                        field: "bbox_xywh",
                        source,
                    },
                )?;
                insert
                    .execute(params![
                        panorama_id,
                        model_version,
                        detection.class_label,
                        detection.display_label,
                        detection.confidence as f64,
                        detection.face.as_str(),
                        bbox,
                        detection.mask_ref,
                        detection.aux.to_string(),
                        detection.created_at,
                    ])
                    .map_err(StoreError::sqlite("insert detection"))?;
            }
        }

        tx.commit().map_err(StoreError::sqlite("commit replace"))?;

        debug!(
            pano_id = panorama_id,
            model_version = %model_version,
            deleted,
            inserted = detections.len(),
            "Detections replaced"
        );
        Ok(())
    }

    fn detections_for(
        &self,
        panorama_id: i64,
        model_version: &str,
    ) -> Result<Vec<StoredDetection>> {
        let mut stmt = self
            .conn
            .prepare_cached(SELECT_DETECTIONS)
            .map_err(StoreError::sqlite("select detections"))?;
        let rows = stmt
            .query_map(params![panorama_id, model_version], |row| {
                Ok(DetectionRow {
                    id: row.get(0)?,
                    panorama_id: row.get(1)?,
                    model_version: row.get(2)?,
                    class_label: row.get(3)?,
                    display_label: row.get(4)?,
                    confidence: row.get(5)?,
                    face: row.get(6)?,
                    bbox: row.get(7)?,
                    mask_ref: row.get(8)?,
                    aux: row.get(9)?,
                    created_at: row.get(10)?,
                })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<DetectionRow>>>())
            .map_err(StoreError::sqlite("select detections"))?;

        rows.into_iter().map(StoredDetection::try_from).collect()
    }
}

/// Detection columns as SQLite hands them back
struct DetectionRow {
    id: i64,
    panorama_id: i64,
    model_version: String,
    class_label: String,
    display_label: String,
    confidence: f64,
    face: String,
    bbox: String,
    mask_ref: Option<String>,
    aux: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<DetectionRow> for StoredDetection {
    type Error = StoreError;

    fn try_from(row: DetectionRow) -> Result<Self> {
        let bbox: [f32; 4] =
            serde_json::from_str(&row.bbox).map_err(|source| StoreError::Serialization {
                field: "bbox_xywh",
                source,
            })?;
        let aux = serde_json::from_str(&row.aux).map_err(|source| StoreError::Serialization {
            field: "sphere_coords_json",
            source,
        })?;
        Ok(StoredDetection {
            id: row.id,
            panorama_id: row.panorama_id,
            model_version: row.model_version,
            class_label: row.class_label,
            display_label: row.display_label,
            confidence: row.confidence as f32,
            face: row.face.parse()?,
            bbox: NormalizedBox::from_array(bbox),
            mask_ref: row.mask_ref,
            aux,
            created_at: row.created_at,
        })
    }
}
