//! Camera settings persistence.

use chrono::Utc;
use sqlx::sqlite::SqlitePool;

use super::types::{CameraSettings, CameraSettingsRequest};
use crate::error::{Error, Result};

/// Repository over the `camera_settings` table.
#[derive(Clone)]
pub struct CameraSettingsRepository {
    pool: SqlitePool,
}

impl CameraSettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS camera_settings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_kind TEXT NOT NULL DEFAULT 'rtsp',
                address TEXT NOT NULL,
                port INTEGER NOT NULL DEFAULT 554,
                username TEXT NOT NULL DEFAULT '',
                password TEXT NOT NULL DEFAULT '',
                channel INTEGER NOT NULL DEFAULT 1,
                subtype INTEGER NOT NULL DEFAULT 0,
                line_x INTEGER,
                direction_in TEXT NOT NULL DEFAULT 'L->R',
                hysteresis_px INTEGER NOT NULL DEFAULT 5,
                area_change_threshold REAL NOT NULL DEFAULT 0.0,
                max_age_sec REAL NOT NULL DEFAULT 5.0,
                cleanup_interval_sec REAL NOT NULL DEFAULT 1.0,
                confidence_threshold REAL NOT NULL DEFAULT 0.45,
                iou_threshold REAL NOT NULL DEFAULT 0.5,
                resize_width INTEGER NOT NULL DEFAULT 960,
                model_name TEXT NOT NULL DEFAULT 'yolov8n.pt',
                reid_enabled INTEGER NOT NULL DEFAULT 0,
                reid_similarity_threshold REAL NOT NULL DEFAULT 0.65,
                reid_max_persons INTEGER NOT NULL DEFAULT 100,
                reid_update_embeddings INTEGER NOT NULL DEFAULT 1,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The single active settings row, if one has been configured.
    pub async fn get_active(&self) -> Result<Option<CameraSettings>> {
        let row = sqlx::query_as::<_, CameraSettings>(
            "SELECT * FROM camera_settings WHERE is_active = 1 ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<CameraSettings>> {
        let row = sqlx::query_as::<_, CameraSettings>("SELECT * FROM camera_settings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Insert a new row and make it the active one.
    pub async fn create(&self, req: &CameraSettingsRequest) -> Result<CameraSettings> {
        let now = Utc::now();

        sqlx::query("UPDATE camera_settings SET is_active = 0")
            .execute(&self.pool)
            .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO camera_settings (
                source_kind, address, port, username, password, channel, subtype,
                line_x, direction_in, hysteresis_px, area_change_threshold,
                max_age_sec, cleanup_interval_sec, confidence_threshold,
                iou_threshold, resize_width, model_name,
                reid_enabled, reid_similarity_threshold, reid_max_persons,
                reid_update_embeddings, is_active, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(&req.source_kind)
        .bind(&req.address)
        .bind(req.port)
        .bind(&req.username)
        .bind(&req.password)
        .bind(req.channel)
        .bind(req.subtype)
        .bind(req.line_x)
        .bind(&req.direction_in)
        .bind(req.hysteresis_px)
        .bind(req.area_change_threshold)
        .bind(req.max_age_sec)
        .bind(req.cleanup_interval_sec)
        .bind(req.confidence_threshold)
        .bind(req.iou_threshold)
        .bind(req.resize_width)
        .bind(&req.model_name)
        .bind(req.reid_enabled)
        .bind(req.reid_similarity_threshold)
        .bind(req.reid_max_persons)
        .bind(req.reid_update_embeddings)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        tracing::info!(settings_id = id, "Camera settings created");

        self.get_by_id(id)
            .await?
            .ok_or_else(|| Error::Internal("settings row vanished after insert".to_string()))
    }

    /// Update a row in place. An empty request password keeps the stored
    /// one; the updated row becomes the active one.
    pub async fn update(&self, id: i64, req: &CameraSettingsRequest) -> Result<CameraSettings> {
        let existing = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("camera settings {id}")))?;

        let password = if req.password.is_empty() {
            existing.password.clone()
        } else {
            req.password.clone()
        };

        sqlx::query("UPDATE camera_settings SET is_active = 0")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            UPDATE camera_settings SET
                source_kind = ?, address = ?, port = ?, username = ?, password = ?,
                channel = ?, subtype = ?, line_x = ?, direction_in = ?,
                hysteresis_px = ?, area_change_threshold = ?,
                max_age_sec = ?, cleanup_interval_sec = ?,
                confidence_threshold = ?, iou_threshold = ?, resize_width = ?,
                model_name = ?, reid_enabled = ?, reid_similarity_threshold = ?,
                reid_max_persons = ?, reid_update_embeddings = ?,
                is_active = 1, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&req.source_kind)
        .bind(&req.address)
        .bind(req.port)
        .bind(&req.username)
        .bind(&password)
        .bind(req.channel)
        .bind(req.subtype)
        .bind(req.line_x)
        .bind(&req.direction_in)
        .bind(req.hysteresis_px)
        .bind(req.area_change_threshold)
        .bind(req.max_age_sec)
        .bind(req.cleanup_interval_sec)
        .bind(req.confidence_threshold)
        .bind(req.iou_threshold)
        .bind(req.resize_width)
        .bind(&req.model_name)
        .bind(req.reid_enabled)
        .bind(req.reid_similarity_threshold)
        .bind(req.reid_max_persons)
        .bind(req.reid_update_embeddings)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        tracing::info!(settings_id = id, "Camera settings updated");

        self.get_by_id(id)
            .await?
            .ok_or_else(|| Error::Internal("settings row vanished after update".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> CameraSettingsRepository {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let repo = CameraSettingsRepository::new(pool);
        repo.ensure_schema().await.unwrap();
        repo
    }

    fn request(address: &str) -> CameraSettingsRequest {
        serde_json::from_value(serde_json::json!({
            "address": address,
            "username": "admin",
            "password": "secret",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn create_deactivates_previous_rows() {
        let repo = repo().await;
        let first = repo.create(&request("192.168.0.200")).await.unwrap();
        let second = repo.create(&request("192.168.0.201")).await.unwrap();

        let active = repo.get_active().await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert!(!repo.get_by_id(first.id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn update_with_empty_password_keeps_existing() {
        let repo = repo().await;
        let created = repo.create(&request("192.168.0.200")).await.unwrap();

        let mut req = request("192.168.0.200");
        req.password = String::new();
        req.line_x = Some(640);
        let updated = repo.update(created.id, &req).await.unwrap();

        assert_eq!(updated.password, "secret");
        assert_eq!(updated.line_x, Some(640));
    }

    #[tokio::test]
    async fn request_defaults_match_shipping_configuration() {
        let req = request("cam");
        assert_eq!(req.port, 554);
        assert_eq!(req.direction_in, "L->R");
        assert_eq!(req.hysteresis_px, 5);
        assert_eq!(req.area_change_threshold, 0.0);
        assert_eq!(req.confidence_threshold, 0.45);
        assert_eq!(req.reid_similarity_threshold, 0.65);
        assert!(!req.reid_enabled);
    }

    #[tokio::test]
    async fn update_missing_row_is_not_found() {
        let repo = repo().await;
        let err = repo.update(99, &request("cam")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
