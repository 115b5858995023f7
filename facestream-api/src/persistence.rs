/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! The narrow persistence surface the core depends on.
//!
//! Everything else about the relational schema (people, cameras, reports,
//! accounts) belongs to the surrounding platform; the core only appends
//! detections and reads enrolment plus scheduling data.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use facestream_index::FaceVectorRecord;
use facestream_types::{CameraId, EventId, TenantId};

use crate::detect::BoundingBox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    Unconfirmed,
    Confirmed,
    Rejected,
}

/// One face observation ready for the persistence sink. Immutable once
/// recorded apart from status and match linkage, which reviewers edit
/// through the platform's report surface.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionRecord {
    pub timestamp: DateTime<Utc>,
    pub camera_id: CameraId,
    pub tenant_id: TenantId,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub embedding: Vec<f32>,
    /// Set only for strong matches.
    pub matched_face_id: Option<String>,
    /// Nearest neighbour of a weak match, recorded but not linked.
    pub nearest_face_id: Option<String>,
    pub nearest_distance: Option<f32>,
    pub crop_uri: Option<String>,
    #[serde(skip)]
    pub crop_jpeg: Option<Vec<u8>>,
    pub status: DetectionStatus,
}

/// Mask of enabled weekdays, bit 0 = Monday … bit 6 = Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weekdays(pub u8);

impl Weekdays {
    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn from_days(days: &[Weekday]) -> Self {
        let mut mask = 0u8;
        for day in days {
            mask |= 1 << day.num_days_from_monday();
        }
        Weekdays(mask)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Recurrence {
    Once { date: NaiveDate },
    Daily,
    Weekly { weekdays: Weekdays },
    Monthly { day_of_month: u32 },
}

/// Scheduling row for one event, in server-local wall-clock terms.
#[derive(Debug, Clone, Serialize)]
pub struct EventSchedule {
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub active: bool,
    pub recurrence: Recurrence,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

/// One camera association of an event.
#[derive(Debug, Clone, Serialize)]
pub struct EventCamera {
    pub camera_id: CameraId,
    pub source_url: String,
    pub enabled: bool,
}

/// Where a camera's feed lives, as the camera registry knows it.
#[derive(Debug, Clone, Serialize)]
pub struct CameraEndpoint {
    pub camera_id: CameraId,
    pub source_url: String,
    pub tenant_id: Option<TenantId>,
}

#[async_trait]
pub trait DetectionSink: Send + Sync {
    /// Persist the detections of one frame together.
    async fn persist_detections(&self, records: Vec<DetectionRecord>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait FaceVectorSource: Send + Sync {
    /// Currently active enrolment vectors, optionally scoped to a tenant.
    async fn list_active_face_vectors(
        &self,
        tenant_id: Option<&str>,
    ) -> anyhow::Result<Vec<FaceVectorRecord>>;
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn list_active_events(&self) -> anyhow::Result<Vec<EventSchedule>>;
    async fn list_event_cameras(&self, event_id: &str) -> anyhow::Result<Vec<EventCamera>>;
    async fn set_event_active(&self, event_id: &str, active: bool) -> anyhow::Result<()>;
}

#[async_trait]
pub trait CameraSource: Send + Sync {
    async fn camera_endpoint(&self, camera_id: &str) -> anyhow::Result<Option<CameraEndpoint>>;
}

/// Production store on PostgreSQL.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DetectionSink for PostgresStore {
    async fn persist_detections(&self, records: Vec<DetectionRecord>) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                "INSERT INTO detections \
                 (recorded_at, camera_id, tenant_id, box_x, box_y, box_w, box_h, \
                  confidence, embedding, matched_face_id, nearest_face_id, \
                  nearest_distance, crop_uri, crop_image, status) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            )
            .bind(record.timestamp)
            .bind(&record.camera_id)
            .bind(&record.tenant_id)
            .bind(record.bbox.x as i32)
            .bind(record.bbox.y as i32)
            .bind(record.bbox.width as i32)
            .bind(record.bbox.height as i32)
            .bind(record.confidence)
            .bind(&record.embedding)
            .bind(&record.matched_face_id)
            .bind(&record.nearest_face_id)
            .bind(record.nearest_distance)
            .bind(&record.crop_uri)
            .bind(&record.crop_jpeg)
            .bind(match record.status {
                DetectionStatus::Unconfirmed => "unconfirmed",
                DetectionStatus::Confirmed => "confirmed",
                DetectionStatus::Rejected => "rejected",
            })
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl FaceVectorSource for PostgresStore {
    async fn list_active_face_vectors(
        &self,
        tenant_id: Option<&str>,
    ) -> anyhow::Result<Vec<FaceVectorRecord>> {
        let rows = match tenant_id {
            Some(tenant) => {
                sqlx::query(
                    "SELECT person_face_id, tenant_id, embedding \
                     FROM person_faces WHERE active AND tenant_id = $1",
                )
                .bind(tenant)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT person_face_id, tenant_id, embedding FROM person_faces WHERE active",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows
            .into_iter()
            .map(|row| FaceVectorRecord {
                person_face_id: row.get("person_face_id"),
                tenant_id: row.get("tenant_id"),
                vector: row.get("embedding"),
            })
            .collect())
    }
}

#[async_trait]
impl EventSource for PostgresStore {
    async fn list_active_events(&self) -> anyhow::Result<Vec<EventSchedule>> {
        let rows = sqlx::query(
            "SELECT event_id, tenant_id, active, recurrence, scheduled_date, \
                    weekday_mask, day_of_month, start_time, end_time \
             FROM events WHERE active",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.get("recurrence");
            let recurrence = recurrence_from_row(
                &kind,
                row.get("scheduled_date"),
                row.get::<Option<i16>, _>("weekday_mask"),
                row.get::<Option<i16>, _>("day_of_month"),
            )?;
            events.push(EventSchedule {
                event_id: row.get("event_id"),
                tenant_id: row.get("tenant_id"),
                active: row.get("active"),
                recurrence,
                start_time: row.get("start_time"),
                end_time: row.get("end_time"),
            });
        }
        Ok(events)
    }

    async fn list_event_cameras(&self, event_id: &str) -> anyhow::Result<Vec<EventCamera>> {
        let rows = sqlx::query(
            "SELECT ec.camera_id, c.rtsp_url, ec.enabled \
             FROM event_cameras ec JOIN cameras c ON c.camera_id = ec.camera_id \
             WHERE ec.event_id = $1",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| EventCamera {
                camera_id: row.get("camera_id"),
                source_url: row.get("rtsp_url"),
                enabled: row.get("enabled"),
            })
            .collect())
    }

    async fn set_event_active(&self, event_id: &str, active: bool) -> anyhow::Result<()> {
        sqlx::query("UPDATE events SET active = $2 WHERE event_id = $1")
            .bind(event_id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CameraSource for PostgresStore {
    async fn camera_endpoint(&self, camera_id: &str) -> anyhow::Result<Option<CameraEndpoint>> {
        let row = sqlx::query(
            "SELECT camera_id, rtsp_url, tenant_id FROM cameras WHERE camera_id = $1",
        )
        .bind(camera_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| CameraEndpoint {
            camera_id: row.get("camera_id"),
            source_url: row.get("rtsp_url"),
            tenant_id: row.get("tenant_id"),
        }))
    }
}

/// Map the relational recurrence columns onto the closed enum.
fn recurrence_from_row(
    kind: &str,
    scheduled_date: Option<NaiveDate>,
    weekday_mask: Option<i16>,
    day_of_month: Option<i16>,
) -> anyhow::Result<Recurrence> {
    match kind {
        "once" => scheduled_date
            .map(|date| Recurrence::Once { date })
            .ok_or_else(|| anyhow::anyhow!("once event without scheduled_date")),
        "daily" => Ok(Recurrence::Daily),
        "weekly" => weekday_mask
            .map(|mask| Recurrence::Weekly {
                weekdays: Weekdays(mask as u8),
            })
            .ok_or_else(|| anyhow::anyhow!("weekly event without weekday_mask")),
        "monthly" => day_of_month
            .map(|day| Recurrence::Monthly {
                day_of_month: day as u32,
            })
            .ok_or_else(|| anyhow::anyhow!("monthly event without day_of_month")),
        other => anyhow::bail!("unknown recurrence kind {other:?}"),
    }
}
