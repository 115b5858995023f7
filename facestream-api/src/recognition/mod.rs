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

//! Recognition sessions: sampling stills from a camera and running the
//! face pipeline on them. Entirely separate from the viewer path; a camera
//! can have either, both, or neither.

pub mod extractor;
pub mod worker;

pub use worker::{decide, MatchDecision, RecognitionWorker};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, RwLock};
use tracing::info;
use uuid::Uuid;

use facestream_types::{CameraId, EventId, SessionId, TenantId};

use crate::constants::EXTRACTOR_BACKOFF_BASE;
use crate::error::{Result, StreamError};
use crate::transcoder::Transcoder;

/// One camera's recognition loop. At most one of these exists per camera
/// process-wide.
pub struct RecognitionSession {
    pub id: SessionId,
    pub camera_id: CameraId,
    pub tenant_id: TenantId,
    pub source_url: String,
    pub period: Duration,
    /// Owning event when the scheduler started this; `None` for manual
    /// sessions.
    pub event_id: Option<EventId>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub(crate) backoff_base: Duration,
    unhealthy: AtomicBool,
    finished: AtomicBool,
    samples: AtomicU64,
    skipped: AtomicU64,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionSummary {
    pub session_id: SessionId,
    pub camera_id: CameraId,
    pub event_id: Option<EventId>,
    pub period_secs: u64,
    pub samples: u64,
    pub skipped_ticks: u64,
    pub unhealthy: bool,
    pub created_at: i64,
}

impl RecognitionSession {
    fn new(
        camera_id: CameraId,
        tenant_id: TenantId,
        source_url: String,
        period: Duration,
        event_id: Option<EventId>,
        backoff_base: Duration,
        stop_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            camera_id,
            tenant_id,
            source_url,
            period,
            event_id,
            created_at: chrono::Utc::now(),
            backoff_base,
            unhealthy: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            samples: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            stop_tx: Mutex::new(Some(stop_tx)),
        }
    }

    pub fn request_stop(&self) {
        if let Some(tx) = self
            .stop_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy.load(Ordering::Acquire)
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub(crate) fn mark_unhealthy(&self) {
        self.unhealthy.store(true, Ordering::Release);
    }

    pub(crate) fn mark_healthy(&self) {
        self.unhealthy.store(false, Ordering::Release);
    }

    pub(crate) fn count_sample(&self) {
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_skipped(&self, n: u64) {
        self.skipped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn summary(&self) -> RecognitionSummary {
        RecognitionSummary {
            session_id: self.id.clone(),
            camera_id: self.camera_id.clone(),
            event_id: self.event_id.clone(),
            period_secs: self.period.as_secs(),
            samples: self.samples(),
            skipped_ticks: self.skipped(),
            unhealthy: self.is_unhealthy(),
            created_at: self.created_at.timestamp_millis(),
        }
    }
}

/// Registry and lifecycle of recognition sessions.
pub struct RecognitionManager {
    transcoder: Arc<dyn Transcoder>,
    worker: Arc<RecognitionWorker>,
    default_period: Duration,
    sessions: RwLock<HashMap<CameraId, Arc<RecognitionSession>>>,
}

impl RecognitionManager {
    pub fn new(
        transcoder: Arc<dyn Transcoder>,
        worker: Arc<RecognitionWorker>,
        default_period: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            transcoder,
            worker,
            default_period,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Start sampling a camera. Refuses when a live session already covers
    /// it; a finished (dead) session is replaced silently, which is what
    /// lets the scheduler revive crashed sessions on its next tick.
    pub async fn start(
        &self,
        camera_id: &str,
        tenant_id: &str,
        source_url: &str,
        period: Option<Duration>,
        event_id: Option<EventId>,
    ) -> Result<SessionId> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(camera_id) {
            if !existing.is_finished() {
                return Err(StreamError::RecognitionSessionExists(
                    camera_id.to_string(),
                ));
            }
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let session = Arc::new(RecognitionSession::new(
            camera_id.to_string(),
            tenant_id.to_string(),
            source_url.to_string(),
            period.unwrap_or(self.default_period),
            event_id,
            EXTRACTOR_BACKOFF_BASE,
            stop_tx,
        ));
        sessions.insert(camera_id.to_string(), Arc::clone(&session));
        drop(sessions);

        info!(
            "recognition session {} started for camera {camera_id} (event {:?})",
            session.id, session.event_id
        );
        tokio::spawn(extractor::run_extractor(
            Arc::clone(&session),
            Arc::clone(&self.transcoder),
            Arc::clone(&self.worker),
            stop_rx,
        ));
        Ok(session.id.clone())
    }

    /// Stop the session covering a camera. Returns `false` when there is
    /// none.
    pub async fn stop(&self, camera_id: &str) -> bool {
        let session = self.sessions.write().await.remove(camera_id);
        match session {
            Some(session) => {
                info!(
                    "stopping recognition session {} for camera {camera_id}",
                    session.id
                );
                session.request_stop();
                true
            }
            None => false,
        }
    }

    /// Whether a camera currently has a live (not finished) session.
    pub async fn is_running(&self, camera_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(camera_id)
            .map(|s| !s.is_finished())
            .unwrap_or(false)
    }

    pub async fn status(&self, camera_id: &str) -> Option<RecognitionSummary> {
        self.sessions
            .read()
            .await
            .get(camera_id)
            .map(|s| s.summary())
    }

    pub async fn list_active(&self) -> Vec<RecognitionSummary> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| !s.is_finished())
            .map(|s| s.summary())
            .collect()
    }

    /// Stop everything; used on process shutdown.
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.write().await;
        info!(
            "recognition shutdown: stopping {} sessions",
            sessions.len()
        );
        for (_, session) in sessions.drain() {
            session.request_stop();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::test_utils::{test_config, FixedDetector, FixedEmbedder, MemoryStore};
    use facestream_index::FaceIndex;

    /// Worker over fixed fakes plus the store it persists into.
    pub fn test_worker() -> (Arc<RecognitionWorker>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let worker = Arc::new(RecognitionWorker::new(
            &test_config(),
            Arc::new(FixedDetector::none()),
            Arc::new(FixedEmbedder::returning(vec![0.0; 128])),
            Arc::new(FaceIndex::new()),
            Arc::clone(&store) as Arc<dyn crate::persistence::DetectionSink>,
        ));
        (worker, store)
    }

    pub fn test_session(camera_id: &str, period: Duration) -> Arc<RecognitionSession> {
        let (stop_tx, _stop_rx) = oneshot::channel();
        Arc::new(RecognitionSession::new(
            camera_id.to_string(),
            "tenant-1".to_string(),
            format!("rtsp://cam/{camera_id}"),
            period,
            None,
            Duration::from_millis(50),
            stop_tx,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{wait_until_async, FakeTranscoder};
    use tests_support::test_worker;

    fn manager_with(transcoder: FakeTranscoder) -> Arc<RecognitionManager> {
        let (worker, _store) = test_worker();
        RecognitionManager::new(
            Arc::new(transcoder),
            worker,
            Duration::from_millis(20),
        )
    }

    #[tokio::test]
    async fn one_session_per_camera() {
        let manager = manager_with(FakeTranscoder::streaming());
        manager
            .start("cam-1", "tenant-1", "rtsp://cam/1", None, None)
            .await
            .expect("starts");
        let err = manager
            .start("cam-1", "tenant-1", "rtsp://cam/1", None, None)
            .await
            .err()
            .expect("second start refused");
        assert!(matches!(err, StreamError::RecognitionSessionExists(_)));
        assert_eq!(manager.list_active().await.len(), 1);
    }

    #[tokio::test]
    async fn stop_removes_the_session() {
        let manager = manager_with(FakeTranscoder::streaming());
        manager
            .start("cam-1", "tenant-1", "rtsp://cam/1", None, None)
            .await
            .expect("starts");
        assert!(manager.stop("cam-1").await);
        assert!(!manager.stop("cam-1").await);
        assert!(!manager.is_running("cam-1").await);
    }

    #[tokio::test]
    async fn finished_session_can_be_replaced() {
        let manager = manager_with(FakeTranscoder::streaming());
        let first = manager
            .start("cam-1", "tenant-1", "rtsp://cam/1", None, None)
            .await
            .expect("starts");

        // Simulate a crashed loop: ask it to stop without removing it.
        manager
            .sessions
            .read()
            .await
            .get("cam-1")
            .unwrap()
            .request_stop();
        wait_until_async(Duration::from_secs(2), || async {
            !manager.is_running("cam-1").await
        })
        .await;

        let second = manager
            .start("cam-1", "tenant-1", "rtsp://cam/1", None, None)
            .await
            .expect("replaces dead session");
        assert_ne!(first, second);
        assert!(manager.is_running("cam-1").await);
    }
}
