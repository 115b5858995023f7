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

//! The stream broker: registry and lifecycle of viewer sessions.
//!
//! One broker instance per process, created at startup and handed to the
//! HTTP/WS layer by capability. It owns every viewer [`StreamSession`],
//! the camera→session reuse index and the client→session bindings.

pub mod session;
pub mod subscribers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use facestream_types::{CameraId, SessionId, TenantId};

use crate::config::AppConfig;
use crate::constants::IDLE_GC_INTERVAL;
use crate::error::{Result, StreamError};
use crate::framer::MjpegFramer;
use crate::metrics;
use crate::transcoder::Transcoder;

use session::{pump_session, SessionEnd, SessionState, SessionSummary, StreamSession};
use subscribers::{FrameSink, SubscriberId};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerHealth {
    pub active_sessions: usize,
    pub total_clients: usize,
    pub uptime_secs: u64,
}

pub struct StreamBroker {
    config: AppConfig,
    transcoder: Arc<dyn Transcoder>,
    sessions: RwLock<HashMap<SessionId, Arc<StreamSession>>>,
    viewer_by_camera: RwLock<HashMap<CameraId, SessionId>>,
    client_sessions: RwLock<HashMap<SubscriberId, SessionId>>,
    /// Serialises session creation so reuse checks and registry updates
    /// cannot interleave.
    create_lock: Mutex<()>,
    started_at: Instant,
}

impl StreamBroker {
    pub fn new(config: AppConfig, transcoder: Arc<dyn Transcoder>) -> Arc<Self> {
        Arc::new(Self {
            config,
            transcoder,
            sessions: RwLock::new(HashMap::new()),
            viewer_by_camera: RwLock::new(HashMap::new()),
            client_sessions: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            started_at: Instant::now(),
        })
    }

    /// Start (or reuse) the viewer stream for a camera.
    ///
    /// An Active session that still has watchers is shared. An Active
    /// session with zero watchers is left to the idle reaper and replaced
    /// with a fresh one, so a stale transcoder never serves a new viewer.
    pub async fn start_viewer_stream(
        self: &Arc<Self>,
        camera_id: &str,
        source_url: &str,
        tenant_id: Option<TenantId>,
    ) -> Result<SessionId> {
        let (session, active_rx) = {
            let _create = self.create_lock.lock().await;

            if let Some(existing) = self.reusable_session(camera_id).await {
                existing.touch();
                info!(
                    "reusing viewer session {} for camera {camera_id}",
                    existing.id
                );
                return Ok(existing.id.clone());
            }

            let handle = self.transcoder.spawn_mjpeg(source_url).await?;
            let (stop_tx, stop_rx) = oneshot::channel();
            let (active_tx, active_rx) = oneshot::channel();
            let session = Arc::new(StreamSession::new(
                Uuid::new_v4().to_string(),
                camera_id.to_string(),
                tenant_id,
                source_url.to_string(),
                self.config.subscriber_queue_capacity,
                stop_tx,
            ));

            self.sessions
                .write()
                .await
                .insert(session.id.clone(), Arc::clone(&session));
            self.viewer_by_camera
                .write()
                .await
                .insert(camera_id.to_string(), session.id.clone());
            metrics::ACTIVE_SESSIONS.set(self.sessions.read().await.len() as f64);

            let broker = Arc::clone(self);
            let pumped = Arc::clone(&session);
            let framer = MjpegFramer::new(self.config.framer.clone());
            tokio::spawn(async move {
                let end = pump_session(&pumped, handle, framer, stop_rx, active_tx).await;
                broker.finish_session(&pumped, end).await;
            });

            (session, active_rx)
        };

        match tokio::time::timeout(self.config.transcoder_start_timeout, active_rx).await {
            Ok(Ok(())) => {
                info!(
                    "viewer session {} active for camera {camera_id}",
                    session.id
                );
                Ok(session.id.clone())
            }
            _ => {
                warn!("viewer session {} for camera {camera_id} never became active", session.id);
                session.request_stop();
                Err(StreamError::StreamStartTimeout(camera_id.to_string()))
            }
        }
    }

    async fn reusable_session(&self, camera_id: &str) -> Option<Arc<StreamSession>> {
        let sid = self.viewer_by_camera.read().await.get(camera_id).cloned()?;
        let session = self.sessions.read().await.get(&sid).cloned()?;
        (session.is_active() && session.subscribers.count() > 0).then_some(session)
    }

    /// Stop a session by id. Returns `false` when the id is unknown or the
    /// session is already on its way down, so repeated calls are harmless.
    pub async fn stop_stream(&self, session_id: &str) -> bool {
        let session = self.sessions.read().await.get(session_id).cloned();
        match session {
            Some(session) if session.state() < SessionState::Stopping => {
                info!("stopping session {session_id}");
                session.request_stop();
                true
            }
            _ => false,
        }
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.is_active())
            .unwrap_or(false)
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<StreamSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// The current viewer session for a camera, if any.
    pub async fn viewer_session_for_camera(&self, camera_id: &str) -> Option<Arc<StreamSession>> {
        let sid = self.viewer_by_camera.read().await.get(camera_id).cloned()?;
        self.sessions.read().await.get(&sid).cloned()
    }

    pub async fn list_active(&self) -> Vec<SessionSummary> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| s.summary())
            .collect()
    }

    /// Bind a connected client to a session. Fails fast instead of waiting
    /// for a session that is still starting.
    pub async fn subscribe(
        &self,
        client_id: &str,
        sink: Arc<dyn FrameSink>,
        session_id: &str,
    ) -> Result<()> {
        let session = self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| StreamError::SessionNotFound(session_id.to_string()))?;
        if !session.is_active() {
            return Err(StreamError::SessionInactive(session_id.to_string()));
        }

        // A client sits in at most one session; drop any stale binding.
        self.unsubscribe(client_id).await;

        session.subscribers.attach(client_id.to_string(), sink);
        session.mark_busy();
        self.client_sessions
            .write()
            .await
            .insert(client_id.to_string(), session_id.to_string());
        Ok(())
    }

    pub async fn unsubscribe(&self, client_id: &str) {
        let sid = self.client_sessions.write().await.remove(client_id);
        let Some(sid) = sid else { return };
        if let Some(session) = self.sessions.read().await.get(&sid) {
            session.subscribers.detach(client_id);
            if session.subscribers.count() == 0 {
                session.mark_idle();
            }
        }
    }

    pub async fn health(&self) -> BrokerHealth {
        let sessions = self.sessions.read().await;
        BrokerHealth {
            active_sessions: sessions.values().filter(|s| s.is_active()).count(),
            total_clients: sessions.values().map(|s| s.subscribers.count()).sum(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// One idle sweep. Viewer sessions that have sat without subscribers
    /// longer than the idle timeout are stopped; sessions with watchers are
    /// untouchable.
    pub async fn collect_idle_once(&self) {
        let sessions: Vec<Arc<StreamSession>> =
            self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            if session.subscribers.count() > 0 || session.state() != SessionState::Active {
                continue;
            }
            if let Some(idle) = session.idle_for() {
                if idle > self.config.viewer_idle_timeout {
                    info!(
                        "reaping idle viewer session {} (camera {}, idle {idle:?})",
                        session.id, session.camera_id
                    );
                    session.request_stop();
                }
            }
        }
    }

    /// Background idle reaper; runs until aborted.
    pub fn spawn_idle_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IDLE_GC_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                broker.collect_idle_once().await;
            }
        })
    }

    /// Close every session. Called once on process shutdown.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<StreamSession>> =
            self.sessions.read().await.values().cloned().collect();
        info!("broker shutdown: stopping {} sessions", sessions.len());
        for session in sessions {
            session.request_stop();
        }
    }

    /// Registry cleanup once a session's pump has finished.
    async fn finish_session(&self, session: &Arc<StreamSession>, end: SessionEnd) {
        session.advance_to(SessionState::Dead);
        let message = match end {
            SessionEnd::Requested => "stream stopped".to_string(),
            SessionEnd::TranscoderExited { code, signal } => {
                warn!(
                    "session {} transcoder exited unexpectedly (code {code:?}, signal {signal:?})",
                    session.id
                );
                format!("camera {} stream ended unexpectedly", session.camera_id)
            }
        };
        session.subscribers.close_all(&message);

        self.sessions.write().await.remove(&session.id);
        {
            let mut by_camera = self.viewer_by_camera.write().await;
            if by_camera.get(&session.camera_id) == Some(&session.id) {
                by_camera.remove(&session.camera_id);
            }
        }
        self.client_sessions
            .write()
            .await
            .retain(|_, sid| sid != &session.id);
        metrics::ACTIVE_SESSIONS.set(self.sessions.read().await.len() as f64);
        info!("session {} is gone", session.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        test_config, wait_until, wait_until_async, FakeTranscoder, RecordingSink,
    };
    use std::time::Duration;

    fn broker_with(transcoder: FakeTranscoder) -> Arc<StreamBroker> {
        StreamBroker::new(test_config(), Arc::new(transcoder))
    }

    #[tokio::test]
    async fn start_reports_timeout_when_no_frames_arrive() {
        let broker = broker_with(FakeTranscoder::silent());
        let err = broker
            .start_viewer_stream("42", "rtsp://cam/42", None)
            .await
            .err()
            .expect("should time out");
        assert!(matches!(err, StreamError::StreamStartTimeout(_)));
        // The failed session does not linger in the registry.
        wait_until_async(Duration::from_secs(2), || async {
            broker.list_active().await.is_empty()
        })
        .await;
    }

    #[tokio::test]
    async fn viewer_with_subscribers_is_reused() {
        let broker = broker_with(FakeTranscoder::streaming());
        let sid = broker
            .start_viewer_stream("42", "rtsp://cam/42", None)
            .await
            .expect("starts");

        let sink = Arc::new(RecordingSink::instant());
        broker
            .subscribe("client-1", sink, &sid)
            .await
            .expect("subscribe");

        let again = broker
            .start_viewer_stream("42", "rtsp://cam/42", None)
            .await
            .expect("reuse");
        assert_eq!(again, sid);
        assert_eq!(broker.list_active().await.len(), 1);
    }

    #[tokio::test]
    async fn zero_subscriber_session_is_replaced_not_reused() {
        let broker = broker_with(FakeTranscoder::streaming());
        let first = broker
            .start_viewer_stream("7", "rtsp://cam/7", None)
            .await
            .expect("starts");

        // No subscriber ever attached; a second start must get a new session.
        let second = broker
            .start_viewer_stream("7", "rtsp://cam/7", None)
            .await
            .expect("starts again");
        assert_ne!(first, second);

        // The camera index now points at the replacement.
        let current = broker.viewer_session_for_camera("7").await.unwrap();
        assert_eq!(current.id, second);
    }

    #[tokio::test]
    async fn subscribe_to_unknown_session_fails_fast() {
        let broker = broker_with(FakeTranscoder::streaming());
        let err = broker
            .subscribe("c1", Arc::new(RecordingSink::instant()), "nope")
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, StreamError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn stop_stream_is_idempotent() {
        let broker = broker_with(FakeTranscoder::streaming());
        let sid = broker
            .start_viewer_stream("9", "rtsp://cam/9", None)
            .await
            .expect("starts");
        assert!(broker.stop_stream(&sid).await);
        assert!(!broker.stop_stream(&sid).await);
        wait_until_async(Duration::from_secs(2), || async {
            !broker.is_active(&sid).await
        })
        .await;
    }

    #[tokio::test]
    async fn transcoder_death_tears_down_and_notifies_subscribers() {
        // Emits frames for a while, then exits on its own.
        let broker = broker_with(FakeTranscoder::dying_after(30));
        let sid = broker
            .start_viewer_stream("42", "rtsp://cam/42", None)
            .await
            .expect("starts");
        let sink = Arc::new(RecordingSink::instant());
        broker
            .subscribe("c1", Arc::clone(&sink) as Arc<dyn FrameSink>, &sid)
            .await
            .expect("subscribe");

        let watcher = Arc::clone(&sink);
        wait_until(Duration::from_secs(3), move || {
            watcher
                .received()
                .last()
                .map(|t| t.contains("stream_stopped"))
                .unwrap_or(false)
        })
        .await;

        assert!(!broker.is_active(&sid).await);
        assert!(broker.get_session(&sid).await.is_none());

        // A fresh start gets a brand-new session id.
        let broker2 = broker_with(FakeTranscoder::streaming());
        let fresh = broker2
            .start_viewer_stream("42", "rtsp://cam/42", None)
            .await
            .expect("restarts");
        assert_ne!(fresh, sid);
    }

    #[tokio::test]
    async fn idle_sessions_are_reaped_and_watched_sessions_are_not() {
        let mut config = test_config();
        config.viewer_idle_timeout = Duration::from_millis(100);
        let broker = StreamBroker::new(config, Arc::new(FakeTranscoder::streaming()));

        let idle = broker
            .start_viewer_stream("idle-cam", "rtsp://cam/idle", None)
            .await
            .expect("starts");
        let watched = broker
            .start_viewer_stream("watched-cam", "rtsp://cam/watched", None)
            .await
            .expect("starts");
        broker
            .subscribe("c1", Arc::new(RecordingSink::instant()), &watched)
            .await
            .expect("subscribe");

        tokio::time::sleep(Duration::from_millis(200)).await;
        broker.collect_idle_once().await;

        wait_until_async(Duration::from_secs(2), || async {
            !broker.is_active(&idle).await
        })
        .await;
        assert!(broker.is_active(&watched).await);
    }

    #[tokio::test]
    async fn unsubscribe_marks_session_idle() {
        let mut config = test_config();
        config.viewer_idle_timeout = Duration::from_millis(50);
        let broker = StreamBroker::new(config, Arc::new(FakeTranscoder::streaming()));
        let sid = broker
            .start_viewer_stream("7", "rtsp://cam/7", None)
            .await
            .expect("starts");
        broker
            .subscribe("c1", Arc::new(RecordingSink::instant()), &sid)
            .await
            .expect("subscribe");
        broker.unsubscribe("c1").await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        broker.collect_idle_once().await;
        wait_until_async(Duration::from_secs(2), || async {
            !broker.is_active(&sid).await
        })
        .await;
    }
}
