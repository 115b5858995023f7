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

//! Shared fakes and helpers for the crate's test suites.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use facestream_index::FaceVectorRecord;
use facestream_types::protocol::ServerEnvelope;
use image::DynamicImage;

use crate::broker::subscribers::{FrameSink, SinkClosed};
use crate::config::{AppConfig, FramerConfig, ViewerConfig};
use crate::detect::{BoundingBox, FaceDetector, FaceEmbedder, FaceObservation};
use crate::error::{Result, StreamError};
use crate::persistence::{
    CameraEndpoint, CameraSource, DetectionRecord, DetectionSink, EventCamera, EventSchedule,
    EventSource, FaceVectorSource,
};
use crate::transcoder::{Transcoder, TranscoderEvent, TranscoderHandle};

/// Short-fuse configuration for tests; no environment reads.
pub fn test_config() -> AppConfig {
    AppConfig {
        ffmpeg_bin: "ffmpeg".to_string(),
        viewer: ViewerConfig {
            fps: 15,
            width: 800,
            height: 600,
            quality: 5,
        },
        framer: FramerConfig {
            min_bytes: 4,
            max_bytes: 512_000,
            buffer_max: 2 * 1024 * 1024,
        },
        subscriber_queue_capacity: 4,
        viewer_idle_timeout: Duration::from_secs(300),
        transcoder_start_timeout: Duration::from_millis(500),
        transcoder_still_timeout: Duration::from_secs(2),
        transcoder_kill_timeout: Duration::from_secs(1),
        recognition_period: Duration::from_millis(50),
        detect_threshold: 0.5,
        match_strong: 0.35,
        match_weak: 0.5,
        embed_parallelism: 2,
        image_pool_size: 2,
        image_queue_max: 16,
        scheduler_tick: Duration::from_millis(50),
        server_tz: chrono_tz::UTC,
        actix_port: 0,
        database_url: None,
        detector_url: "http://localhost:9010/detect".to_string(),
        embedder_url: "http://localhost:9010/embed".to_string(),
    }
}

/// Smallest blob the framer accepts as a frame under the test config.
pub fn tiny_jpeg(n: u8) -> Vec<u8> {
    vec![0xFF, 0xD8, n, 0xFF, 0xD9]
}

/// Poll a condition until it holds; panic when the deadline passes.
pub async fn wait_until<F>(timeout: Duration, cond: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// `wait_until` for conditions that need to await.
pub async fn wait_until_async<F, Fut>(timeout: Duration, cond: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond().await {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A [`FrameSink`] that records everything it is handed.
pub struct RecordingSink {
    received: Mutex<Vec<String>>,
    delay: Duration,
    fail_after: Option<usize>,
}

impl RecordingSink {
    /// Accepts immediately.
    pub fn instant() -> Self {
        Self {
            received: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            fail_after: None,
        }
    }

    /// Simulates a slow consumer.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            received: Mutex::new(Vec::new()),
            delay,
            fail_after: None,
        }
    }

    /// Accepts `n` envelopes, then reports the transport closed.
    pub fn failing_after(n: usize) -> Self {
        Self {
            received: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            fail_after: Some(n),
        }
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Timestamps of every received `frame` envelope, in arrival order.
    pub fn received_timestamps(&self) -> Vec<i64> {
        self.received()
            .iter()
            .filter_map(|text| match serde_json::from_str(text) {
                Ok(ServerEnvelope::Frame { timestamp, .. }) => Some(timestamp),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn deliver(&self, text: Arc<String>) -> std::result::Result<(), SinkClosed> {
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        let mut received = self.received.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(limit) = self.fail_after {
            if received.len() >= limit {
                return Err(SinkClosed);
            }
        }
        received.push(text.as_ref().clone());
        Ok(())
    }
}

enum FakeMode {
    /// Emits one tiny frame every 10 ms until stopped.
    Streaming,
    /// Never produces output; exits only when stopped.
    Silent,
    /// Emits N frames, then exits on its own (a crashing camera feed).
    DyingAfter(u64),
}

/// Scripted stand-in for ffmpeg on both the mjpeg and still paths.
pub struct FakeTranscoder {
    mode: FakeMode,
    /// Still captures that fail before the first success.
    still_fail_first: AtomicU32,
    pub stills_served: AtomicU64,
}

impl FakeTranscoder {
    pub fn streaming() -> Self {
        Self::with_mode(FakeMode::Streaming)
    }

    pub fn silent() -> Self {
        Self::with_mode(FakeMode::Silent)
    }

    pub fn dying_after(frames: u64) -> Self {
        Self::with_mode(FakeMode::DyingAfter(frames))
    }

    /// Streaming mode whose still captures fail `n` times before working.
    pub fn flaky_stills(n: u32) -> Self {
        let fake = Self::with_mode(FakeMode::Streaming);
        fake.still_fail_first.store(n, Ordering::SeqCst);
        fake
    }

    fn with_mode(mode: FakeMode) -> Self {
        Self {
            mode,
            still_fail_first: AtomicU32::new(0),
            stills_served: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn spawn_mjpeg(&self, _source_url: &str) -> Result<TranscoderHandle> {
        let (tx, rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = oneshot::channel();

        let total = match self.mode {
            FakeMode::Streaming => None,
            FakeMode::Silent => Some(0),
            FakeMode::DyingAfter(n) => Some(n),
        };

        tokio::spawn(async move {
            let mut stop_rx = stop_rx;
            let mut emitted = 0u64;
            loop {
                if total == Some(emitted) && total != Some(0) {
                    let _ = tx
                        .send(TranscoderEvent::Exit {
                            code: Some(1),
                            signal: None,
                        })
                        .await;
                    return;
                }
                let silent = total == Some(0);
                tokio::select! {
                    _ = &mut stop_rx => {
                        let _ = tx.send(TranscoderEvent::Exit { code: None, signal: Some(2) }).await;
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(10)), if !silent => {
                        let frame = tiny_jpeg((emitted % 251) as u8);
                        emitted += 1;
                        if tx.send(TranscoderEvent::Bytes(Bytes::from(frame))).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(TranscoderHandle::new(rx, stop_tx))
    }

    async fn capture_still(&self, _source_url: &str) -> Result<Vec<u8>> {
        let remaining = self.still_fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.still_fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(StreamError::TranscoderStartTimeout(Duration::from_secs(5)));
        }
        self.stills_served.fetch_add(1, Ordering::SeqCst);
        // A real decodable JPEG so the recognition pipeline runs end to end.
        Ok(crate::detect::encode_jpeg(&DynamicImage::new_rgb8(64, 64)).expect("encode test jpeg"))
    }
}

/// Detector that reports the same box for every frame.
pub struct FixedDetector {
    observations: Vec<FaceObservation>,
}

impl FixedDetector {
    /// One centred face with the given confidence.
    pub fn one_face(confidence: f32) -> Self {
        Self {
            observations: vec![FaceObservation {
                bbox: BoundingBox {
                    x: 10,
                    y: 10,
                    width: 32,
                    height: 32,
                },
                confidence,
            }],
        }
    }

    pub fn none() -> Self {
        Self {
            observations: Vec::new(),
        }
    }
}

#[async_trait]
impl FaceDetector for FixedDetector {
    async fn detect(&self, _image: &DynamicImage) -> anyhow::Result<Vec<FaceObservation>> {
        Ok(self.observations.clone())
    }

    fn name(&self) -> &'static str {
        "fixed-detector"
    }
}

/// Embedder that returns one fixed vector.
pub struct FixedEmbedder {
    vector: Vec<f32>,
}

impl FixedEmbedder {
    pub fn returning(vector: Vec<f32>) -> Self {
        Self { vector }
    }
}

#[async_trait]
impl FaceEmbedder for FixedEmbedder {
    async fn embed(&self, _face: &DynamicImage) -> anyhow::Result<Vec<f32>> {
        Ok(self.vector.clone())
    }

    fn name(&self) -> &'static str {
        "fixed-embedder"
    }
}

/// In-memory persistence fake covering all three store traits.
pub struct MemoryStore {
    detections: Mutex<Vec<DetectionRecord>>,
    face_vectors: Mutex<Vec<FaceVectorRecord>>,
    events: Mutex<Vec<EventSchedule>>,
    event_cameras: Mutex<std::collections::HashMap<String, Vec<EventCamera>>>,
    cameras: Mutex<std::collections::HashMap<String, CameraEndpoint>>,
    persist_delay: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_persist_delay(Duration::ZERO)
    }

    pub fn with_persist_delay(persist_delay: Duration) -> Self {
        Self {
            detections: Mutex::new(Vec::new()),
            face_vectors: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            event_cameras: Mutex::new(std::collections::HashMap::new()),
            cameras: Mutex::new(std::collections::HashMap::new()),
            persist_delay,
        }
    }

    pub fn put_camera(&self, camera_id: &str, source_url: &str, tenant_id: Option<&str>) {
        self.cameras
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                camera_id.to_string(),
                CameraEndpoint {
                    camera_id: camera_id.to_string(),
                    source_url: source_url.to_string(),
                    tenant_id: tenant_id.map(|t| t.to_string()),
                },
            );
    }

    pub fn detections(&self) -> Vec<DetectionRecord> {
        self.detections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn detection_count(&self) -> usize {
        self.detections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn put_face_vectors(&self, vectors: Vec<FaceVectorRecord>) {
        *self.face_vectors.lock().unwrap_or_else(|e| e.into_inner()) = vectors;
    }

    pub fn put_event(&self, event: EventSchedule, cameras: Vec<EventCamera>) {
        self.event_cameras
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event.event_id.clone(), cameras);
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    pub fn clear_events(&self) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DetectionSink for MemoryStore {
    async fn persist_detections(&self, records: Vec<DetectionRecord>) -> anyhow::Result<()> {
        if self.persist_delay > Duration::ZERO {
            tokio::time::sleep(self.persist_delay).await;
        }
        self.detections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(records);
        Ok(())
    }
}

#[async_trait]
impl FaceVectorSource for MemoryStore {
    async fn list_active_face_vectors(
        &self,
        tenant_id: Option<&str>,
    ) -> anyhow::Result<Vec<FaceVectorRecord>> {
        let vectors = self.face_vectors.lock().unwrap_or_else(|e| e.into_inner());
        Ok(vectors
            .iter()
            .filter(|v| tenant_id.map(|t| v.tenant_id == t).unwrap_or(true))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EventSource for MemoryStore {
    async fn list_active_events(&self) -> anyhow::Result<Vec<EventSchedule>> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        Ok(events.iter().filter(|e| e.active).cloned().collect())
    }

    async fn list_event_cameras(&self, event_id: &str) -> anyhow::Result<Vec<EventCamera>> {
        let cameras = self.event_cameras.lock().unwrap_or_else(|e| e.into_inner());
        Ok(cameras.get(event_id).cloned().unwrap_or_default())
    }

    async fn set_event_active(&self, event_id: &str, active: bool) -> anyhow::Result<()> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        for event in events.iter_mut() {
            if event.event_id == event_id {
                event.active = active;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CameraSource for MemoryStore {
    async fn camera_endpoint(&self, camera_id: &str) -> anyhow::Result<Option<CameraEndpoint>> {
        let cameras = self.cameras.lock().unwrap_or_else(|e| e.into_inner());
        Ok(cameras.get(camera_id).cloned())
    }
}
