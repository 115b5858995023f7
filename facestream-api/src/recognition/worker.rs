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

//! The per-frame recognition pipeline: detect, crop, embed, match, persist.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use image::{DynamicImage, GenericImageView};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use facestream_index::{FaceIndex, Neighbor};

use crate::config::AppConfig;
use crate::detect::{encode_jpeg, BoundingBox, FaceDetector, FaceEmbedder};
use crate::metrics;
use crate::persistence::{DetectionRecord, DetectionSink, DetectionStatus};

/// Padding added around a detector box before embedding, as a fraction of
/// the box size.
const CROP_PADDING: f32 = 0.15;

/// Crops larger than this are downscaled before embedding.
const EMBED_MAX_SIDE: u32 = 160;

/// Outcome of the nearest-neighbour ladder.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    /// Distance within the strong threshold: linked to the face.
    Matched { person_face_id: String, distance: f32 },
    /// Between strong and weak: nearest neighbour recorded, not linked.
    Candidate { person_face_id: String, distance: f32 },
    Unmatched,
}

pub fn decide(nearest: Option<&Neighbor>, strong: f32, weak: f32) -> MatchDecision {
    match nearest {
        Some(n) if n.distance <= strong => MatchDecision::Matched {
            person_face_id: n.person_face_id.clone(),
            distance: n.distance,
        },
        Some(n) if n.distance <= weak => MatchDecision::Candidate {
            person_face_id: n.person_face_id.clone(),
            distance: n.distance,
        },
        _ => MatchDecision::Unmatched,
    }
}

/// Shared recognition pipeline; one instance serves every recognition
/// session in the process.
pub struct RecognitionWorker {
    detector: Arc<dyn FaceDetector>,
    embedder: Arc<dyn FaceEmbedder>,
    index: Arc<FaceIndex>,
    sink: Arc<dyn DetectionSink>,
    /// Caps concurrent embedder calls across all sessions so one busy
    /// camera cannot starve the rest.
    embed_permits: Arc<Semaphore>,
    image_pool: ImagePool,
    detect_threshold: f32,
    match_strong: f32,
    match_weak: f32,
}

impl RecognitionWorker {
    pub fn new(
        config: &AppConfig,
        detector: Arc<dyn FaceDetector>,
        embedder: Arc<dyn FaceEmbedder>,
        index: Arc<FaceIndex>,
        sink: Arc<dyn DetectionSink>,
    ) -> Self {
        Self {
            detector,
            embedder,
            index,
            sink,
            embed_permits: Arc::new(Semaphore::new(config.embed_parallelism.max(1))),
            image_pool: ImagePool::new(config.image_pool_size.max(1), config.image_queue_max),
            detect_threshold: config.detect_threshold,
            match_strong: config.match_strong,
            match_weak: config.match_weak,
        }
    }

    /// Run the full pipeline on one sampled frame. Returns how many
    /// detections were handed to the persistence pool.
    pub async fn process_frame(
        &self,
        camera_id: &str,
        tenant_id: &str,
        jpeg: &[u8],
    ) -> anyhow::Result<usize> {
        let image = image::load_from_memory(jpeg)?;
        let observations = self.detector.detect(&image).await?;
        let timestamp = chrono::Utc::now();

        let mut records = Vec::new();
        let mut crops = Vec::new();
        for (i, obs) in observations.iter().enumerate() {
            if obs.confidence < self.detect_threshold {
                debug!(
                    "camera {camera_id}: detection below threshold ({:.2}), skipped",
                    obs.confidence
                );
                continue;
            }

            let crop = crop_face(&image, &obs.bbox);
            let embedding = {
                let _permit = self.embed_permits.acquire().await?;
                self.embedder
                    .embed(&crop)
                    .await
                    .map_err(|e| crate::error::StreamError::EmbedderFailed(e.to_string()))?
            };

            let nearest = self.index.query(tenant_id, &embedding, 1)?;
            let decision = decide(nearest.first(), self.match_strong, self.match_weak);

            let (matched, candidate, distance) = match &decision {
                MatchDecision::Matched {
                    person_face_id,
                    distance,
                } => (Some(person_face_id.clone()), None, Some(*distance)),
                MatchDecision::Candidate {
                    person_face_id,
                    distance,
                } => (None, Some(person_face_id.clone()), Some(*distance)),
                MatchDecision::Unmatched => (None, None, None),
            };

            records.push(DetectionRecord {
                timestamp,
                camera_id: camera_id.to_string(),
                tenant_id: tenant_id.to_string(),
                bbox: obs.bbox,
                confidence: obs.confidence,
                embedding,
                matched_face_id: matched,
                nearest_face_id: candidate,
                nearest_distance: distance,
                crop_uri: Some(format!(
                    "crops/{camera_id}/{}-{i}.jpg",
                    timestamp.timestamp_millis()
                )),
                crop_jpeg: None,
                status: DetectionStatus::Unconfirmed,
            });
            crops.push(crop);
        }

        if records.is_empty() {
            return Ok(0);
        }
        let count = records.len();

        // Crop encoding and the sink write are I/O-ish and must not block
        // the sampling cadence; the pool runs them and drops the oldest
        // pending frame when saturated.
        let sink = Arc::clone(&self.sink);
        let camera = camera_id.to_string();
        self.image_pool.submit(Box::pin(async move {
            let mut records = records;
            for (record, crop) in records.iter_mut().zip(crops.iter()) {
                match encode_jpeg(crop) {
                    Ok(bytes) => record.crop_jpeg = Some(bytes),
                    Err(e) => {
                        warn!("camera {camera}: crop encode failed: {e}");
                        record.crop_uri = None;
                    }
                }
            }
            match sink.persist_detections(records).await {
                Ok(()) => {
                    metrics::DETECTIONS_TOTAL.inc_by(count as f64);
                }
                Err(e) => warn!("camera {camera}: failed to persist detections: {e}"),
            }
        }));

        Ok(count)
    }

    /// Frames whose persistence work was evicted by the pool's drop-oldest
    /// policy.
    pub fn persistence_dropped(&self) -> u64 {
        self.image_pool.dropped()
    }
}

type PoolTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Fixed pool of workers over a bounded task queue. When the queue is full
/// the oldest pending task is discarded, so a stalled sink costs history,
/// never memory.
struct ImagePool {
    queue: Arc<Mutex<VecDeque<PoolTask>>>,
    notify: Arc<Notify>,
    dropped: Arc<AtomicU64>,
    queue_max: usize,
    workers: Vec<JoinHandle<()>>,
}

impl ImagePool {
    fn new(workers: usize, queue_max: usize) -> Self {
        let queue: Arc<Mutex<VecDeque<PoolTask>>> = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());
        let handles = (0..workers)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let notify = Arc::clone(&notify);
                tokio::spawn(async move {
                    loop {
                        let task = {
                            let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
                            queue.pop_front()
                        };
                        match task {
                            Some(task) => task.await,
                            None => notify.notified().await,
                        }
                    }
                })
            })
            .collect();
        Self {
            queue,
            notify,
            dropped: Arc::new(AtomicU64::new(0)),
            queue_max,
            workers: handles,
        }
    }

    fn submit(&self, task: PoolTask) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.queue_max {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(task);
        drop(queue);
        self.notify.notify_one();
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for ImagePool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

/// Crop a face with padding, clamped to the image, and downscale large
/// crops to the embedder's input budget.
fn crop_face(image: &DynamicImage, bbox: &BoundingBox) -> DynamicImage {
    let (img_w, img_h) = image.dimensions();
    let pad_x = (bbox.width as f32 * CROP_PADDING) as u32;
    let pad_y = (bbox.height as f32 * CROP_PADDING) as u32;

    let x0 = bbox.x.saturating_sub(pad_x);
    let y0 = bbox.y.saturating_sub(pad_y);
    let x1 = (bbox.x + bbox.width + pad_x).min(img_w);
    let y1 = (bbox.y + bbox.height + pad_y).min(img_h);
    let width = (x1 - x0).max(1);
    let height = (y1 - y0).max(1);

    let crop = image.crop_imm(x0, y0, width, height);
    if width > EMBED_MAX_SIDE || height > EMBED_MAX_SIDE {
        crop.resize(
            EMBED_MAX_SIDE,
            EMBED_MAX_SIDE,
            image::imageops::FilterType::Triangle,
        )
    } else {
        crop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        test_config, wait_until, FixedDetector, FixedEmbedder, MemoryStore,
    };
    use std::time::Duration;

    fn axis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; facestream_index::EMBEDDING_DIM];
        v[i] = 1.0;
        v
    }

    fn neighbor(distance: f32) -> Neighbor {
        Neighbor {
            person_face_id: "pf-1".to_string(),
            distance,
        }
    }

    #[test]
    fn decision_ladder_matches_spec_thresholds() {
        assert!(matches!(
            decide(Some(&neighbor(0.34)), 0.35, 0.5),
            MatchDecision::Matched { .. }
        ));
        assert!(matches!(
            decide(Some(&neighbor(0.40)), 0.35, 0.5),
            MatchDecision::Candidate { .. }
        ));
        assert_eq!(decide(Some(&neighbor(0.60)), 0.35, 0.5), MatchDecision::Unmatched);
        assert_eq!(decide(None, 0.35, 0.5), MatchDecision::Unmatched);
    }

    #[test]
    fn crop_clamps_to_image_bounds_and_downscales() {
        let image = DynamicImage::new_rgb8(400, 300);
        // Box at the edge: padding must not escape the image.
        let crop = crop_face(
            &image,
            &BoundingBox {
                x: 0,
                y: 0,
                width: 390,
                height: 290,
            },
        );
        let (w, h) = crop.dimensions();
        assert!(w <= EMBED_MAX_SIDE && h <= EMBED_MAX_SIDE);

        let small = crop_face(
            &image,
            &BoundingBox {
                x: 100,
                y: 100,
                width: 40,
                height: 40,
            },
        );
        // 15% padding on each side.
        assert_eq!(small.dimensions(), (52, 52));
    }

    #[tokio::test]
    async fn pipeline_persists_matched_detection() {
        let config = test_config();
        let index = Arc::new(FaceIndex::new());
        index.insert("pf-1", "tenant-1", axis(0)).unwrap();

        let store = Arc::new(MemoryStore::new());
        let worker = RecognitionWorker::new(
            &config,
            Arc::new(FixedDetector::one_face(0.9)),
            Arc::new(FixedEmbedder::returning(axis(0))),
            index,
            Arc::clone(&store) as Arc<dyn DetectionSink>,
        );

        let frame = encode_jpeg(&DynamicImage::new_rgb8(320, 240)).unwrap();
        let count = worker
            .process_frame("cam-1", "tenant-1", &frame)
            .await
            .expect("pipeline runs");
        assert_eq!(count, 1);

        wait_until(Duration::from_secs(2), || store.detection_count() == 1).await;
        let records = store.detections();
        assert_eq!(records[0].matched_face_id.as_deref(), Some("pf-1"));
        assert_eq!(records[0].camera_id, "cam-1");
        assert!(records[0].crop_jpeg.is_some());
        assert_eq!(records[0].status, DetectionStatus::Unconfirmed);
    }

    #[tokio::test]
    async fn detections_below_threshold_are_dropped() {
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        let worker = RecognitionWorker::new(
            &config,
            Arc::new(FixedDetector::one_face(0.3)),
            Arc::new(FixedEmbedder::returning(axis(0))),
            Arc::new(FaceIndex::new()),
            Arc::clone(&store) as Arc<dyn DetectionSink>,
        );

        let frame = encode_jpeg(&DynamicImage::new_rgb8(320, 240)).unwrap();
        let count = worker
            .process_frame("cam-1", "tenant-1", &frame)
            .await
            .expect("pipeline runs");
        assert_eq!(count, 0);
        assert_eq!(store.detection_count(), 0);
    }

    #[tokio::test]
    async fn unknown_face_is_persisted_unmatched() {
        let config = test_config();
        let index = Arc::new(FaceIndex::new());
        index.insert("pf-1", "tenant-1", axis(0)).unwrap();

        let store = Arc::new(MemoryStore::new());
        let worker = RecognitionWorker::new(
            &config,
            Arc::new(FixedDetector::one_face(0.9)),
            // Orthogonal embedding: distance 1.0 from everything enrolled.
            Arc::new(FixedEmbedder::returning(axis(5))),
            index,
            Arc::clone(&store) as Arc<dyn DetectionSink>,
        );

        let frame = encode_jpeg(&DynamicImage::new_rgb8(320, 240)).unwrap();
        worker
            .process_frame("cam-1", "tenant-1", &frame)
            .await
            .expect("pipeline runs");

        wait_until(Duration::from_secs(2), || store.detection_count() == 1).await;
        let records = store.detections();
        assert!(records[0].matched_face_id.is_none());
        assert!(records[0].nearest_face_id.is_none());
    }

    #[tokio::test]
    async fn saturated_pool_drops_oldest_pending_frame() {
        let mut config = test_config();
        config.image_pool_size = 1;
        config.image_queue_max = 1;

        let store = Arc::new(MemoryStore::with_persist_delay(Duration::from_millis(100)));
        let worker = RecognitionWorker::new(
            &config,
            Arc::new(FixedDetector::one_face(0.9)),
            Arc::new(FixedEmbedder::returning(axis(0))),
            Arc::new(FaceIndex::new()),
            Arc::clone(&store) as Arc<dyn DetectionSink>,
        );

        let frame = encode_jpeg(&DynamicImage::new_rgb8(64, 64)).unwrap();
        for _ in 0..5 {
            worker
                .process_frame("cam-1", "tenant-1", &frame)
                .await
                .expect("pipeline runs");
        }
        wait_until(Duration::from_secs(3), || {
            store.detection_count() as u64 + worker.persistence_dropped() >= 5
        })
        .await;
        assert!(worker.persistence_dropped() > 0);
    }
}
