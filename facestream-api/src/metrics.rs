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

//! Centralized Prometheus metrics for the streaming core

use lazy_static::lazy_static;
use prometheus::{register_counter, register_gauge, Counter, Encoder, Gauge, TextEncoder};

lazy_static! {
    /// Stream sessions currently held by the broker
    pub static ref ACTIVE_SESSIONS: Gauge = register_gauge!(
        "facestream_active_sessions",
        "Stream sessions currently held by the broker"
    )
    .expect("Failed to create active_sessions metric");

    /// Frames handed to the subscriber fan-out
    pub static ref FRAMES_BROADCAST_TOTAL: Counter = register_counter!(
        "facestream_frames_broadcast_total",
        "Frames handed to the subscriber fan-out"
    )
    .expect("Failed to create frames_broadcast_total metric");

    /// Frames evicted from slow subscriber queues (newest-wins policy)
    pub static ref FRAMES_DROPPED_TOTAL: Counter = register_counter!(
        "facestream_frames_dropped_total",
        "Frames evicted from slow subscriber queues"
    )
    .expect("Failed to create frames_dropped_total metric");

    /// Still frames sampled for the recognition pipeline
    pub static ref RECOGNITION_FRAMES_TOTAL: Counter = register_counter!(
        "facestream_recognition_frames_total",
        "Still frames sampled for the recognition pipeline"
    )
    .expect("Failed to create recognition_frames_total metric");

    /// Face detections persisted
    pub static ref DETECTIONS_TOTAL: Counter = register_counter!(
        "facestream_detections_total",
        "Face detections persisted"
    )
    .expect("Failed to create detections_total metric");

    /// Scheduler reconciliation passes
    pub static ref SCHEDULER_RECONCILES_TOTAL: Counter = register_counter!(
        "facestream_scheduler_reconciles_total",
        "Scheduler reconciliation passes"
    )
    .expect("Failed to create scheduler_reconciles_total metric");
}

/// Render the default registry in the text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buffer).to_string()
}
