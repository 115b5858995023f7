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

//! Still-frame sampling loop for one recognition session.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::constants::{EXTRACTOR_BACKOFF_CAP, EXTRACTOR_FAILURE_LIMIT};
use crate::metrics;
use crate::recognition::{RecognitionSession, RecognitionWorker};
use crate::transcoder::Transcoder;

/// Sample stills at the session's period and push each one through the
/// recognition pipeline.
///
/// The loop is single-flight: a sample that overruns the period makes the
/// ticker skip, and the skip is counted instead of queued. Capture failures
/// don't kill the session; after three in a row it pauses with exponential
/// back-off, then tries again.
pub async fn run_extractor(
    session: Arc<RecognitionSession>,
    transcoder: Arc<dyn Transcoder>,
    worker: Arc<RecognitionWorker>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(session.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut consecutive_failures = 0u32;
    let mut backoff_round = 0u32;

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {}
        }

        let started = Instant::now();
        match transcoder.capture_still(&session.source_url).await {
            Ok(jpeg) => {
                consecutive_failures = 0;
                backoff_round = 0;
                session.mark_healthy();
                session.count_sample();
                metrics::RECOGNITION_FRAMES_TOTAL.inc();

                if let Err(e) = worker
                    .process_frame(&session.camera_id, &session.tenant_id, &jpeg)
                    .await
                {
                    warn!(
                        "recognition session {} (camera {}): pipeline error: {e}",
                        session.id, session.camera_id
                    );
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    "recognition session {} (camera {}): still capture failed ({}/{}): {e}",
                    session.id, session.camera_id, consecutive_failures, EXTRACTOR_FAILURE_LIMIT
                );
                if consecutive_failures >= EXTRACTOR_FAILURE_LIMIT {
                    let pause = session
                        .backoff_base
                        .saturating_mul(1u32 << backoff_round.min(10))
                        .min(EXTRACTOR_BACKOFF_CAP);
                    backoff_round += 1;
                    consecutive_failures = 0;
                    session.mark_unhealthy();
                    error!(
                        "recognition stream unhealthy for camera {}, pausing {pause:?}",
                        session.camera_id
                    );
                    tokio::select! {
                        _ = &mut stop_rx => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                    session.mark_healthy();
                }
            }
        }

        // Anything past one period means the ticker skipped fires.
        let overrun = started.elapsed().as_micros() / session.period.as_micros().max(1);
        if overrun >= 1 {
            session.count_skipped(overrun as u64);
            debug!(
                "recognition session {}: sample overran, {} tick(s) skipped",
                session.id, overrun
            );
        }
    }

    session.mark_finished();
    debug!("recognition session {} loop ended", session.id);
}
