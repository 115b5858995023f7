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

//! Time-driven activation of recognition sessions.
//!
//! Every tick derives the set of (event, camera) pairs that should be live
//! right now from the event table and reconciles the running set against
//! it: start what is missing, stop what no longer belongs. Ticks are
//! serialised by one lock, so a slow reconciliation can never interleave
//! with the next one.

pub mod recurrence;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use facestream_types::{CameraId, EventId, SessionId, TenantId};

use crate::constants::SCHEDULER_BACKOFF_CAP;
use crate::error::{Result, StreamError};
use crate::metrics;
use crate::persistence::EventSource;
use crate::recognition::{RecognitionManager, RecognitionSummary};

type Pair = (EventId, CameraId);

struct BackoffState {
    failures: u32,
    next_attempt: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub started: usize,
    pub stopped: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerHealth {
    pub ticks: u64,
    pub owned_sessions: usize,
    pub tick_secs: u64,
    pub timezone: String,
    pub uptime_secs: u64,
}

pub struct EventScheduler {
    events: Arc<dyn EventSource>,
    recognition: Arc<RecognitionManager>,
    tz: Tz,
    tick: Duration,
    /// Serialises reconciliation; manual commands take it too.
    reconcile_lock: tokio::sync::Mutex<()>,
    /// Sessions this scheduler started, by (event, camera).
    owned: Mutex<HashMap<Pair, SessionId>>,
    backoff: Mutex<HashMap<Pair, BackoffState>>,
    ticks: AtomicU64,
    started_at: Instant,
}

impl EventScheduler {
    pub fn new(
        events: Arc<dyn EventSource>,
        recognition: Arc<RecognitionManager>,
        tz: Tz,
        tick: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            events,
            recognition,
            tz,
            tick,
            reconcile_lock: tokio::sync::Mutex::new(()),
            owned: Mutex::new(HashMap::new()),
            backoff: Mutex::new(HashMap::new()),
            ticks: AtomicU64::new(0),
            started_at: Instant::now(),
        })
    }

    /// Background tick loop; runs until aborted.
    pub fn spawn_tick_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = Utc::now().with_timezone(&scheduler.tz);
                if let Err(e) = scheduler.reconcile_at(now).await {
                    error!("scheduler tick failed: {e}");
                }
            }
        })
    }

    /// One reconciliation pass at an explicit instant. Identical desired and
    /// actual sets make this a no-op.
    pub async fn reconcile_at(&self, now: DateTime<Tz>) -> Result<ReconcileOutcome> {
        let _guard = self.reconcile_lock.lock().await;
        self.ticks.fetch_add(1, Ordering::Relaxed);
        metrics::SCHEDULER_RECONCILES_TOTAL.inc();

        let events = self
            .events
            .list_active_events()
            .await
            .map_err(|e| StreamError::SchedulerReconcileFailed(e.to_string()))?;

        let mut desired: HashMap<Pair, (TenantId, String)> = HashMap::new();
        for event in &events {
            if !recurrence::event_active_at(event, now) {
                continue;
            }
            let cameras = self
                .events
                .list_event_cameras(&event.event_id)
                .await
                .map_err(|e| StreamError::SchedulerReconcileFailed(e.to_string()))?;
            for camera in cameras.into_iter().filter(|c| c.enabled) {
                desired.insert(
                    (event.event_id.clone(), camera.camera_id.clone()),
                    (event.tenant_id.clone(), camera.source_url),
                );
            }
        }

        let mut outcome = ReconcileOutcome {
            started: 0,
            stopped: 0,
        };

        // Stop pairs that fell out of the desired set.
        let to_stop: Vec<Pair> = self
            .owned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|pair| !desired.contains_key(*pair))
            .cloned()
            .collect();
        for pair in to_stop {
            if !self.recognition.stop(&pair.1).await {
                // Already gone; freeing the slot is all that is left.
                warn!(
                    "scheduler: session for event {} camera {} was already gone",
                    pair.0, pair.1
                );
            }
            self.owned
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&pair);
            self.backoff
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&pair);
            info!("scheduler stopped event {} camera {}", pair.0, pair.1);
            outcome.stopped += 1;
        }

        // Start pairs that are newly desired, or whose session died.
        for (pair, (tenant_id, source_url)) in desired {
            let owned = self
                .owned
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(&pair);
            if owned && self.recognition.is_running(&pair.1).await {
                continue;
            }
            if let Some(state) = self
                .backoff
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&pair)
            {
                if Instant::now() < state.next_attempt {
                    continue;
                }
            }

            match self
                .recognition
                .start(&pair.1, &tenant_id, &source_url, None, Some(pair.0.clone()))
                .await
            {
                Ok(session_id) => {
                    info!(
                        "scheduler started event {} camera {} (session {session_id})",
                        pair.0, pair.1
                    );
                    self.owned
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(pair.clone(), session_id);
                    self.backoff
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&pair);
                    outcome.started += 1;
                }
                Err(StreamError::RecognitionSessionExists(_)) if !owned => {
                    // A manually started session already covers the camera;
                    // leave it to its owner.
                }
                Err(e) => {
                    let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
                    let failures = backoff.get(&pair).map(|s| s.failures + 1).unwrap_or(1);
                    let pause = self
                        .tick
                        .saturating_mul(1u32 << failures.min(10))
                        .min(SCHEDULER_BACKOFF_CAP);
                    backoff.insert(
                        pair.clone(),
                        BackoffState {
                            failures,
                            next_attempt: Instant::now() + pause,
                        },
                    );
                    warn!(
                        "scheduler failed to start event {} camera {} (attempt {failures}, retry in {pause:?}): {e}",
                        pair.0, pair.1
                    );
                }
            }
        }

        Ok(outcome)
    }

    /// Start an event's sessions right now, regardless of its window. The
    /// next tick reconciles, so the sessions survive only while the event
    /// evaluates active.
    pub async fn manually_start_event(&self, event_id: &str) -> Result<usize> {
        let _guard = self.reconcile_lock.lock().await;
        let events = self
            .events
            .list_active_events()
            .await
            .map_err(|e| StreamError::SchedulerReconcileFailed(e.to_string()))?;
        let event = events
            .iter()
            .find(|e| e.event_id == event_id)
            .ok_or_else(|| {
                StreamError::SchedulerReconcileFailed(format!(
                    "event {event_id} is unknown or inactive"
                ))
            })?;

        let cameras = self
            .events
            .list_event_cameras(event_id)
            .await
            .map_err(|e| StreamError::SchedulerReconcileFailed(e.to_string()))?;

        let mut started = 0;
        for camera in cameras.into_iter().filter(|c| c.enabled) {
            let pair = (event_id.to_string(), camera.camera_id.clone());
            match self
                .recognition
                .start(
                    &camera.camera_id,
                    &event.tenant_id,
                    &camera.source_url,
                    None,
                    Some(event_id.to_string()),
                )
                .await
            {
                Ok(session_id) => {
                    self.owned
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(pair, session_id);
                    started += 1;
                }
                Err(StreamError::RecognitionSessionExists(_)) => {}
                Err(e) => warn!("manual start of {event_id}/{}: {e}", camera.camera_id),
            }
        }
        info!("manually started event {event_id}: {started} sessions");
        Ok(started)
    }

    /// Stop every session this scheduler runs for an event.
    pub async fn manually_stop_event(&self, event_id: &str) -> Result<usize> {
        let _guard = self.reconcile_lock.lock().await;
        let pairs: Vec<Pair> = self
            .owned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|(event, _)| event == event_id)
            .cloned()
            .collect();

        let mut stopped = 0;
        for pair in pairs {
            self.recognition.stop(&pair.1).await;
            self.owned
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&pair);
            self.backoff
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&pair);
            stopped += 1;
        }
        info!("manually stopped event {event_id}: {stopped} sessions");
        Ok(stopped)
    }

    /// Flip the event's `active` flag. The next tick picks the change up.
    pub async fn toggle_event_status(&self, event_id: &str) -> Result<bool> {
        let events = self
            .events
            .list_active_events()
            .await
            .map_err(|e| StreamError::SchedulerReconcileFailed(e.to_string()))?;
        let currently_active = events.iter().any(|e| e.event_id == event_id);
        self.events
            .set_event_active(event_id, !currently_active)
            .await
            .map_err(|e| StreamError::SchedulerReconcileFailed(e.to_string()))?;
        Ok(!currently_active)
    }

    pub fn health(&self) -> SchedulerHealth {
        SchedulerHealth {
            ticks: self.ticks.load(Ordering::Relaxed),
            owned_sessions: self
                .owned
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            tick_secs: self.tick.as_secs(),
            timezone: self.tz.to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Summaries of the sessions this scheduler owns.
    pub async fn list_sessions(&self) -> Vec<RecognitionSummary> {
        let cameras: Vec<CameraId> = self
            .owned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .map(|(_, camera)| camera.clone())
            .collect();
        let mut summaries = Vec::with_capacity(cameras.len());
        for camera in cameras {
            if let Some(summary) = self.recognition.status(&camera).await {
                summaries.push(summary);
            }
        }
        summaries
    }

    /// Stop the owned sessions; used on process shutdown after the tick
    /// loop is aborted.
    pub async fn shutdown(&self) {
        let pairs: Vec<Pair> = self
            .owned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(pair, _)| pair)
            .collect();
        info!("scheduler shutdown: stopping {} sessions", pairs.len());
        for pair in pairs {
            self.recognition.stop(&pair.1).await;
        }
    }
}
