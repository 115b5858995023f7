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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use facestream_types::{CameraId, SessionId, TenantId};

use crate::broker::subscribers::SubscriberSet;
use crate::framer::MjpegFramer;
use crate::metrics;
use crate::transcoder::{TranscoderEvent, TranscoderHandle};

/// Viewer sessions move strictly forward through these states; `is_active`
/// readers always observe one consistent value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Active,
    Stopping,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Viewer,
    Recognition,
}

/// One live camera stream owned by the broker, together with its transcoder
/// child and its set of subscribers.
pub struct StreamSession {
    pub id: SessionId,
    pub camera_id: CameraId,
    pub tenant_id: Option<TenantId>,
    pub source_url: String,
    pub kind: SessionKind,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub subscribers: SubscriberSet,
    state: Mutex<SessionState>,
    last_accessed: Mutex<Instant>,
    /// Set while the session has zero subscribers; cleared on subscribe.
    idle_since: Mutex<Option<Instant>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    frames: AtomicU64,
}

/// What `list_active` reports per session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub camera_id: CameraId,
    pub kind: SessionKind,
    pub state: SessionState,
    pub subscribers: usize,
    pub frames: u64,
    pub created_at: i64,
}

impl StreamSession {
    pub fn new(
        id: SessionId,
        camera_id: CameraId,
        tenant_id: Option<TenantId>,
        source_url: String,
        queue_capacity: usize,
        stop_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            subscribers: SubscriberSet::new(id.clone(), queue_capacity),
            id,
            camera_id,
            tenant_id,
            source_url,
            kind: SessionKind::Viewer,
            created_at: chrono::Utc::now(),
            state: Mutex::new(SessionState::Starting),
            last_accessed: Mutex::new(Instant::now()),
            idle_since: Mutex::new(Some(Instant::now())),
            stop_tx: Mutex::new(Some(stop_tx)),
            frames: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Move forward in the state machine. Backward transitions are ignored,
    /// which makes concurrent stop paths converge instead of fighting.
    pub fn advance_to(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if next > *state {
            debug!("session {}: {:?} -> {:?}", self.id, *state, next);
            *state = next;
            true
        } else {
            false
        }
    }

    pub fn touch(&self) {
        *self.last_accessed.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn mark_busy(&self) {
        *self.idle_since.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.touch();
    }

    pub fn mark_idle(&self) {
        let mut idle = self.idle_since.lock().unwrap_or_else(|e| e.into_inner());
        if idle.is_none() {
            *idle = Some(Instant::now());
        }
    }

    /// How long this session has had zero subscribers, if it has.
    pub fn idle_for(&self) -> Option<std::time::Duration> {
        self.idle_since
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|since| since.elapsed())
    }

    /// Ask the pump task to shut the transcoder down. Idempotent.
    pub fn request_stop(&self) {
        self.advance_to(SessionState::Stopping);
        if let Some(tx) = self
            .stop_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(());
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            camera_id: self.camera_id.clone(),
            kind: self.kind,
            state: self.state(),
            subscribers: self.subscribers.count(),
            frames: self.frames(),
            created_at: self.created_at.timestamp_millis(),
        }
    }
}

/// Reason a session's pump finished; the broker turns this into the
/// farewell message and registry cleanup.
#[derive(Debug)]
pub enum SessionEnd {
    /// Operator or idle GC asked for the stop.
    Requested,
    /// The transcoder died on its own.
    TranscoderExited {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Per-session pump: transcoder events in, framed JPEGs out to subscribers.
///
/// Runs until the transcoder reports `Exit`. A stop request interrupts the
/// child and keeps draining so the exit status is still observed.
pub async fn pump_session(
    session: &StreamSession,
    mut handle: TranscoderHandle,
    mut framer: MjpegFramer,
    mut stop_rx: oneshot::Receiver<()>,
    activated: oneshot::Sender<()>,
) -> SessionEnd {
    let mut activated = Some(activated);
    let mut stop_requested = false;
    let mut desyncs_seen = 0u64;

    loop {
        let event = tokio::select! {
            event = handle.next_event() => event,
            _ = &mut stop_rx, if !stop_requested => {
                stop_requested = true;
                handle.stop();
                continue;
            }
        };

        match event {
            Some(TranscoderEvent::Bytes(chunk)) => {
                for frame in framer.push(&chunk) {
                    if let Some(tx) = activated.take() {
                        session.advance_to(SessionState::Active);
                        let _ = tx.send(());
                    }
                    session.frames.fetch_add(1, Ordering::Relaxed);
                    metrics::FRAMES_BROADCAST_TOTAL.inc();
                    session
                        .subscribers
                        .broadcast(&frame, chrono::Utc::now().timestamp_millis());
                }
                let desyncs = framer.desyncs();
                if desyncs > desyncs_seen {
                    warn!(
                        "session {}: framer lost sync ({} so far), buffer reset",
                        session.id, desyncs
                    );
                    desyncs_seen = desyncs;
                }
            }
            Some(TranscoderEvent::Stderr(line)) => {
                // ffmpeg announces the output stream before the first bytes
                // hit stdout; either signal marks the session active.
                if activated.is_some() && stderr_signals_start(&line) {
                    if let Some(tx) = activated.take() {
                        session.advance_to(SessionState::Active);
                        let _ = tx.send(());
                    }
                }
                debug!("session {} transcoder: {line}", session.id);
            }
            Some(TranscoderEvent::Exit { code, signal }) => {
                if stop_requested {
                    return SessionEnd::Requested;
                }
                return SessionEnd::TranscoderExited { code, signal };
            }
            None => {
                if stop_requested {
                    return SessionEnd::Requested;
                }
                return SessionEnd::TranscoderExited {
                    code: None,
                    signal: None,
                };
            }
        }
    }
}

fn stderr_signals_start(line: &str) -> bool {
    line.contains("Output #0") || line.trim_start().starts_with("frame=")
}
