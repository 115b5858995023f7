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

use thiserror::Error;

/// Result type for streaming and recognition operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Failure conditions of the streaming core.
///
/// Most of these recover locally (drop a frame, drop a subscriber, retry a
/// tick); only the session-scoped ones surface to REST or WebSocket callers.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Transcoder binary {0:?} is not available")]
    TranscoderUnavailable(String),

    #[error("Transcoder produced no output within {0:?}")]
    TranscoderStartTimeout(std::time::Duration),

    #[error("Transcoder exited unexpectedly (code {code:?}, signal {signal:?})")]
    TranscoderExited {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("Stream for camera {0} did not become active in time")]
    StreamStartTimeout(String),

    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Session {0} is not active")]
    SessionInactive(String),

    #[error("Camera {0} already has a recognition session")]
    RecognitionSessionExists(String),

    #[error("Recognition stream for camera {0} is unhealthy")]
    RecognitionStreamUnhealthy(String),

    #[error("Embedder failed: {0}")]
    EmbedderFailed(String),

    #[error("Scheduler reconciliation failed: {0}")]
    SchedulerReconcileFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Human-readable form for the WebSocket `error` envelope.
    pub fn user_message(&self) -> String {
        match self {
            StreamError::SessionNotFound(id) => format!("stream session {id} does not exist"),
            StreamError::SessionInactive(id) => format!("stream session {id} is not active"),
            StreamError::StreamStartTimeout(camera) => {
                format!("camera {camera} did not start streaming in time")
            }
            StreamError::TranscoderUnavailable(_) => {
                "video transcoder is not available on this host".to_string()
            }
            other => other.to_string(),
        }
    }
}
