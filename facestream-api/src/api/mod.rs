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

//! REST surface of the streaming core. Thin handlers over the owned
//! services; authentication sits in front of this in the platform gateway.

pub mod events;
pub mod recognition;
pub mod streams;

use actix_web::{web, HttpResponse};
use serde::Serialize;

use crate::error::StreamError;
use crate::metrics;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// Map core errors onto HTTP statuses.
pub fn error_response(err: &StreamError) -> HttpResponse {
    let (status, code) = match err {
        StreamError::SessionNotFound(_) => (actix_web::http::StatusCode::NOT_FOUND, "not_found"),
        StreamError::SessionInactive(_) => (actix_web::http::StatusCode::CONFLICT, "inactive"),
        StreamError::RecognitionSessionExists(_) => {
            (actix_web::http::StatusCode::CONFLICT, "already_running")
        }
        StreamError::StreamStartTimeout(_)
        | StreamError::TranscoderStartTimeout(_)
        | StreamError::TranscoderExited { .. }
        | StreamError::TranscoderUnavailable(_) => {
            (actix_web::http::StatusCode::BAD_GATEWAY, "upstream_failed")
        }
        _ => (
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
        ),
    };
    HttpResponse::build(status).json(ApiError {
        code: code.to_string(),
        message: err.user_message(),
    })
}

async fn metrics_handler() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::render())
}

/// Register every route of the core.
pub fn configure(cfg: &mut web::ServiceConfig) {
    streams::configure(cfg);
    recognition::configure(cfg);
    events::configure(cfg);
    cfg.route("/metrics", web::get().to(metrics_handler));
}
