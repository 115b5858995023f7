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

//! Viewer-stream endpoints.

use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::api::{error_response, ApiError};
use crate::models::AppState;

/// Path clients connect their WebSocket to.
pub const STREAM_WS_PATH: &str = "/ws/stream";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartStreamResponse {
    pub session_id: String,
    pub stream_url: String,
    pub camera_id: String,
    pub rtsp_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatusResponse {
    pub session_id: String,
    pub is_active: bool,
    pub stream_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraStreamResponse {
    pub session_id: String,
    pub stream_url: String,
    pub camera_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    pub session_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupForm {
    pub session_ids: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOutcome {
    pub session_id: String,
    pub outcome: String,
}

pub async fn start_stream(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let camera_id = path.into_inner();
    let endpoint = match state.cameras.camera_endpoint(&camera_id).await {
        Ok(Some(endpoint)) => endpoint,
        Ok(None) => {
            return HttpResponse::NotFound().json(ApiError {
                code: "unknown_camera".to_string(),
                message: format!("camera {camera_id} is not registered"),
            })
        }
        Err(e) => {
            error!("camera lookup failed: {e}");
            return HttpResponse::InternalServerError().finish();
        }
    };

    match state
        .broker
        .start_viewer_stream(&camera_id, &endpoint.source_url, endpoint.tenant_id)
        .await
    {
        Ok(session_id) => HttpResponse::Ok().json(StartStreamResponse {
            session_id,
            stream_url: STREAM_WS_PATH.to_string(),
            camera_id,
            rtsp_url: endpoint.source_url,
        }),
        Err(e) => error_response(&e),
    }
}

pub async fn stop_stream(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let session_id = path.into_inner();
    state.broker.stop_stream(&session_id).await;
    HttpResponse::NoContent().finish()
}

pub async fn stream_status(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let session_id = path.into_inner();
    HttpResponse::Ok().json(StreamStatusResponse {
        is_active: state.broker.is_active(&session_id).await,
        session_id,
        stream_url: STREAM_WS_PATH.to_string(),
    })
}

pub async fn camera_stream_url(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let camera_id = path.into_inner();
    match state.broker.viewer_session_for_camera(&camera_id).await {
        Some(session) => HttpResponse::Ok().json(CameraStreamResponse {
            session_id: session.id.clone(),
            stream_url: STREAM_WS_PATH.to_string(),
            camera_id,
        }),
        None => HttpResponse::NotFound().json(ApiError {
            code: "no_stream".to_string(),
            message: format!("camera {camera_id} has no viewer stream"),
        }),
    }
}

/// Bulk stop. Accepts either a JSON body `{"sessionIds": [...]}` or a form
/// field `sessionIds=a,b,c`, and reports a per-id outcome either way.
pub async fn cleanup(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    let content_type = req
        .headers()
        .get(actix_web::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let session_ids: Vec<String> = if content_type.starts_with("application/json") {
        match serde_json::from_slice::<CleanupRequest>(&body) {
            Ok(request) => request.session_ids,
            Err(e) => {
                return HttpResponse::BadRequest().json(ApiError {
                    code: "bad_request".to_string(),
                    message: format!("invalid cleanup body: {e}"),
                })
            }
        }
    } else {
        match serde_urlencoded::from_bytes::<CleanupForm>(&body) {
            Ok(form) => form
                .session_ids
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(e) => {
                return HttpResponse::BadRequest().json(ApiError {
                    code: "bad_request".to_string(),
                    message: format!("invalid cleanup form: {e}"),
                })
            }
        }
    };

    let mut outcomes = Vec::with_capacity(session_ids.len());
    for session_id in session_ids {
        let outcome = if state.broker.stop_stream(&session_id).await {
            "stopped"
        } else {
            "not_found"
        };
        outcomes.push(CleanupOutcome {
            session_id,
            outcome: outcome.to_string(),
        });
    }
    HttpResponse::Ok().json(outcomes)
}

pub async fn active_streams(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.broker.list_active().await)
}

pub async fn stream_health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.broker.health().await)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/streams")
            .route("/start/{camera_id}", web::post().to(start_stream))
            .route("/stop/{session_id}", web::post().to(stop_stream))
            .route("/status/{session_id}", web::get().to(stream_status))
            .route("/camera/{camera_id}/url", web::get().to(camera_stream_url))
            .route("/cleanup", web::post().to(cleanup))
            .route("/active", web::get().to(active_streams))
            .route("/health", web::get().to(stream_health)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_config, FakeTranscoder, MemoryStore};
    use actix_web::{test, App};
    use std::sync::Arc;
    use std::time::Duration;

    async fn test_state() -> web::Data<AppState> {
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        store.put_camera("42", "rtsp://cam/42", Some("tenant-1"));

        let transcoder = Arc::new(FakeTranscoder::streaming());
        let broker = crate::broker::StreamBroker::new(config.clone(), transcoder.clone());
        let (worker, _) = crate::recognition::tests_support::test_worker();
        let recognition = crate::recognition::RecognitionManager::new(
            transcoder,
            worker,
            Duration::from_millis(20),
        );
        let scheduler = crate::scheduler::EventScheduler::new(
            Arc::clone(&store) as Arc<dyn crate::persistence::EventSource>,
            Arc::clone(&recognition),
            chrono_tz::UTC,
            Duration::from_secs(10),
        );
        web::Data::new(AppState {
            config,
            broker,
            recognition,
            scheduler,
            index: Arc::new(facestream_index::FaceIndex::new()),
            cameras: store.clone(),
            events: store,
        })
    }

    #[actix_rt::test]
    async fn start_then_status_then_stop() {
        let state = test_state().await;
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .configure(crate::api::configure),
        )
        .await;

        let resp: StartResponseProbe = test::call_and_read_body_json(
            &app,
            test::TestRequest::post()
                .uri("/streams/start/42")
                .to_request(),
        )
        .await;
        assert_eq!(resp.camera_id, "42");
        assert_eq!(resp.stream_url, STREAM_WS_PATH);

        let status: StatusProbe = test::call_and_read_body_json(
            &app,
            test::TestRequest::get()
                .uri(&format!("/streams/status/{}", resp.session_id))
                .to_request(),
        )
        .await;
        assert!(status.is_active);

        let stop = test::call_service(
            &app,
            test::TestRequest::post()
                .uri(&format!("/streams/stop/{}", resp.session_id))
                .to_request(),
        )
        .await;
        assert_eq!(stop.status(), actix_web::http::StatusCode::NO_CONTENT);
    }

    #[actix_rt::test]
    async fn unknown_camera_is_a_404() {
        let state = test_state().await;
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .configure(crate::api::configure),
        )
        .await;
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/streams/start/unknown")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
    }

    #[actix_rt::test]
    async fn cleanup_reports_per_id_outcomes_both_encodings() {
        let state = test_state().await;
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .configure(crate::api::configure),
        )
        .await;

        let started: StartResponseProbe = test::call_and_read_body_json(
            &app,
            test::TestRequest::post()
                .uri("/streams/start/42")
                .to_request(),
        )
        .await;

        // JSON body; "b" was never a session.
        let outcomes: Vec<CleanupOutcome> = test::call_and_read_body_json(
            &app,
            test::TestRequest::post()
                .uri("/streams/cleanup")
                .set_json(serde_json::json!({ "sessionIds": [started.session_id, "b"] }))
                .to_request(),
        )
        .await;
        assert_eq!(outcomes[0].outcome, "stopped");
        assert_eq!(outcomes[1].outcome, "not_found");

        // Repeat as a form: everything is now benignly absent.
        let body = format!("sessionIds={},b", started.session_id);
        let outcomes: Vec<CleanupOutcome> = test::call_and_read_body_json(
            &app,
            test::TestRequest::post()
                .uri("/streams/cleanup")
                .insert_header((
                    actix_web::http::header::CONTENT_TYPE,
                    "application/x-www-form-urlencoded",
                ))
                .set_payload(body)
                .to_request(),
        )
        .await;
        assert!(outcomes.iter().all(|o| o.outcome == "not_found"));
    }

    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct StartResponseProbe {
        session_id: String,
        stream_url: String,
        camera_id: String,
    }

    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct StatusProbe {
        is_active: bool,
    }
}
