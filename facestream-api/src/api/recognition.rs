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

//! Manual start/stop of per-camera face recognition.

use actix_web::{web, HttpResponse};
use serde::Serialize;
use tracing::error;

use crate::api::{error_response, ApiError};
use crate::models::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionStartResponse {
    pub session_id: String,
    pub camera_id: String,
}

pub async fn start_recognition(
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

    let tenant_id = endpoint.tenant_id.unwrap_or_default();
    match state
        .recognition
        .start(&camera_id, &tenant_id, &endpoint.source_url, None, None)
        .await
    {
        Ok(session_id) => HttpResponse::Ok().json(RecognitionStartResponse {
            session_id,
            camera_id,
        }),
        Err(e) => error_response(&e),
    }
}

pub async fn stop_recognition(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let camera_id = path.into_inner();
    if state.recognition.stop(&camera_id).await {
        HttpResponse::NoContent().finish()
    } else {
        HttpResponse::NotFound().json(ApiError {
            code: "not_running".to_string(),
            message: format!("camera {camera_id} has no recognition session"),
        })
    }
}

pub async fn recognition_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let camera_id = path.into_inner();
    match state.recognition.status(&camera_id).await {
        Some(summary) => HttpResponse::Ok().json(summary),
        None => HttpResponse::NotFound().json(ApiError {
            code: "not_running".to_string(),
            message: format!("camera {camera_id} has no recognition session"),
        }),
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/face-recognition")
            .route(
                "/camera/{camera_id}/start",
                web::post().to(start_recognition),
            )
            .route("/camera/{camera_id}/stop", web::post().to(stop_recognition))
            .route(
                "/camera/{camera_id}/status",
                web::get().to(recognition_status),
            ),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AppState;
    use crate::test_utils::{test_config, FakeTranscoder, MemoryStore};
    use actix_web::{test, App};
    use std::sync::Arc;
    use std::time::Duration;

    async fn test_state() -> web::Data<AppState> {
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        store.put_camera("7", "rtsp://cam/7", Some("tenant-1"));

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
    async fn start_twice_conflicts_then_stop_frees() {
        let state = test_state().await;
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .configure(crate::api::configure),
        )
        .await;

        let first = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/face-recognition/camera/7/start")
                .to_request(),
        )
        .await;
        assert!(first.status().is_success());

        let second = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/face-recognition/camera/7/start")
                .to_request(),
        )
        .await;
        assert_eq!(second.status(), actix_web::http::StatusCode::CONFLICT);

        let status = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/face-recognition/camera/7/status")
                .to_request(),
        )
        .await;
        assert!(status.status().is_success());

        let stop = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/face-recognition/camera/7/stop")
                .to_request(),
        )
        .await;
        assert_eq!(stop.status(), actix_web::http::StatusCode::NO_CONTENT);

        let stop_again = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/face-recognition/camera/7/stop")
                .to_request(),
        )
        .await;
        assert_eq!(stop_again.status(), actix_web::http::StatusCode::NOT_FOUND);
    }
}
