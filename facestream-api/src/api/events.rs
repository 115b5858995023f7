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

//! Scheduler-facing endpoints: health, owned sessions, manual overrides.

use actix_web::{web, HttpResponse};
use serde::Serialize;
use tracing::error;

use crate::api::error_response;
use crate::models::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualActionResponse {
    pub event_id: String,
    pub sessions: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleResponse {
    pub event_id: String,
    pub active: bool,
}

pub async fn scheduler_health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.scheduler.health())
}

pub async fn scheduler_sessions(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.scheduler.list_sessions().await)
}

pub async fn scheduled_events(state: web::Data<AppState>) -> HttpResponse {
    match state.events.list_active_events().await {
        Ok(events) => HttpResponse::Ok().json(events),
        Err(e) => {
            error!("listing scheduled events failed: {e}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

pub async fn start_event(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let event_id = path.into_inner();
    match state.scheduler.manually_start_event(&event_id).await {
        Ok(sessions) => HttpResponse::Ok().json(ManualActionResponse { event_id, sessions }),
        Err(e) => error_response(&e),
    }
}

pub async fn stop_event(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let event_id = path.into_inner();
    match state.scheduler.manually_stop_event(&event_id).await {
        Ok(sessions) => HttpResponse::Ok().json(ManualActionResponse { event_id, sessions }),
        Err(e) => error_response(&e),
    }
}

pub async fn toggle_event(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let event_id = path.into_inner();
    match state.scheduler.toggle_event_status(&event_id).await {
        Ok(active) => HttpResponse::Ok().json(ToggleResponse { event_id, active }),
        Err(e) => error_response(&e),
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/events")
            .route("/scheduler/health", web::get().to(scheduler_health))
            .route("/scheduler/sessions", web::get().to(scheduler_sessions))
            .route("/scheduled", web::get().to(scheduled_events))
            .route("/{event_id}/start", web::post().to(start_event))
            .route("/{event_id}/stop", web::post().to(stop_event))
            .route("/{event_id}/toggle-status", web::patch().to(toggle_event)),
    );
}
