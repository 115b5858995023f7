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

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use actix_web_actors::ws;
use tracing::info;

use facestream::actors::viewer_session::WsViewerSession;
use facestream::api;
use facestream::broker::StreamBroker;
use facestream::config::AppConfig;
use facestream::detect::{HttpFaceDetector, HttpFaceEmbedder};
use facestream::models::AppState;
use facestream::persistence::{FaceVectorSource, PostgresStore};
use facestream::recognition::{RecognitionManager, RecognitionWorker};
use facestream::scheduler::EventScheduler;
use facestream::transcoder::FfmpegTranscoder;
use facestream_index::FaceIndex;

async fn ws_stream(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    ws::start(
        WsViewerSession::new(Arc::clone(&state.broker)),
        &req,
        stream,
    )
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AppConfig::from_env();
    let database_url = config
        .database_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let store = Arc::new(PostgresStore::connect(&database_url).await?);

    // Warm the face index from the enrolment table before serving traffic.
    let index = Arc::new(FaceIndex::new());
    let vectors = store.list_active_face_vectors(None).await?;
    let loaded = index.rebuild(vectors);
    info!("face index ready with {loaded} vectors");

    let transcoder = Arc::new(FfmpegTranscoder::new(&config));
    let worker = Arc::new(RecognitionWorker::new(
        &config,
        Arc::new(HttpFaceDetector::new(config.detector_url.clone())),
        Arc::new(HttpFaceEmbedder::new(config.embedder_url.clone())),
        Arc::clone(&index),
        store.clone(),
    ));
    let recognition = RecognitionManager::new(
        transcoder.clone(),
        worker,
        config.recognition_period,
    );
    let broker = StreamBroker::new(config.clone(), transcoder);
    let scheduler = EventScheduler::new(
        store.clone(),
        Arc::clone(&recognition),
        config.server_tz,
        config.scheduler_tick,
    );

    let reaper = broker.spawn_idle_reaper();
    let tick_loop = scheduler.spawn_tick_loop();

    let state = web::Data::new(AppState {
        config: config.clone(),
        broker: Arc::clone(&broker),
        recognition: Arc::clone(&recognition),
        scheduler: Arc::clone(&scheduler),
        index,
        cameras: store.clone(),
        events: store,
    });

    info!("stream server listening on port {}", config.actix_port);
    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(state.clone())
            .route("/ws/stream", web::get().to(ws_stream))
            .configure(api::configure)
    })
    .bind(("0.0.0.0", config.actix_port))?
    .run()
    .await?;

    info!("server stopped, shutting the core down");
    reaper.abort();
    tick_loop.abort();
    scheduler.shutdown().await;
    recognition.shutdown().await;
    broker.shutdown().await;
    Ok(())
}
