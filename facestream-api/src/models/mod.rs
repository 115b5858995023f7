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

use facestream_index::FaceIndex;

use crate::broker::StreamBroker;
use crate::config::AppConfig;
use crate::persistence::{CameraSource, EventSource};
use crate::recognition::RecognitionManager;
use crate::scheduler::EventScheduler;

/// Everything the HTTP/WS layer needs, created once at startup and handed
/// to handlers by capability. There are no ambient globals inside the core.
pub struct AppState {
    pub config: AppConfig,
    pub broker: Arc<StreamBroker>,
    pub recognition: Arc<RecognitionManager>,
    pub scheduler: Arc<EventScheduler>,
    pub index: Arc<FaceIndex>,
    pub cameras: Arc<dyn CameraSource>,
    pub events: Arc<dyn EventSource>,
}
