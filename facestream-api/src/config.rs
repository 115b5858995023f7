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

//! Process configuration, read once from the environment at startup.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Encoding parameters for the viewer-path transcoder.
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// JPEG quality, ffmpeg `-q:v` scale (2 best … 31 worst).
    pub quality: u32,
}

/// Frame-size filter and desync guard for the MJPEG framer.
#[derive(Debug, Clone)]
pub struct FramerConfig {
    pub min_bytes: usize,
    pub max_bytes: usize,
    pub buffer_max: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub ffmpeg_bin: String,
    pub viewer: ViewerConfig,
    pub framer: FramerConfig,
    pub subscriber_queue_capacity: usize,
    pub viewer_idle_timeout: Duration,
    pub transcoder_start_timeout: Duration,
    pub transcoder_still_timeout: Duration,
    pub transcoder_kill_timeout: Duration,
    pub recognition_period: Duration,
    pub detect_threshold: f32,
    pub match_strong: f32,
    pub match_weak: f32,
    pub embed_parallelism: usize,
    pub image_pool_size: usize,
    pub image_queue_max: usize,
    pub scheduler_tick: Duration,
    pub server_tz: chrono_tz::Tz,
    pub actix_port: u16,
    pub database_url: Option<String>,
    pub detector_url: String,
    pub embedder_url: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            ffmpeg_bin: env_or("FFMPEG_BIN", "ffmpeg".to_string()),
            viewer: ViewerConfig {
                fps: env_or("VIEWER_FPS", 15),
                width: env_or("VIEWER_WIDTH", 800),
                height: env_or("VIEWER_HEIGHT", 600),
                quality: env_or("VIEWER_QUALITY", 5),
            },
            framer: FramerConfig {
                min_bytes: env_or("FRAMER_MIN_BYTES", 1024),
                max_bytes: env_or("FRAMER_MAX_BYTES", 512_000),
                buffer_max: env_or("FRAMER_BUFFER_MAX", 2 * 1024 * 1024),
            },
            subscriber_queue_capacity: env_or("SUBSCRIBER_QUEUE_CAPACITY", 4),
            viewer_idle_timeout: secs_env("VIEWER_IDLE_TIMEOUT_SECS", 300),
            transcoder_start_timeout: secs_env("TRANSCODER_START_TIMEOUT_SECS", 2),
            transcoder_still_timeout: secs_env("TRANSCODER_STILL_TIMEOUT_SECS", 5),
            transcoder_kill_timeout: secs_env("TRANSCODER_KILL_TIMEOUT_SECS", 5),
            recognition_period: secs_env("RECOGNITION_PERIOD_SECS", 5),
            detect_threshold: env_or("DETECT_THRESHOLD", 0.5),
            match_strong: env_or("MATCH_STRONG", 0.35),
            match_weak: env_or("MATCH_WEAK", 0.5),
            embed_parallelism: env_or("EMBED_PARALLELISM", cpus),
            image_pool_size: env_or("IMAGE_POOL_SIZE", 4),
            image_queue_max: env_or("IMAGE_QUEUE_MAX", 100),
            scheduler_tick: secs_env("SCHEDULER_TICK_SECS", 10),
            server_tz: env_or("SERVER_TZ", chrono_tz::UTC),
            actix_port: env_or("ACTIX_PORT", 8080),
            database_url: std::env::var("DATABASE_URL").ok(),
            detector_url: env_or("DETECTOR_URL", "http://localhost:9010/detect".to_string()),
            embedder_url: env_or("EMBEDDER_URL", "http://localhost:9010/embed".to_string()),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("invalid value for {key}: {raw:?}, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn secs_env(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_or(key, default_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        // Scoped to keys no other test mutates.
        let cfg = AppConfig::from_env();
        assert_eq!(cfg.viewer.fps, 15);
        assert_eq!(cfg.viewer.quality, 5);
        assert_eq!(cfg.framer.min_bytes, 1024);
        assert_eq!(cfg.subscriber_queue_capacity, 4);
        assert_eq!(cfg.match_strong, 0.35);
        assert_eq!(cfg.scheduler_tick, Duration::from_secs(10));
        assert_eq!(cfg.server_tz, chrono_tz::UTC);
    }
}
