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

use std::time::Duration;

/// WebSocket ping cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A client that has not answered a ping within this window is dropped.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of the broker's idle-session sweep.
pub const IDLE_GC_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive still-capture failures before a recognition session is
/// declared unhealthy and paused.
pub const EXTRACTOR_FAILURE_LIMIT: u32 = 3;

/// Base and cap of the extractor's unhealthy-session pause.
pub const EXTRACTOR_BACKOFF_BASE: Duration = Duration::from_secs(10);
pub const EXTRACTOR_BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Cap of the scheduler's per-(event, camera) start back-off.
pub const SCHEDULER_BACKOFF_CAP: Duration = Duration::from_secs(300);
