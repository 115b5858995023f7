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

pub mod protocol;

pub use protocol::{ClientEnvelope, ServerEnvelope};

/// Opaque stream-session identifier (UUID v4, unguessable).
pub type SessionId = String;
/// Camera identifier as stored by the camera registry.
pub type CameraId = String;
/// Tenant identifier; every face vector and detection is scoped to one.
pub type TenantId = String;
/// Scheduled-event identifier.
pub type EventId = String;
