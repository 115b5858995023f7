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

/// Result type for index operations
pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors that can occur in index operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("Vector has {got} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Vector is not unit-norm (‖v‖₂ = {norm})")]
    BadVector { norm: f32 },

    #[error("Face {person_face_id} is already enrolled under another tenant")]
    CrossTenant { person_face_id: String },

    #[error("Tenant id must not be empty")]
    EmptyTenant,
}
