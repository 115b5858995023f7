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

//! In-memory nearest-neighbour index over 128-D face embeddings.
//!
//! One index instance holds the vectors of every enrolled face in the
//! process. Writers publish copy-on-write snapshots; readers query whatever
//! snapshot was current when they started, so a query never observes a
//! half-applied insert or remove. Distances are cosine (1 − dot product on
//! unit vectors) and every lookup is scoped to a single tenant.

pub mod error;
pub mod index;

pub use error::{IndexError, Result};
pub use index::{FaceIndex, FaceVectorRecord, IndexStats, Neighbor};

/// Dimensionality of every stored embedding.
pub const EMBEDDING_DIM: usize = 128;

/// Accepted L2-norm band for "unit" vectors.
pub const UNIT_NORM_MIN: f32 = 0.99;
pub const UNIT_NORM_MAX: f32 = 1.01;
