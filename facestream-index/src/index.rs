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

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::error::{IndexError, Result};
use crate::{EMBEDDING_DIM, UNIT_NORM_MAX, UNIT_NORM_MIN};

/// One enrolled face vector as handed over by the persistence layer.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceVectorRecord {
    pub person_face_id: String,
    pub tenant_id: String,
    pub vector: Vec<f32>,
}

/// A query hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub person_face_id: String,
    /// Cosine distance, 0.0 = identical direction.
    pub distance: f32,
}

/// Aggregate counters reported by [`FaceIndex::stats`].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexStats {
    pub total_faces: usize,
    pub tenants: usize,
    /// Wall time of the last `rebuild` in milliseconds.
    pub build_millis: u128,
}

#[derive(Debug, Clone)]
struct Entry {
    person_face_id: String,
    vector: Vec<f32>,
}

/// Immutable view of the index at one point in time. Tenant buckets are
/// shared `Arc`s so publishing a new snapshot after a single-tenant write
/// only copies that tenant's entries.
#[derive(Debug, Default)]
struct Snapshot {
    tenants: HashMap<String, Arc<Vec<Entry>>>,
    face_tenant: HashMap<String, String>,
    build_millis: u128,
}

impl Snapshot {
    fn total_faces(&self) -> usize {
        self.face_tenant.len()
    }
}

/// Process-wide face vector index.
///
/// Single writer, many concurrent readers: mutations take the write lock,
/// derive a new [`Snapshot`] and publish it; `query` clones the current
/// snapshot `Arc` under the read lock and scans without holding any lock.
/// The scan is an exact brute-force pass, which stays comfortably inside
/// budget for the enrolment sizes this process handles (≤ 10⁵ faces).
#[derive(Debug, Default)]
pub struct FaceIndex {
    current: RwLock<Arc<Snapshot>>,
}

impl FaceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enrol or replace one face vector.
    ///
    /// The vector must be 128-D and unit-norm. Re-inserting an id under the
    /// same tenant replaces its vector; re-inserting under a different
    /// tenant is refused.
    pub fn insert(&self, person_face_id: &str, tenant_id: &str, vector: Vec<f32>) -> Result<()> {
        if tenant_id.is_empty() {
            return Err(IndexError::EmptyTenant);
        }
        validate_vector(&vector)?;

        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let snapshot = &**guard;

        if let Some(existing) = snapshot.face_tenant.get(person_face_id) {
            if existing != tenant_id {
                return Err(IndexError::CrossTenant {
                    person_face_id: person_face_id.to_string(),
                });
            }
        }

        let mut tenants = snapshot.tenants.clone();
        let mut bucket: Vec<Entry> = tenants
            .get(tenant_id)
            .map(|b| b.as_ref().clone())
            .unwrap_or_default();
        match bucket
            .iter_mut()
            .find(|e| e.person_face_id == person_face_id)
        {
            Some(entry) => entry.vector = vector,
            None => bucket.push(Entry {
                person_face_id: person_face_id.to_string(),
                vector,
            }),
        }
        tenants.insert(tenant_id.to_string(), Arc::new(bucket));

        let mut face_tenant = snapshot.face_tenant.clone();
        face_tenant.insert(person_face_id.to_string(), tenant_id.to_string());

        *guard = Arc::new(Snapshot {
            tenants,
            face_tenant,
            build_millis: snapshot.build_millis,
        });
        Ok(())
    }

    /// Remove one face vector. Unknown ids are a no-op.
    pub fn remove(&self, person_face_id: &str) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let snapshot = &**guard;

        let Some(tenant_id) = snapshot.face_tenant.get(person_face_id).cloned() else {
            return;
        };

        let mut tenants = snapshot.tenants.clone();
        if let Some(bucket) = tenants.get(&tenant_id) {
            let remaining: Vec<Entry> = bucket
                .iter()
                .filter(|e| e.person_face_id != person_face_id)
                .cloned()
                .collect();
            if remaining.is_empty() {
                tenants.remove(&tenant_id);
            } else {
                tenants.insert(tenant_id.clone(), Arc::new(remaining));
            }
        }

        let mut face_tenant = snapshot.face_tenant.clone();
        face_tenant.remove(person_face_id);

        *guard = Arc::new(Snapshot {
            tenants,
            face_tenant,
            build_millis: snapshot.build_millis,
        });
    }

    /// Nearest neighbours among the given tenant's faces, closest first.
    ///
    /// The tenant filter is mandatory; vectors enrolled under any other
    /// tenant are invisible to the scan regardless of raw distance.
    pub fn query(&self, tenant_id: &str, vector: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if tenant_id.is_empty() {
            return Err(IndexError::EmptyTenant);
        }
        if vector.len() != EMBEDDING_DIM {
            return Err(IndexError::DimensionMismatch {
                expected: EMBEDDING_DIM,
                got: vector.len(),
            });
        }

        let snapshot = {
            let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
            Arc::clone(&guard)
        };

        let Some(bucket) = snapshot.tenants.get(tenant_id) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<Neighbor> = bucket
            .iter()
            .map(|e| Neighbor {
                person_face_id: e.person_face_id.clone(),
                distance: cosine_distance(vector, &e.vector),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        Ok(hits)
    }

    /// Drop everything and build a fresh snapshot from persistence output.
    ///
    /// Records failing validation are skipped with a warning instead of
    /// aborting the reload; a stale-but-complete index beats no index.
    /// Returns the number of vectors loaded.
    pub fn rebuild<I>(&self, records: I) -> usize
    where
        I: IntoIterator<Item = FaceVectorRecord>,
    {
        let started = Instant::now();
        let mut tenants: HashMap<String, Vec<Entry>> = HashMap::new();
        let mut face_tenant: HashMap<String, String> = HashMap::new();
        let mut skipped = 0usize;

        for record in records {
            if record.tenant_id.is_empty() || validate_vector(&record.vector).is_err() {
                log::warn!(
                    "skipping invalid face vector {} during rebuild",
                    record.person_face_id
                );
                skipped += 1;
                continue;
            }
            face_tenant.insert(record.person_face_id.clone(), record.tenant_id.clone());
            tenants.entry(record.tenant_id).or_default().push(Entry {
                person_face_id: record.person_face_id,
                vector: record.vector,
            });
        }

        let loaded = face_tenant.len();
        let snapshot = Snapshot {
            tenants: tenants
                .into_iter()
                .map(|(t, bucket)| (t, Arc::new(bucket)))
                .collect(),
            face_tenant,
            build_millis: started.elapsed().as_millis(),
        };

        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(snapshot);
        drop(guard);

        if skipped > 0 {
            log::warn!("face index rebuild skipped {skipped} invalid vectors");
        }
        log::info!("face index rebuilt with {loaded} vectors");
        loaded
    }

    pub fn stats(&self) -> IndexStats {
        let snapshot = {
            let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
            Arc::clone(&guard)
        };
        IndexStats {
            total_faces: snapshot.total_faces(),
            tenants: snapshot.tenants.len(),
            build_millis: snapshot.build_millis,
        }
    }

    /// Whether an id is currently enrolled. Mainly for tests and stats.
    pub fn contains(&self, person_face_id: &str) -> bool {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        guard.face_tenant.contains_key(person_face_id)
    }
}

fn validate_vector(vector: &[f32]) -> Result<()> {
    if vector.len() != EMBEDDING_DIM {
        return Err(IndexError::DimensionMismatch {
            expected: EMBEDDING_DIM,
            got: vector.len(),
        });
    }
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !(UNIT_NORM_MIN..=UNIT_NORM_MAX).contains(&norm) {
        return Err(IndexError::BadVector { norm });
    }
    Ok(())
}

/// Cosine distance with norm correction, so slightly-off-unit vectors
/// inside the accepted band still compare fairly.
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = (norm_a.sqrt() * norm_b.sqrt()).max(f32::EPSILON);
    1.0 - dot / denom
}
