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

//! Seams to the external face detector and embedder.
//!
//! Both models run out of process (an inference sidecar); this module only
//! defines the contract and the HTTP client implementations. Tests plug in
//! fixed-output fakes.

use std::io::Cursor;

use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Pixel-space face location within one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One raw detector hit, before thresholding.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FaceObservation {
    #[serde(flatten)]
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Face detection provider.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    /// All face candidates in the image, unfiltered.
    async fn detect(&self, image: &DynamicImage) -> anyhow::Result<Vec<FaceObservation>>;

    /// Provider name for logging.
    fn name(&self) -> &'static str;
}

/// Face embedding provider.
#[async_trait]
pub trait FaceEmbedder: Send + Sync {
    /// 128-D unit-norm embedding of an aligned face crop.
    async fn embed(&self, face: &DynamicImage) -> anyhow::Result<Vec<f32>>;

    /// Provider name for logging.
    fn name(&self) -> &'static str;
}

/// Detector backed by the inference sidecar's `/detect` endpoint.
pub struct HttpFaceDetector {
    client: reqwest::Client,
    url: String,
}

impl HttpFaceDetector {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl FaceDetector for HttpFaceDetector {
    async fn detect(&self, image: &DynamicImage) -> anyhow::Result<Vec<FaceObservation>> {
        let body = encode_jpeg(image)?;
        let observations = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(body)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<FaceObservation>>()
            .await?;
        Ok(observations)
    }

    fn name(&self) -> &'static str {
        "http-detector"
    }
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// Embedder backed by the inference sidecar's `/embed` endpoint.
pub struct HttpFaceEmbedder {
    client: reqwest::Client,
    url: String,
}

impl HttpFaceEmbedder {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl FaceEmbedder for HttpFaceEmbedder {
    async fn embed(&self, face: &DynamicImage) -> anyhow::Result<Vec<f32>> {
        let body = encode_jpeg(face)?;
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(body)
            .send()
            .await?
            .error_for_status()?
            .json::<EmbedResponse>()
            .await?;
        Ok(response.embedding)
    }

    fn name(&self) -> &'static str {
        "http-embedder"
    }
}

/// JPEG-encode an image for the sidecar or the crop artifact.
pub fn encode_jpeg(image: &DynamicImage) -> anyhow::Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, image::ImageOutputFormat::Jpeg(90))?;
    Ok(out.into_inner())
}
