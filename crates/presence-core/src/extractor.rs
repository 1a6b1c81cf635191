//! Embedding provider seam and face quality gating.
//!
//! The provider (detector + embedder) is external. This module decodes the
//! uploaded image, hands it to the provider, and picks the one face whose
//! descriptor is usable for matching.

use crate::types::{BoundingBox, Descriptor};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum detector confidence for a usable face.
pub const MIN_FACE_CONFIDENCE: f32 = 0.9;
/// Minimum width and height of a usable face box, after clipping to the image.
pub const MIN_FACE_SIZE_PX: f32 = 48.0;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("image buffer is empty")]
    EmptyImage,
    #[error("image could not be decoded: {0}")]
    InvalidImage(String),
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),
    #[error("embedding provider protocol error: {0}")]
    Protocol(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    /// True for errors caused by the caller's input rather than the provider.
    pub fn is_input_error(&self) -> bool {
        matches!(self, ProviderError::EmptyImage | ProviderError::InvalidImage(_))
    }
}

/// A detected face with its descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceCandidate {
    pub bbox: BoundingBox,
    pub descriptor: Descriptor,
}

/// External face detection + embedding capability.
///
/// Constructed and opened once by the process bootstrap; never a global.
pub trait EmbeddingProvider: Send {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    /// Load models or start helper processes.
    fn open(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Detect all faces in `image`, each with a descriptor.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceCandidate>, ProviderError>;

    fn close(&mut self) {}
}

/// Why no usable descriptor came out of an image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NoFaceReason {
    NoFace,
    LowConfidence { confidence: f32 },
    FaceTooSmall { width: f32, height: f32 },
    /// Extraction did not finish within the configured timeout.
    Timeout,
}

/// Decode an encoded image (JPEG, PNG, ...) into RGB8.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ProviderError> {
    if bytes.is_empty() {
        return Err(ProviderError::EmptyImage);
    }
    let img = image::load_from_memory(bytes)
        .map_err(|e| ProviderError::InvalidImage(e.to_string()))?;
    Ok(img.to_rgb8())
}

/// Quality gate applied to provider output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceGate {
    pub min_confidence: f32,
    pub min_size_px: f32,
}

impl Default for FaceGate {
    fn default() -> Self {
        Self {
            min_confidence: MIN_FACE_CONFIDENCE,
            min_size_px: MIN_FACE_SIZE_PX,
        }
    }
}

impl FaceGate {
    /// Pick the most confident face and check it is usable.
    pub fn select(
        &self,
        candidates: Vec<FaceCandidate>,
        image_width: u32,
        image_height: u32,
    ) -> Result<Descriptor, NoFaceReason> {
        let best = candidates
            .into_iter()
            .filter(|c| !c.descriptor.is_empty())
            .max_by(|a, b| {
                a.bbox
                    .confidence
                    .partial_cmp(&b.bbox.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or(NoFaceReason::NoFace)?;

        let bbox = best.bbox;
        if bbox.confidence < self.min_confidence {
            return Err(NoFaceReason::LowConfidence { confidence: bbox.confidence });
        }
        if bbox.width <= 0.0 || bbox.height <= 0.0 {
            return Err(NoFaceReason::FaceTooSmall { width: bbox.width, height: bbox.height });
        }

        let (width, height) = clipped_size(&bbox, image_width as f32, image_height as f32);
        if width < self.min_size_px || height < self.min_size_px {
            return Err(NoFaceReason::FaceTooSmall { width, height });
        }

        Ok(best.descriptor)
    }
}

/// Width and height of `bbox` once its origin is clamped into the image.
fn clipped_size(bbox: &BoundingBox, image_width: f32, image_height: f32) -> (f32, f32) {
    let x = bbox.x.max(0.0);
    let y = bbox.y.max(0.0);
    let width = bbox.width.min(image_width - x);
    let height = bbox.height.min(image_height - y);
    (width, height)
}
