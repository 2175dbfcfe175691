use crate::error::EncodingError;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Bins in the CLAHE intensity histogram block.
pub const INTENSITY_BINS: usize = 64;
/// Bins in the local-binary-pattern texture histogram block.
pub const TEXTURE_BINS: usize = 256;
/// Number of Hu shape invariants.
pub const SHAPE_MOMENTS: usize = 7;
/// Bins in the gradient-magnitude histogram block.
pub const GRADIENT_BINS: usize = 32;
/// Total length of a [`FaceEncoding`].
pub const ENCODING_LEN: usize = INTENSITY_BINS + TEXTURE_BINS + SHAPE_MOMENTS + GRADIENT_BINS;

const INTENSITY_RANGE: Range<usize> = 0..INTENSITY_BINS;
const TEXTURE_RANGE: Range<usize> = INTENSITY_BINS..INTENSITY_BINS + TEXTURE_BINS;
const SHAPE_RANGE: Range<usize> = TEXTURE_RANGE.end..TEXTURE_RANGE.end + SHAPE_MOMENTS;
const GRADIENT_RANGE: Range<usize> = SHAPE_RANGE.end..ENCODING_LEN;

/// Magic prefix of the serialized encoding blob.
const BLOB_MAGIC: &[u8; 4] = b"FEN1";
/// Serialized size: magic + 359 little-endian f64 values.
pub const BLOB_LEN: usize = BLOB_MAGIC.len() + ENCODING_LEN * 8;

/// A decoded 3-channel colour image (RGB order).
#[derive(Debug, Clone)]
pub struct PixelGrid {
    image: RgbImage,
}

impl PixelGrid {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn as_image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}

/// Axis-aligned face candidate within a [`PixelGrid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Number of detector windows merged into this region (0 when built by hand).
    pub neighbors: u32,
}

impl FaceRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height, neighbors: 0 }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f64 / self.height as f64
    }

    /// Grow the region by `margin` pixels on every side, clamped to a
    /// `grid_width` × `grid_height` grid. `None` if nothing remains inside.
    pub fn expand_clamped(&self, margin: u32, grid_width: u32, grid_height: u32) -> Option<FaceRegion> {
        let x1 = self.x.saturating_sub(margin);
        let y1 = self.y.saturating_sub(margin);
        let x2 = self.x.saturating_add(self.width).saturating_add(margin).min(grid_width);
        let y2 = self.y.saturating_add(self.height).saturating_add(margin).min(grid_height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(FaceRegion {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            neighbors: self.neighbors,
        })
    }

    /// Copy the region's pixels out of `grid`, clipping at the grid border.
    pub fn crop(&self, grid: &PixelGrid) -> Option<RgbImage> {
        let clipped = self.expand_clamped(0, grid.width(), grid.height())?;
        Some(
            image::imageops::crop_imm(
                grid.as_image(),
                clipped.x,
                clipped.y,
                clipped.width,
                clipped.height,
            )
            .to_image(),
        )
    }
}

/// Fixed-length face feature vector.
///
/// Layout: intensity histogram (64) | LBP texture histogram (256) |
/// Hu moments (7) | gradient histogram (32).
#[derive(Debug, Clone, PartialEq)]
pub struct FaceEncoding {
    values: Vec<f64>,
}

impl FaceEncoding {
    pub fn from_values(values: Vec<f64>) -> Result<Self, EncodingError> {
        if values.len() != ENCODING_LEN {
            return Err(EncodingError::InvalidLength {
                expected: ENCODING_LEN,
                actual: values.len(),
            });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn intensity(&self) -> &[f64] {
        &self.values[INTENSITY_RANGE]
    }

    pub fn texture(&self) -> &[f64] {
        &self.values[TEXTURE_RANGE]
    }

    pub fn shape(&self) -> &[f64] {
        &self.values[SHAPE_RANGE]
    }

    pub fn gradient(&self) -> &[f64] {
        &self.values[GRADIENT_RANGE]
    }

    /// Serialize as `b"FEN1"` followed by 359 little-endian f64 values.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOB_LEN);
        out.extend_from_slice(BLOB_MAGIC);
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(blob: &[u8]) -> Result<Self, EncodingError> {
        if blob.len() != BLOB_LEN {
            return Err(EncodingError::InvalidBlob(format!(
                "expected {BLOB_LEN} bytes, got {}",
                blob.len()
            )));
        }
        let (magic, body) = blob.split_at(BLOB_MAGIC.len());
        if magic != BLOB_MAGIC {
            return Err(EncodingError::InvalidBlob(format!("bad magic {magic:02x?}")));
        }
        let values = body
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect();
        Self::from_values(values)
    }
}
