//! Handcrafted face feature encoder.
//!
//! Crops the face with a small margin, resamples it to a fixed 150×150
//! grayscale patch, boosts local contrast with CLAHE and concatenates four
//! descriptor blocks into a [`FaceEncoding`]:
//!
//! | block     | len | content                                         |
//! |-----------|-----|-------------------------------------------------|
//! | intensity | 64  | L2-normalized grayscale histogram               |
//! | texture   | 256 | L2-normalized LBP(r=3, p=24) code histogram     |
//! | shape     | 7   | log-scaled Hu moment invariants                 |
//! | gradient  | 32  | L2-normalized Sobel magnitude histogram         |

use crate::error::EncodingError;
use crate::imgproc;
use crate::types::{FaceEncoding, FaceRegion, PixelGrid, ENCODING_LEN, GRADIENT_BINS, INTENSITY_BINS, TEXTURE_BINS};
use image::imageops::{self, FilterType};
use ndarray::Array2;
use std::f64::consts::PI;

// --- Named constants ---
const CROP_MARGIN: u32 = 10;
const PATCH_SIZE: u32 = 150;
const CLAHE_CLIP_LIMIT: f32 = 2.0;
const CLAHE_TILES: usize = 8;
const LBP_RADIUS: usize = 3;
const LBP_POINTS: usize = 8 * LBP_RADIUS;
/// Added to |h| before the log so zero moments stay finite.
const HU_LOG_EPS: f64 = 1e-10;

/// Stateless encoder; one instance may serve any number of threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureEncoder;

impl FeatureEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode the face inside `region`.
    ///
    /// Fails only on numeric faults: a region with no pixels inside the grid,
    /// or a descriptor block that came out non-finite.
    pub fn encode(&self, grid: &PixelGrid, region: &FaceRegion) -> Result<FaceEncoding, EncodingError> {
        if region.width == 0 || region.height == 0 {
            return Err(EncodingError::DegenerateRegion(format!(
                "{}x{} region has no area",
                region.width, region.height
            )));
        }
        let crop = region
            .expand_clamped(CROP_MARGIN, grid.width(), grid.height())
            .and_then(|r| r.crop(grid))
            .ok_or_else(|| {
                EncodingError::DegenerateRegion(format!(
                    "region at ({}, {}) lies outside the {}x{} grid",
                    region.x,
                    region.y,
                    grid.width(),
                    grid.height()
                ))
            })?;

        let patch = imageops::resize(&crop, PATCH_SIZE, PATCH_SIZE, FilterType::Triangle);
        let mut gray = imgproc::to_gray(&patch);
        imgproc::clahe(&mut gray, CLAHE_TILES, CLAHE_TILES, CLAHE_CLIP_LIMIT);

        let mut intensity = imgproc::histogram(gray.iter(), INTENSITY_BINS);
        imgproc::l2_normalize(&mut intensity);

        let mut texture = imgproc::histogram(lbp_codes(&gray).iter(), TEXTURE_BINS);
        imgproc::l2_normalize(&mut texture);

        let shape: Vec<f64> = hu_moments(&gray).iter().map(|&h| log_scale(h)).collect();

        let (dx, dy) = imgproc::sobel(&gray);
        let magnitude: Array2<u8> = Array2::from_shape_fn(gray.dim(), |idx| {
            dx[idx].hypot(dy[idx]).clamp(0.0, 255.0) as u8
        });
        let mut gradient = imgproc::histogram(magnitude.iter(), GRADIENT_BINS);
        imgproc::l2_normalize(&mut gradient);

        let mut values = Vec::with_capacity(ENCODING_LEN);
        for (name, block) in [
            ("intensity", &intensity),
            ("texture", &texture),
            ("shape", &shape),
            ("gradient", &gradient),
        ] {
            if block.iter().any(|v| !v.is_finite()) {
                return Err(EncodingError::NonFinite(name));
            }
            values.extend_from_slice(block);
        }

        tracing::debug!(
            crop_width = crop.width(),
            crop_height = crop.height(),
            "face encoded"
        );
        FaceEncoding::from_values(values)
    }
}

/// Circular LBP codes truncated to 8 bits. Pixels closer than the radius to
/// the border keep code 0.
fn lbp_codes(gray: &Array2<u8>) -> Array2<u8> {
    let (h, w) = gray.dim();
    let mut codes = Array2::<u8>::zeros((h, w));
    if h <= 2 * LBP_RADIUS || w <= 2 * LBP_RADIUS {
        return codes;
    }

    let offsets: Vec<(f64, f64)> = (0..LBP_POINTS)
        .map(|n| {
            let angle = 2.0 * PI * n as f64 / LBP_POINTS as f64;
            (LBP_RADIUS as f64 * angle.cos(), LBP_RADIUS as f64 * angle.sin())
        })
        .collect();

    for i in LBP_RADIUS..h - LBP_RADIUS {
        for j in LBP_RADIUS..w - LBP_RADIUS {
            let center = gray[[i, j]];
            let mut code = 0u32;
            for (n, &(di, dj)) in offsets.iter().enumerate() {
                // Samples truncate toward zero; no interpolation.
                let si = (i as f64 + di) as usize;
                let sj = (j as f64 + dj) as usize;
                if gray[[si, sj]] >= center {
                    code |= 1 << n;
                }
            }
            codes[[i, j]] = code as u8;
        }
    }
    codes
}

/// The seven Hu invariants of the intensity-weighted image moments.
fn hu_moments(gray: &Array2<u8>) -> [f64; 7] {
    let mut m = [[0.0f64; 4]; 4];
    for ((y, x), &p) in gray.indexed_iter() {
        let v = p as f64;
        if v == 0.0 {
            continue;
        }
        let (xf, yf) = (x as f64, y as f64);
        let mut xp = 1.0;
        for row in m.iter_mut() {
            let mut yq = 1.0;
            for cell in row.iter_mut() {
                *cell += v * xp * yq;
                yq *= yf;
            }
            xp *= xf;
        }
    }

    let m00 = m[0][0];
    if m00 == 0.0 {
        return [0.0; 7];
    }
    let xc = m[1][0] / m00;
    let yc = m[0][1] / m00;

    let mut mu = [[0.0f64; 4]; 4];
    for ((y, x), &p) in gray.indexed_iter() {
        let v = p as f64;
        if v == 0.0 {
            continue;
        }
        let (dx, dy) = (x as f64 - xc, y as f64 - yc);
        for (p_ord, row) in mu.iter_mut().enumerate() {
            for (q_ord, cell) in row.iter_mut().enumerate() {
                if (2..=3).contains(&(p_ord + q_ord)) {
                    *cell += v * dx.powi(p_ord as i32) * dy.powi(q_ord as i32);
                }
            }
        }
    }

    let eta = |p: usize, q: usize| mu[p][q] / m00.powf(1.0 + (p + q) as f64 / 2.0);
    let (n20, n02, n11) = (eta(2, 0), eta(0, 2), eta(1, 1));
    let (n30, n03, n21, n12) = (eta(3, 0), eta(0, 3), eta(2, 1), eta(1, 2));

    let a = n30 + n12;
    let b = n21 + n03;
    let c = n30 - 3.0 * n12;
    let d = 3.0 * n21 - n03;

    [
        n20 + n02,
        (n20 - n02).powi(2) + 4.0 * n11 * n11,
        c * c + d * d,
        a * a + b * b,
        c * a * (a * a - 3.0 * b * b) + d * b * (3.0 * a * a - b * b),
        (n20 - n02) * (a * a - b * b) + 4.0 * n11 * a * b,
        d * a * (a * a - 3.0 * b * b) - c * b * (3.0 * a * a - b * b),
    ]
}

/// `sign(h) * ln(|h| + ε)`, with `sign(0) = 0`.
fn log_scale(h: f64) -> f64 {
    if h == 0.0 {
        0.0
    } else {
        h.signum() * (h.abs() + HU_LOG_EPS).ln()
    }
}
