//! Passive single-frame liveness heuristics.
//!
//! Four independent checks on the face crop, all of which must pass:
//!
//! 1. **Sharpness**: Laplacian variance; printed or re-photographed faces blur.
//! 2. **Colour variation**: saturation variance; screen replays wash out.
//! 3. **Edge density**: Canny edge fraction; flat surfaces have few edges.
//! 4. **Illumination**: spread of the intensity histogram; replays are lit flat.
//!
//! # Threat Coverage
//!
//! - **Blocks:** blurred prints, flat-colour cards, low-texture surfaces.
//! - **Does not block:** sharp high-quality prints, video replays on good
//!   displays, masks. These are cheap signals, not a presentation-attack
//!   detector.

use crate::imgproc;
use crate::types::{FaceRegion, PixelGrid};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Laplacian variance must exceed this.
    pub min_sharpness: f64,
    /// Saturation-channel variance must exceed this.
    pub min_saturation_variance: f64,
    /// Fraction of Canny edge pixels must exceed this.
    pub min_edge_density: f64,
    /// Standard deviation of the 256-bin intensity histogram must exceed this.
    pub min_histogram_stddev: f64,
    pub canny_low: f64,
    pub canny_high: f64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            min_sharpness: 100.0,
            min_saturation_variance: 50.0,
            min_edge_density: 0.05,
            min_histogram_stddev: 10.0,
            canny_low: 50.0,
            canny_high: 150.0,
        }
    }
}

/// Why a frame passed or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessReason {
    Live,
    /// Measurement failed and the gate is lenient.
    FailOpen,
    Blurry,
    FlatColor,
    FewEdges,
    UniformIllumination,
    /// Measurement failed and the gate is strict.
    InternalError,
}

impl fmt::Display for LivenessReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Live => "live",
            Self::FailOpen => "not measurable, accepted",
            Self::Blurry => "image too blurry",
            Self::FlatColor => "too little colour variation",
            Self::FewEdges => "too few edges",
            Self::UniformIllumination => "illumination too uniform",
            Self::InternalError => "not measurable",
        };
        f.write_str(text)
    }
}

/// Metrics measured before the verdict was reached; later checks stay `None`
/// once an earlier one fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LivenessMetrics {
    pub sharpness: Option<f64>,
    pub saturation_variance: Option<f64>,
    pub edge_density: Option<f64>,
    pub histogram_stddev: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessVerdict {
    pub passed: bool,
    pub reason: LivenessReason,
    pub metrics: LivenessMetrics,
}

#[derive(Error, Debug)]
enum MeasureError {
    #[error("face region {0:?} has no pixels inside the frame")]
    EmptyCrop(FaceRegion),
    #[error("{0} is not finite")]
    NonFinite(&'static str),
}

pub struct LivenessGate {
    config: LivenessConfig,
    strict: bool,
}

impl LivenessGate {
    /// `strict` selects fail-closed behaviour when a frame cannot be measured.
    pub fn new(config: LivenessConfig, strict: bool) -> Self {
        Self { config, strict }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn check(&self, grid: &PixelGrid, region: &FaceRegion) -> LivenessVerdict {
        match self.measure(grid, region) {
            Ok(verdict) => {
                tracing::debug!(
                    passed = verdict.passed,
                    reason = ?verdict.reason,
                    metrics = ?verdict.metrics,
                    "liveness measured"
                );
                verdict
            }
            Err(err) => {
                let reason = if self.strict {
                    LivenessReason::InternalError
                } else {
                    LivenessReason::FailOpen
                };
                tracing::warn!(error = %err, ?reason, "liveness measurement failed");
                LivenessVerdict {
                    passed: !self.strict,
                    reason,
                    metrics: LivenessMetrics::default(),
                }
            }
        }
    }

    fn measure(&self, grid: &PixelGrid, region: &FaceRegion) -> Result<LivenessVerdict, MeasureError> {
        let crop = region.crop(grid).ok_or(MeasureError::EmptyCrop(*region))?;
        let gray = imgproc::to_gray(&crop);
        let mut metrics = LivenessMetrics::default();
        let fail = |reason, metrics| LivenessVerdict { passed: false, reason, metrics };

        let lap: Vec<f64> = imgproc::laplacian(&gray).into_iter().collect();
        let sharpness = finite(imgproc::variance(&lap), "laplacian variance")?;
        metrics.sharpness = Some(sharpness);
        if sharpness <= self.config.min_sharpness {
            return Ok(fail(LivenessReason::Blurry, metrics));
        }

        let sat: Vec<f64> = imgproc::saturation(&crop).iter().map(|&s| s as f64).collect();
        let saturation_variance = finite(imgproc::variance(&sat), "saturation variance")?;
        metrics.saturation_variance = Some(saturation_variance);
        if saturation_variance <= self.config.min_saturation_variance {
            return Ok(fail(LivenessReason::FlatColor, metrics));
        }

        let edges = imgproc::canny(&gray, self.config.canny_low, self.config.canny_high);
        let edge_density = edges.iter().filter(|&&e| e).count() as f64 / edges.len() as f64;
        let edge_density = finite(edge_density, "edge density")?;
        metrics.edge_density = Some(edge_density);
        if edge_density <= self.config.min_edge_density {
            return Ok(fail(LivenessReason::FewEdges, metrics));
        }

        let hist = imgproc::histogram(gray.iter(), 256);
        let histogram_stddev = finite(imgproc::variance(&hist).sqrt(), "histogram stddev")?;
        metrics.histogram_stddev = Some(histogram_stddev);
        if histogram_stddev <= self.config.min_histogram_stddev {
            return Ok(fail(LivenessReason::UniformIllumination, metrics));
        }

        Ok(LivenessVerdict {
            passed: true,
            reason: LivenessReason::Live,
            metrics,
        })
    }
}

impl Default for LivenessGate {
    fn default() -> Self {
        Self::new(LivenessConfig::default(), false)
    }
}

fn finite(value: f64, what: &'static str) -> Result<f64, MeasureError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(MeasureError::NonFinite(what))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u8 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (self.0 >> 33) as u8
        }

        /// Sum of two half-range draws: peaked histogram, wide spread.
        fn channel(&mut self) -> u8 {
            (self.next() / 2) + (self.next() / 2)
        }
    }

    fn textured_frame(size: u32) -> PixelGrid {
        let mut rng = Lcg(42);
        let img = RgbImage::from_fn(size, size, |_, _| Rgb([rng.channel(), rng.channel(), rng.channel()]));
        PixelGrid::new(img)
    }

    fn full_region(grid: &PixelGrid) -> FaceRegion {
        FaceRegion::new(0, 0, grid.width(), grid.height())
    }

    #[test]
    fn test_uniform_rectangle_rejected() {
        let grid = PixelGrid::new(RgbImage::from_pixel(120, 120, Rgb([180, 140, 120])));
        let verdict = LivenessGate::default().check(&grid, &full_region(&grid));
        assert!(!verdict.passed);
        assert_eq!(verdict.reason, LivenessReason::Blurry);
        assert_eq!(verdict.metrics.sharpness, Some(0.0));
        assert_eq!(verdict.metrics.edge_density, None);
    }

    #[test]
    fn test_uniform_rectangle_fails_edges_when_sharpness_relaxed() {
        let grid = PixelGrid::new(RgbImage::from_fn(120, 120, |x, _| {
            // Flat except one red column, too weak for a strong Canny edge.
            if x == 60 { Rgb([255, 0, 0]) } else { Rgb([200, 60, 60]) }
        }));
        let config = LivenessConfig {
            min_sharpness: 0.0,
            min_saturation_variance: 0.0,
            ..LivenessConfig::default()
        };
        let verdict = LivenessGate::new(config, false).check(&grid, &full_region(&grid));
        assert!(!verdict.passed);
        assert_eq!(verdict.reason, LivenessReason::FewEdges);
        assert!(verdict.metrics.edge_density.unwrap() <= 0.05);
    }

    #[test]
    fn test_textured_frame_passes_all_checks() {
        let grid = textured_frame(120);
        let verdict = LivenessGate::default().check(&grid, &full_region(&grid));
        assert!(verdict.passed, "{verdict:?}");
        assert_eq!(verdict.reason, LivenessReason::Live);
        let m = verdict.metrics;
        assert!(m.sharpness.unwrap() > 100.0);
        assert!(m.saturation_variance.unwrap() > 50.0);
        assert!(m.edge_density.unwrap() > 0.05);
        assert!(m.histogram_stddev.unwrap() > 10.0);
    }

    #[test]
    fn test_flat_saturation_rejected() {
        // Gray noise: sharp and edgy but colourless.
        let mut rng = Lcg(5);
        let img = RgbImage::from_fn(100, 100, |_, _| {
            let v = rng.channel();
            Rgb([v, v, v])
        });
        let grid = PixelGrid::new(img);
        let verdict = LivenessGate::default().check(&grid, &full_region(&grid));
        assert_eq!(verdict.reason, LivenessReason::FlatColor);
        assert_eq!(verdict.metrics.saturation_variance, Some(0.0));
    }

    #[test]
    fn test_even_histogram_fails_illumination() {
        // One column per gray level: every histogram bin holds the same count.
        let grid = PixelGrid::new(RgbImage::from_fn(256, 40, |x, _| {
            let v = x as u8;
            Rgb([v, v, v])
        }));
        let relaxed = LivenessConfig {
            min_sharpness: -1.0,
            min_saturation_variance: -1.0,
            min_edge_density: -1.0,
            ..LivenessConfig::default()
        };
        let verdict = LivenessGate::new(relaxed.clone(), false).check(&grid, &full_region(&grid));
        assert!(!verdict.passed);
        assert_eq!(verdict.reason, LivenessReason::UniformIllumination);
        let m = verdict.metrics;
        assert!(m.sharpness.is_some() && m.saturation_variance.is_some() && m.edge_density.is_some());
        assert!(m.histogram_stddev.unwrap() < 10.0);

        let all_relaxed = LivenessConfig { min_histogram_stddev: -1.0, ..relaxed };
        let verdict = LivenessGate::new(all_relaxed, false).check(&grid, &full_region(&grid));
        assert!(verdict.passed);
        assert_eq!(verdict.reason, LivenessReason::Live);
    }

    #[test]
    fn test_region_outside_frame_fails_open_when_lenient() {
        let grid = textured_frame(50);
        let region = FaceRegion::new(500, 500, 80, 80);
        let verdict = LivenessGate::new(LivenessConfig::default(), false).check(&grid, &region);
        assert!(verdict.passed);
        assert_eq!(verdict.reason, LivenessReason::FailOpen);
    }

    #[test]
    fn test_region_outside_frame_fails_closed_when_strict() {
        let grid = textured_frame(50);
        let region = FaceRegion::new(500, 500, 80, 80);
        let verdict = LivenessGate::new(LivenessConfig::default(), true).check(&grid, &region);
        assert!(!verdict.passed);
        assert_eq!(verdict.reason, LivenessReason::InternalError);
    }
}
