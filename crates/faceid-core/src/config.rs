use crate::liveness::LivenessConfig;
use crate::locator::LocatorConfig;
use crate::matcher::MatchConfig;
use serde::{Deserialize, Serialize};

/// Engine configuration: the per-stage tunables plus the service policy flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fail closed when liveness or the consistency re-check cannot be computed.
    pub strict_mode: bool,
    /// Re-locate and re-encode the probe before accepting a match.
    pub consistency_check: bool,
    /// Run the liveness gate on enrollment images as well.
    pub enroll_liveness: bool,
    /// Reject enrollment images that are small, dark or framed too loosely.
    pub quality_gate: bool,
    pub quality: QualityConfig,
    pub locator: LocatorConfig,
    pub liveness: LivenessConfig,
    pub matching: MatchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strict_mode: false,
            consistency_check: true,
            enroll_liveness: false,
            quality_gate: false,
            quality: QualityConfig::default(),
            locator: LocatorConfig::default(),
            liveness: LivenessConfig::default(),
            matching: MatchConfig::default(),
        }
    }
}

/// Enrollment image quality limits, applied when `quality_gate` is on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub min_image_side: u32,
    /// Face height over image height.
    pub min_face_fraction: f64,
    /// Mean grayscale value of the face crop.
    pub min_brightness: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_image_side: 200,
            min_face_fraction: 0.2,
            min_brightness: 50.0,
        }
    }
}
