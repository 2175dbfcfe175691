//! Fused similarity scoring and 1:N identification.
//!
//! [`FusedMatcher`] scores two [`FaceEncoding`]s block by block; [`MatchEngine`]
//! owns the known set and scans it in enrollment order.

use crate::types::FaceEncoding;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

// --- Block weights (sum to 1.0) ---
const INTENSITY_WEIGHT: f64 = 0.30;
const TEXTURE_WEIGHT: f64 = 0.35;
const SHAPE_WEIGHT: f64 = 0.20;
const GRADIENT_WEIGHT: f64 = 0.15;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Fused score at or above which two encodings match.
    pub threshold: f64,
    /// Threshold for the probe-vs-re-encoded-probe consistency check.
    pub consistency_threshold: f64,
    /// Scores above this trigger the naturalness guard.
    pub suspicious_score: f64,
    /// Minimum variance of the whole probe encoding when the guard runs.
    pub min_encoding_variance: f64,
    /// Minimum variance of the probe's texture block, scaled to unit RMS.
    pub min_texture_variance: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: 0.65,
            consistency_threshold: 0.70,
            suspicious_score: 0.95,
            min_encoding_variance: 0.001,
            min_texture_variance: 0.01,
        }
    }
}

/// Per-block similarity terms before weighting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub intensity: f64,
    pub texture: f64,
    pub shape: f64,
    pub gradient: f64,
}

impl ScoreBreakdown {
    pub fn fused(&self) -> f64 {
        INTENSITY_WEIGHT * self.intensity
            + TEXTURE_WEIGHT * self.texture
            + SHAPE_WEIGHT * self.shape
            + GRADIENT_WEIGHT * self.gradient
    }
}

/// Outcome of comparing a probe against one reference encoding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Comparison {
    pub is_match: bool,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    /// The score cleared the threshold but the probe looked synthetic.
    pub naturalness_rejected: bool,
}

/// Strategy for scoring a probe encoding against a reference.
pub trait Matcher: Send + Sync {
    /// Compare probe `a` against reference `b` at `threshold`.
    fn compare(&self, a: &FaceEncoding, b: &FaceEncoding, threshold: f64) -> Comparison;
}

/// Weighted fusion of histogram correlations and Hu-moment distance.
///
/// `score = 0.30·corr(intensity) + 0.35·corr(texture)
///        + 0.20·1/(1+‖Δhu‖) + 0.15·corr(gradient)`
///
/// Scores above `suspicious_score` are cross-checked for natural variation
/// in the probe; a flat probe is rejected even though it scored highly.
#[derive(Debug, Clone, Default)]
pub struct FusedMatcher {
    config: MatchConfig,
}

impl FusedMatcher {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    fn looks_natural(&self, a: &FaceEncoding) -> bool {
        if population_variance(a.values()) < self.config.min_encoding_variance {
            return false;
        }
        let texture = a.texture();
        let rms = (texture.iter().map(|v| v * v).sum::<f64>() / texture.len() as f64).sqrt();
        if rms == 0.0 {
            return false;
        }
        let scaled: Vec<f64> = texture.iter().map(|v| v / rms).collect();
        population_variance(&scaled) >= self.config.min_texture_variance
    }
}

impl Matcher for FusedMatcher {
    fn compare(&self, a: &FaceEncoding, b: &FaceEncoding, threshold: f64) -> Comparison {
        let breakdown = ScoreBreakdown {
            intensity: correlation(a.intensity(), b.intensity()),
            texture: correlation(a.texture(), b.texture()),
            shape: 1.0 / (1.0 + euclidean(a.shape(), b.shape())),
            gradient: correlation(a.gradient(), b.gradient()),
        };
        let score = breakdown.fused();

        let mut is_match = score >= threshold;
        let mut naturalness_rejected = false;
        if is_match && score > self.config.suspicious_score && !self.looks_natural(a) {
            is_match = false;
            naturalness_rejected = true;
        }

        tracing::debug!(
            intensity = breakdown.intensity,
            texture = breakdown.texture,
            shape = breakdown.shape,
            gradient = breakdown.gradient,
            score,
            threshold,
            is_match,
            naturalness_rejected,
            "compared encodings"
        );

        Comparison {
            is_match,
            score,
            breakdown,
            naturalness_rejected,
        }
    }
}

/// Pearson correlation; 1.0 when either side has zero variance.
fn correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 1.0;
    }
    let mean_a = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().sum::<f64>() / n as f64;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in a[..n].iter().zip(&b[..n]) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    let denom = var_a * var_b;
    if denom.abs() > f64::EPSILON {
        cov / denom.sqrt()
    } else {
        1.0
    }
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

fn population_variance(v: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    let mean = v.iter().sum::<f64>() / v.len() as f64;
    v.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / v.len() as f64
}

/// An enrolled identity and its decoded encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownFace {
    pub identity: String,
    pub encoding: FaceEncoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    Matched,
    NoMatch,
    NoEnrollmentFound,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    pub identity: Option<String>,
    /// Fused score × 100 of the accepted match, or of the best rejected one.
    pub confidence: f64,
    pub reason: MatchReason,
    /// Number of known encodings scored before the scan stopped.
    pub compared: usize,
}

/// Owns the known-encoding set and runs identification against it.
///
/// The set is a copy-on-write snapshot: readers clone the `Arc` and scan
/// without holding the lock; writers swap in a new vector.
///
/// Every write bumps a generation counter. A cache fill records the
/// generation before reading the store and installs its result only if no
/// write happened in between (see [`install_if_current`](Self::install_if_current)).
pub struct MatchEngine {
    matcher: Box<dyn Matcher>,
    threshold: f64,
    known: RwLock<Arc<Vec<KnownFace>>>,
    loaded: AtomicBool,
    /// Only modified while `known` is write-locked.
    generation: AtomicU64,
}

impl MatchEngine {
    pub fn new(config: MatchConfig) -> Self {
        let threshold = config.threshold;
        Self::with_matcher(Box::new(FusedMatcher::new(config)), threshold)
    }

    pub fn with_matcher(matcher: Box<dyn Matcher>, threshold: f64) -> Self {
        Self {
            matcher,
            threshold,
            known: RwLock::new(Arc::new(Vec::new())),
            loaded: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Compare probe `a` against reference `b`.
    pub fn compare(&self, a: &FaceEncoding, b: &FaceEncoding, threshold: f64) -> Comparison {
        self.matcher.compare(a, b, threshold)
    }

    /// Scan `known` in order and return the first match.
    ///
    /// First-match-wins: a later entry with a higher score is never
    /// considered once an earlier one matched.
    pub fn identify(&self, candidate: &FaceEncoding, known: &[KnownFace]) -> MatchResult {
        self.identify_with(candidate, known, |_| true)
    }

    /// Like [`identify`](Self::identify), but a match only ends the scan
    /// when `accept` also approves it. Rejected matches keep scanning.
    pub fn identify_with<F>(&self, candidate: &FaceEncoding, known: &[KnownFace], mut accept: F) -> MatchResult
    where
        F: FnMut(&KnownFace) -> bool,
    {
        if known.is_empty() {
            return MatchResult {
                matched: false,
                identity: None,
                confidence: 0.0,
                reason: MatchReason::NoEnrollmentFound,
                compared: 0,
            };
        }

        let mut best = 0.0f64;
        for (i, face) in known.iter().enumerate() {
            let cmp = self.matcher.compare(candidate, &face.encoding, self.threshold);
            if cmp.is_match && accept(face) {
                tracing::debug!(identity = %face.identity, score = cmp.score, position = i, "match found");
                return MatchResult {
                    matched: true,
                    identity: Some(face.identity.clone()),
                    confidence: cmp.score * 100.0,
                    reason: MatchReason::Matched,
                    compared: i + 1,
                };
            }
            best = best.max(cmp.score);
        }

        MatchResult {
            matched: false,
            identity: None,
            confidence: best.max(0.0) * 100.0,
            reason: MatchReason::NoMatch,
            compared: known.len(),
        }
    }

    /// Current known set.
    pub fn snapshot(&self) -> Arc<Vec<KnownFace>> {
        match self.known.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Counter bumped by every write to the known set.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Replace the known set wholesale and mark it loaded.
    pub fn replace_all(&self, faces: Vec<KnownFace>) {
        self.write(|_| faces);
        self.loaded.store(true, Ordering::Release);
    }

    /// Install `faces` read from the store and mark the set loaded, unless a
    /// write landed after `seen` was taken from [`generation`](Self::generation).
    /// Returns whether the set was installed; on `false` the caller's store
    /// read is stale and must be repeated.
    pub fn install_if_current(&self, faces: Vec<KnownFace>, seen: u64) -> bool {
        let mut guard = self.lock_write();
        if self.generation.load(Ordering::Acquire) != seen {
            return false;
        }
        *guard = Arc::new(faces);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.loaded.store(true, Ordering::Release);
        true
    }

    /// Insert or overwrite one identity; an existing entry keeps its position.
    pub fn upsert(&self, face: KnownFace) {
        self.write(|current| {
            let mut next = current.to_vec();
            match next.iter_mut().find(|k| k.identity == face.identity) {
                Some(slot) => slot.encoding = face.encoding,
                None => next.push(face),
            }
            next
        });
    }

    /// Drop one identity. Returns whether it was present.
    pub fn remove(&self, identity: &str) -> bool {
        let mut removed = false;
        self.write(|current| {
            let next: Vec<KnownFace> = current.iter().filter(|k| k.identity != identity).cloned().collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }

    /// Forget the cached set; the next search reloads from the store.
    pub fn invalidate(&self) {
        let mut guard = self.lock_write();
        *guard = Arc::new(Vec::new());
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.loaded.store(false, Ordering::Release);
    }

    fn write(&self, update: impl FnOnce(&[KnownFace]) -> Vec<KnownFace>) {
        let mut guard = self.lock_write();
        let next = update(guard.as_slice());
        *guard = Arc::new(next);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn lock_write(&self) -> RwLockWriteGuard<'_, Arc<Vec<KnownFace>>> {
        match self.known.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MatchEngine {
    fn default() -> Self {
        Self::new(MatchConfig::default())
    }
}
