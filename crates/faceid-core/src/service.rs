//! Enrollment and authentication orchestration.
//!
//! Each call walks the pipeline once: decode → locate → (liveness) → encode →
//! store or search. Failures come back as tagged outcomes; nothing panics
//! across this boundary.

use crate::config::EngineConfig;
use crate::decode::decode_image;
use crate::encoder::FeatureEncoder;
use crate::error::{ErrorKind, FaceAuthError};
use crate::imgproc;
use crate::liveness::LivenessGate;
use crate::locator::FaceLocator;
use crate::matcher::{KnownFace, MatchEngine, MatchReason, MatchResult};
use crate::store::{EncodingStore, StoreError};
use crate::types::{FaceEncoding, FaceRegion, PixelGrid};
use serde::Serialize;
use std::cell::OnceCell;
use std::sync::Arc;

/// Store reads per cache fill before giving up on caching the result.
const MAX_FILL_ATTEMPTS: u32 = 4;

/// Why a call did not succeed, flattened for callers across IPC.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&FaceAuthError> for Rejection {
    fn from(err: &FaceAuthError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnrollOutcome {
    Enrolled { identity: String, region: FaceRegion },
    Rejected(Rejection),
}

impl EnrollOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Enrolled { .. })
    }

    pub fn message(&self) -> String {
        match self {
            Self::Enrolled { identity, .. } => format!("face enrolled for {identity}"),
            Self::Rejected(rejection) => rejection.message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuthOutcome {
    Authenticated { identity: String, confidence: f64 },
    Rejected(Rejection),
}

impl AuthOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    pub fn message(&self) -> String {
        match self {
            Self::Authenticated { identity, confidence } => {
                format!("authenticated as {identity} ({confidence:.1}%)")
            }
            Self::Rejected(rejection) => rejection.message.clone(),
        }
    }

    pub fn identity(&self) -> Option<&str> {
        match self {
            Self::Authenticated { identity, .. } => Some(identity),
            Self::Rejected(_) => None,
        }
    }
}

/// The biometric service. `Send + Sync`; share it behind an `Arc`.
pub struct FacialAuthService {
    config: EngineConfig,
    locator: FaceLocator,
    liveness: LivenessGate,
    encoder: FeatureEncoder,
    engine: Arc<MatchEngine>,
    store: Arc<dyn EncodingStore>,
}

impl FacialAuthService {
    pub fn new(config: EngineConfig, store: Arc<dyn EncodingStore>) -> Self {
        let engine = Arc::new(MatchEngine::new(config.matching.clone()));
        Self::with_engine(config, store, engine)
    }

    /// Build around an existing engine, e.g. one with a custom matcher.
    pub fn with_engine(config: EngineConfig, store: Arc<dyn EncodingStore>, engine: Arc<MatchEngine>) -> Self {
        Self {
            locator: FaceLocator::new(config.locator.clone()),
            liveness: LivenessGate::new(config.liveness.clone(), config.strict_mode),
            encoder: FeatureEncoder::new(),
            engine,
            store,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<MatchEngine> {
        &self.engine
    }

    /// Enroll the single face in `image` under `identity`, replacing any
    /// previous enrollment.
    pub fn enroll(&self, identity: &str, image: &[u8]) -> EnrollOutcome {
        match self.try_enroll(identity, image) {
            Ok(region) => {
                tracing::info!(identity, x = region.x, y = region.y, width = region.width, "face enrolled");
                EnrollOutcome::Enrolled {
                    identity: identity.to_string(),
                    region,
                }
            }
            Err(err) => {
                log_rejection("enroll", &err);
                EnrollOutcome::Rejected(Rejection::from(&err))
            }
        }
    }

    /// Identify the single face in `image` against every enrollment.
    pub fn authenticate(&self, image: &[u8]) -> AuthOutcome {
        self.finish_auth(self.try_authenticate(image))
    }

    /// Check the single face in `image` against `identity` only.
    pub fn verify(&self, identity: &str, image: &[u8]) -> AuthOutcome {
        self.finish_auth(self.try_verify(identity, image))
    }

    pub fn has_enrollment(&self, identity: &str) -> Result<bool, StoreError> {
        self.store.contains(identity)
    }

    /// Delete `identity` from the store and the cache.
    pub fn remove_enrollment(&self, identity: &str) -> Result<bool, StoreError> {
        let removed = self.store.remove(identity)?;
        self.engine.remove(identity);
        if removed {
            tracing::info!(identity, "enrollment removed");
        }
        Ok(removed)
    }

    /// Number of enrollments usable for matching.
    pub fn enrolled_count(&self) -> Result<usize, FaceAuthError> {
        Ok(self.known_faces()?.len())
    }

    /// Drop the cached known set; the next search reloads it from the store.
    pub fn reload(&self) {
        self.engine.invalidate();
        tracing::info!("known-face cache invalidated");
    }

    fn finish_auth(&self, result: Result<MatchResult, FaceAuthError>) -> AuthOutcome {
        match result {
            Ok(MatchResult {
                matched: true,
                identity: Some(identity),
                confidence,
                ..
            }) => {
                tracing::info!(identity = %identity, confidence, "authenticated");
                AuthOutcome::Authenticated { identity, confidence }
            }
            Ok(result) => {
                let err = match result.reason {
                    MatchReason::NoEnrollmentFound => FaceAuthError::NoEnrollmentFound,
                    _ => FaceAuthError::NoMatch,
                };
                tracing::info!(
                    best_confidence = result.confidence,
                    compared = result.compared,
                    "no matching enrollment"
                );
                AuthOutcome::Rejected(Rejection::from(&err))
            }
            Err(err) => {
                log_rejection("authenticate", &err);
                AuthOutcome::Rejected(Rejection::from(&err))
            }
        }
    }

    fn try_enroll(&self, identity: &str, image: &[u8]) -> Result<FaceRegion, FaceAuthError> {
        let grid = decode_image(image)?;
        let region = self.single_face(&grid)?;
        if self.config.quality_gate {
            self.check_quality(&grid, &region)?;
        }
        if self.config.enroll_liveness {
            self.check_liveness(&grid, &region)?;
        }
        let encoding = self.encoder.encode(&grid, &region)?;
        self.store.put(identity, &encoding.to_bytes())?;
        self.engine.upsert(KnownFace {
            identity: identity.to_string(),
            encoding,
        });
        Ok(region)
    }

    fn try_authenticate(&self, image: &[u8]) -> Result<MatchResult, FaceAuthError> {
        let (grid, probe) = self.live_probe(image)?;
        let known = self.known_faces()?;
        if known.is_empty() {
            return Err(FaceAuthError::NoEnrollmentFound);
        }
        Ok(self.search(&grid, &probe, &known))
    }

    fn try_verify(&self, identity: &str, image: &[u8]) -> Result<MatchResult, FaceAuthError> {
        let (grid, probe) = self.live_probe(image)?;
        let known = self.known_faces()?;
        let Some(face) = known.iter().find(|k| k.identity == identity) else {
            return Err(FaceAuthError::NoEnrollmentFound);
        };
        Ok(self.search(&grid, &probe, std::slice::from_ref(face)))
    }

    /// Decode, locate, liveness-check and encode an authentication image.
    fn live_probe(&self, image: &[u8]) -> Result<(PixelGrid, FaceEncoding), FaceAuthError> {
        let grid = decode_image(image)?;
        let region = self.single_face(&grid)?;
        self.check_liveness(&grid, &region)?;
        let probe = self.encoder.encode(&grid, &region)?;
        Ok((grid, probe))
    }

    fn search(&self, grid: &PixelGrid, probe: &FaceEncoding, known: &[KnownFace]) -> MatchResult {
        if !self.config.consistency_check {
            return self.engine.identify(probe, known);
        }
        let recheck = OnceCell::new();
        self.engine.identify_with(probe, known, |face| {
            let reencoded = recheck.get_or_init(|| self.reencode(grid));
            self.consistent(reencoded, face)
        })
    }

    /// Locate and encode `grid` again for the consistency re-check. `None`
    /// when no face is found the second time.
    fn reencode(&self, grid: &PixelGrid) -> Option<Result<FaceEncoding, FaceAuthError>> {
        let faces = self.locator.locate(grid);
        let region = faces.first()?;
        Some(self.encoder.encode(grid, region).map_err(FaceAuthError::from))
    }

    fn consistent(&self, reencoded: &Option<Result<FaceEncoding, FaceAuthError>>, face: &KnownFace) -> bool {
        match reencoded {
            None => {
                tracing::warn!(identity = %face.identity, "consistency re-check found no face");
                false
            }
            Some(Ok(encoding)) => {
                let threshold = self.config.matching.consistency_threshold;
                let cmp = self.engine.compare(encoding, &face.encoding, threshold);
                if !cmp.is_match {
                    tracing::warn!(identity = %face.identity, score = cmp.score, "consistency re-check failed");
                }
                cmp.is_match
            }
            Some(Err(err)) => {
                tracing::warn!(
                    identity = %face.identity,
                    error = %err,
                    strict = self.config.strict_mode,
                    "consistency re-check errored"
                );
                !self.config.strict_mode
            }
        }
    }

    fn single_face(&self, grid: &PixelGrid) -> Result<FaceRegion, FaceAuthError> {
        let faces = self.locator.locate(grid);
        match faces.as_slice() {
            [] => Err(FaceAuthError::NoFaceDetected),
            [face] => Ok(*face),
            many => Err(FaceAuthError::MultipleFacesDetected(many.len())),
        }
    }

    fn check_liveness(&self, grid: &PixelGrid, region: &FaceRegion) -> Result<(), FaceAuthError> {
        let verdict = self.liveness.check(grid, region);
        if verdict.passed {
            Ok(())
        } else {
            Err(FaceAuthError::LivenessCheckFailed(verdict.reason))
        }
    }

    fn check_quality(&self, grid: &PixelGrid, region: &FaceRegion) -> Result<(), FaceAuthError> {
        let limits = &self.config.quality;
        if grid.width() < limits.min_image_side || grid.height() < limits.min_image_side {
            return Err(FaceAuthError::ImageQuality(format!(
                "image is {}x{}, need at least {} px per side",
                grid.width(),
                grid.height(),
                limits.min_image_side
            )));
        }
        let fraction = region.height as f64 / grid.height() as f64;
        if fraction < limits.min_face_fraction {
            return Err(FaceAuthError::ImageQuality(format!(
                "face fills {:.0}% of the image height; move closer",
                fraction * 100.0
            )));
        }
        let brightness = region
            .crop(grid)
            .map(|crop| imgproc::mean(imgproc::to_gray(&crop).iter().map(|&p| p as f64)))
            .unwrap_or(0.0);
        if brightness < limits.min_brightness {
            return Err(FaceAuthError::ImageQuality(format!(
                "face too dark (mean brightness {brightness:.0}); improve lighting"
            )));
        }
        Ok(())
    }

    /// The cached known set, filled from the store on first use.
    ///
    /// A fill that raced an enroll, remove or reload is discarded and read
    /// again. After `MAX_FILL_ATTEMPTS` lost races the fresh read is used for
    /// this request only and the cache stays unloaded.
    fn known_faces(&self) -> Result<Arc<Vec<KnownFace>>, FaceAuthError> {
        for attempt in 1..=MAX_FILL_ATTEMPTS {
            if self.engine.is_loaded() {
                return Ok(self.engine.snapshot());
            }
            let seen = self.engine.generation();
            let faces = self.read_store()?;
            if attempt == MAX_FILL_ATTEMPTS {
                tracing::warn!(attempt, "known-face cache kept changing during fill; not caching");
                return Ok(Arc::new(faces));
            }
            let loaded = faces.len();
            if self.engine.install_if_current(faces, seen) {
                tracing::info!(loaded, "known faces loaded");
                return Ok(self.engine.snapshot());
            }
            tracing::debug!(attempt, "enrollments changed during cache fill; rereading");
        }
        Ok(self.engine.snapshot())
    }

    fn read_store(&self) -> Result<Vec<KnownFace>, FaceAuthError> {
        let records = self.store.load_all()?;
        let total = records.len();
        let mut faces = Vec::with_capacity(total);
        for record in records {
            match FaceEncoding::from_bytes(&record.blob) {
                Ok(encoding) => faces.push(KnownFace {
                    identity: record.identity,
                    encoding,
                }),
                Err(err) => {
                    tracing::error!(identity = %record.identity, error = %err, "skipping unreadable enrollment")
                }
            }
        }
        if faces.len() != total {
            tracing::warn!(usable = faces.len(), total, "some enrollments could not be decoded");
        }
        Ok(faces)
    }
}

fn log_rejection(operation: &'static str, err: &FaceAuthError) {
    let kind = err.kind();
    if kind.is_internal() {
        tracing::error!(operation, ?kind, error = %err, "internal failure");
    } else if kind == ErrorKind::LivenessCheckFailed {
        tracing::warn!(operation, ?kind, error = %err, "rejected");
    } else {
        tracing::info!(operation, ?kind, error = %err, "rejected");
    }
}
