//! End-to-end enroll/authenticate flows over synthetic images.

use faceid_core::config::EngineConfig;
use faceid_core::liveness::LivenessReason;
use faceid_core::matcher::{MatchConfig, ScoreBreakdown};
use faceid_core::{
    AuthOutcome, Comparison, EncodingStore, EnrollOutcome, EnrollmentRecord, ErrorKind, FaceEncoding,
    FacialAuthService, MatchEngine, Matcher, StoreError,
};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct OrderedStore {
    records: Mutex<Vec<EnrollmentRecord>>,
}

impl EncodingStore for OrderedStore {
    fn put(&self, identity: &str, blob: &[u8]) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        match records.iter_mut().find(|r| r.identity == identity) {
            Some(r) => r.blob = blob.to_vec(),
            None => records.push(EnrollmentRecord {
                identity: identity.to_string(),
                blob: blob.to_vec(),
            }),
        }
        Ok(())
    }

    fn contains(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(self.records.lock().unwrap().iter().any(|r| r.identity == identity))
    }

    fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| r.identity != identity);
        Ok(records.len() != before)
    }

    fn load_all(&self) -> Result<Vec<EnrollmentRecord>, StoreError> {
        Ok(self.records.lock().unwrap().clone())
    }
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u8 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) as u8
    }
}

/// A 320×320 gray frame with one 120 px colour-noise "face" at (100, 100).
fn face_frame(seed: u64) -> RgbImage {
    let mut img = RgbImage::from_pixel(320, 320, Rgb([90, 90, 90]));
    paint_patch(&mut img, 100, 100, 120, seed);
    img
}

fn paint_patch(img: &mut RgbImage, x0: u32, y0: u32, side: u32, seed: u64) {
    let mut rng = Lcg(seed);
    for y in y0..y0 + side {
        for x in x0..x0 + side {
            img.put_pixel(x, y, Rgb([rng.next(), rng.next(), rng.next()]));
        }
    }
}

/// Colour noise over the whole frame, with no background for a face to stand out from.
fn noise_frame(seed: u64) -> RgbImage {
    let mut img = RgbImage::new(320, 320);
    paint_patch(&mut img, 0, 0, 320, seed);
    img
}

fn png(img: &RgbImage) -> Vec<u8> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
    buf
}

fn service(config: EngineConfig) -> (FacialAuthService, Arc<OrderedStore>) {
    let store = Arc::new(OrderedStore::default());
    (FacialAuthService::new(config, store.clone()), store)
}

/// Only an exact re-presentation of the enrolled image clears this.
///
/// Two different noise patches share the same colour statistics, so at the
/// default 0.65 a stranger patch scores around 79% against alice and is let in.
fn strict_threshold() -> EngineConfig {
    EngineConfig {
        matching: MatchConfig {
            threshold: 0.99,
            ..MatchConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn rejection_kind(outcome: &AuthOutcome) -> Option<ErrorKind> {
    match outcome {
        AuthOutcome::Rejected(r) => Some(r.kind),
        AuthOutcome::Authenticated { .. } => None,
    }
}

#[test]
fn test_alice_enrolls_and_authenticates() {
    let (svc, store) = service(EngineConfig::default());
    let image = png(&face_frame(7));

    let enrolled = svc.enroll("alice", &image);
    assert!(enrolled.is_success(), "{}", enrolled.message());
    assert!(svc.has_enrollment("alice").unwrap());
    assert_eq!(store.load_all().unwrap()[0].blob.len(), 4 + 359 * 8);

    match svc.authenticate(&image) {
        AuthOutcome::Authenticated { identity, confidence } => {
            assert_eq!(identity, "alice");
            assert!(confidence >= 99.0, "confidence {confidence}");
        }
        other => panic!("expected authentication, got {other:?}"),
    }

    let noise = svc.authenticate(&png(&noise_frame(11)));
    assert_eq!(rejection_kind(&noise), Some(ErrorKind::NoFaceDetected));
}

#[test]
fn test_authentication_after_restart_reads_the_store() {
    let store = Arc::new(OrderedStore::default());
    let image = png(&face_frame(7));
    let first = FacialAuthService::new(EngineConfig::default(), store.clone());
    assert!(first.enroll("alice", &image).is_success());

    let second = FacialAuthService::new(EngineConfig::default(), store);
    assert_eq!(second.authenticate(&image).identity(), Some("alice"));
}

#[test]
fn test_authenticate_with_nobody_enrolled() {
    let (svc, _) = service(EngineConfig::default());
    let outcome = svc.authenticate(&png(&face_frame(7)));
    assert_eq!(rejection_kind(&outcome), Some(ErrorKind::NoEnrollmentFound));
}

#[test]
fn test_stranger_is_not_recognized() {
    let (svc, _) = service(strict_threshold());
    assert!(svc.enroll("alice", &png(&face_frame(7))).is_success());
    let outcome = svc.authenticate(&png(&face_frame(8)));
    assert_eq!(rejection_kind(&outcome), Some(ErrorKind::NoMatch));
}

#[test]
fn test_first_enrolled_identity_wins_ties() {
    // Threshold and consistency bar low enough that every enrollment matches.
    let config = EngineConfig {
        matching: MatchConfig {
            threshold: -1.0,
            consistency_threshold: -1.0,
            ..MatchConfig::default()
        },
        ..EngineConfig::default()
    };
    let (svc, _) = service(config);
    assert!(svc.enroll("bob", &png(&face_frame(8))).is_success());
    assert!(svc.enroll("alice", &png(&face_frame(7))).is_success());

    let outcome = svc.authenticate(&png(&face_frame(7)));
    assert_eq!(outcome.identity(), Some("bob"));
}

#[test]
fn test_re_enrollment_replaces_encoding() {
    let (svc, store) = service(strict_threshold());
    assert!(svc.enroll("alice", &png(&face_frame(7))).is_success());
    assert!(svc.enroll("alice", &png(&face_frame(8))).is_success());
    assert_eq!(store.load_all().unwrap().len(), 1);

    assert_eq!(svc.authenticate(&png(&face_frame(8))).identity(), Some("alice"));
    assert_eq!(rejection_kind(&svc.authenticate(&png(&face_frame(7)))), Some(ErrorKind::NoMatch));
}

#[test]
fn test_verify_checks_one_identity() {
    let (svc, _) = service(strict_threshold());
    let image = png(&face_frame(7));
    assert!(svc.enroll("alice", &image).is_success());

    assert_eq!(svc.verify("alice", &image).identity(), Some("alice"));
    assert_eq!(rejection_kind(&svc.verify("bob", &image)), Some(ErrorKind::NoEnrollmentFound));
}

#[test]
fn test_removed_identity_no_longer_authenticates() {
    let (svc, _) = service(EngineConfig::default());
    let image = png(&face_frame(7));
    assert!(svc.enroll("alice", &image).is_success());
    assert!(svc.authenticate(&image).is_success());

    assert!(svc.remove_enrollment("alice").unwrap());
    assert_eq!(rejection_kind(&svc.authenticate(&image)), Some(ErrorKind::NoEnrollmentFound));
}

#[test]
fn test_two_faces_are_ambiguous() {
    let (svc, _) = service(EngineConfig::default());
    let mut img = RgbImage::from_pixel(640, 320, Rgb([90, 90, 90]));
    paint_patch(&mut img, 60, 100, 120, 1);
    paint_patch(&mut img, 420, 100, 120, 2);

    match svc.enroll("alice", &png(&img)) {
        EnrollOutcome::Rejected(r) => {
            assert_eq!(r.kind, ErrorKind::MultipleFacesDetected);
            assert!(r.message.starts_with("2 faces"), "{}", r.message);
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test]
fn test_failed_liveness_blocks_authentication() {
    let mut config = EngineConfig::default();
    config.liveness.min_sharpness = 1e12;
    let (svc, _) = service(config);
    let image = png(&face_frame(7));
    // Enrollment skips liveness unless asked to.
    assert!(svc.enroll("alice", &image).is_success());

    match svc.authenticate(&image) {
        AuthOutcome::Rejected(r) => {
            assert_eq!(r.kind, ErrorKind::LivenessCheckFailed);
            assert!(r.message.contains(&LivenessReason::Blurry.to_string()));
        }
        other => panic!("expected liveness rejection, got {other:?}"),
    }
}

#[test]
fn test_enroll_liveness_is_opt_in() {
    let mut config = EngineConfig::default();
    config.liveness.min_sharpness = 1e12;
    config.enroll_liveness = true;
    let (svc, store) = service(config);
    let outcome = svc.enroll("alice", &png(&face_frame(7)));
    assert!(!outcome.is_success());
    assert!(store.load_all().unwrap().is_empty());
}

#[test]
fn test_base64_data_uri_input() {
    use base64::Engine as _;
    let (svc, _) = service(EngineConfig::default());
    let raw = png(&face_frame(7));
    let uri = format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(&raw)
    );
    assert!(svc.enroll("alice", uri.as_bytes()).is_success());
    assert_eq!(svc.authenticate(&raw).identity(), Some("alice"));
}

/// Matcher returning a fixed score per enrolled encoding, 0 for anything else.
#[derive(Clone, Default)]
struct ScriptedMatcher {
    scores: Arc<Mutex<Vec<(FaceEncoding, f64)>>>,
}

impl ScriptedMatcher {
    fn set(&self, encoding: FaceEncoding, score: f64) {
        let mut scores = self.scores.lock().unwrap();
        scores.retain(|(e, _)| *e != encoding);
        scores.push((encoding, score));
    }
}

impl Matcher for ScriptedMatcher {
    fn compare(&self, _a: &FaceEncoding, b: &FaceEncoding, threshold: f64) -> Comparison {
        let score = self
            .scores
            .lock()
            .unwrap()
            .iter()
            .find(|(e, _)| e == b)
            .map_or(0.0, |(_, s)| *s);
        Comparison {
            is_match: score >= threshold,
            score,
            breakdown: ScoreBreakdown {
                intensity: score,
                texture: score,
                shape: score,
                gradient: score,
            },
            naturalness_rejected: false,
        }
    }
}

fn scripted_service(config: EngineConfig) -> (FacialAuthService, Arc<OrderedStore>, ScriptedMatcher) {
    let matcher = ScriptedMatcher::default();
    let engine = Arc::new(MatchEngine::with_matcher(
        Box::new(matcher.clone()),
        config.matching.threshold,
    ));
    let store = Arc::new(OrderedStore::default());
    let svc = FacialAuthService::with_engine(config, store.clone(), engine);
    (svc, store, matcher)
}

fn stored_encoding(store: &OrderedStore, identity: &str) -> FaceEncoding {
    let records = store.load_all().unwrap();
    let record = records.iter().find(|r| r.identity == identity).unwrap();
    FaceEncoding::from_bytes(&record.blob).unwrap()
}

#[test]
fn test_consistency_recheck_skips_a_marginal_match() {
    let (svc, store, matcher) = scripted_service(EngineConfig::default());
    assert!(svc.enroll("bob", &png(&face_frame(8))).is_success());
    assert!(svc.enroll("alice", &png(&face_frame(7))).is_success());

    // bob clears the 0.65 match threshold but not the 0.70 re-check.
    matcher.set(stored_encoding(&store, "bob"), 0.68);
    matcher.set(stored_encoding(&store, "alice"), 0.90);
    assert_eq!(svc.authenticate(&png(&face_frame(7))).identity(), Some("alice"));

    matcher.set(stored_encoding(&store, "alice"), 0.68);
    let outcome = svc.authenticate(&png(&face_frame(7)));
    assert_eq!(rejection_kind(&outcome), Some(ErrorKind::NoMatch));
}

#[test]
fn test_marginal_match_accepted_without_recheck() {
    let config = EngineConfig {
        consistency_check: false,
        ..EngineConfig::default()
    };
    let (svc, store, matcher) = scripted_service(config);
    assert!(svc.enroll("bob", &png(&face_frame(8))).is_success());
    assert!(svc.enroll("alice", &png(&face_frame(7))).is_success());

    matcher.set(stored_encoding(&store, "bob"), 0.68);
    matcher.set(stored_encoding(&store, "alice"), 0.90);
    match svc.authenticate(&png(&face_frame(7))) {
        AuthOutcome::Authenticated { identity, confidence } => {
            assert_eq!(identity, "bob");
            assert!((confidence - 68.0).abs() < 1e-9, "confidence {confidence}");
        }
        other => panic!("expected authentication, got {other:?}"),
    }
}

#[test]
fn test_verify_applies_the_recheck_too() {
    let (svc, store, matcher) = scripted_service(EngineConfig::default());
    assert!(svc.enroll("bob", &png(&face_frame(8))).is_success());
    matcher.set(stored_encoding(&store, "bob"), 0.68);

    let outcome = svc.verify("bob", &png(&face_frame(8)));
    assert_eq!(rejection_kind(&outcome), Some(ErrorKind::NoMatch));
}

