//! faceid-core: facial biometric engine.
//!
//! Locates faces with a window-based detector, gates frames through
//! liveness heuristics, encodes face crops into 359-value feature vectors
//! and identifies them against enrolled encodings with a fused similarity
//! score. Everything here is synchronous, CPU-bound and free of I/O; storage
//! is reached only through the [`EncodingStore`] trait.

pub mod config;
pub mod decode;
pub mod encoder;
pub mod error;
pub mod imgproc;
pub mod liveness;
pub mod locator;
pub mod matcher;
pub mod service;
pub mod store;
pub mod types;

pub use config::EngineConfig;
pub use decode::decode_image;
pub use encoder::FeatureEncoder;
pub use error::{ErrorKind, FaceAuthError};
pub use liveness::{LivenessGate, LivenessReason, LivenessVerdict};
pub use locator::FaceLocator;
pub use matcher::{Comparison, FusedMatcher, KnownFace, MatchEngine, MatchReason, MatchResult, Matcher};
pub use service::{AuthOutcome, EnrollOutcome, FacialAuthService, Rejection};
pub use store::{EncodingStore, EnrollmentRecord, StoreError};
pub use types::{FaceEncoding, FaceRegion, PixelGrid, ENCODING_LEN};
