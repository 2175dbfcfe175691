//! Error taxonomy shared by the engine stages and the service boundary.

use crate::liveness::LivenessReason;
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("image buffer is empty")]
    Empty,
    #[error("input is neither a known image format nor base64 text")]
    Malformed,
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("image exceeds decode limits: {0}")]
    TooLarge(String),
    #[error("image decoded to an empty {width}x{height} grid")]
    EmptyGrid { width: u32, height: u32 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    #[error("encoding must have {expected} values, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("invalid encoding blob: {0}")]
    InvalidBlob(String),
    #[error("degenerate face region: {0}")]
    DegenerateRegion(String),
    #[error("encoding block `{0}` contains non-finite values")]
    NonFinite(&'static str),
}

/// Failure of an enroll or authenticate call.
#[derive(Error, Debug)]
pub enum FaceAuthError {
    #[error("could not read image: {0}")]
    ImageDecode(#[from] DecodeError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{0} faces detected; use an image with exactly one face")]
    MultipleFacesDetected(usize),
    #[error("liveness check failed: {0}")]
    LivenessCheckFailed(LivenessReason),
    #[error("image quality too low: {0}")]
    ImageQuality(String),
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error("no faces are enrolled")]
    NoEnrollmentFound,
    #[error("face not recognized")]
    NoMatch,
    #[error("encoding store: {0}")]
    Store(#[from] StoreError),
}

/// Flat classification of [`FaceAuthError`], stable across the IPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ImageDecode,
    NoFaceDetected,
    MultipleFacesDetected,
    LivenessCheckFailed,
    ImageQuality,
    Encoding,
    NoEnrollmentFound,
    NoMatch,
    Store,
}

impl FaceAuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ImageDecode(_) => ErrorKind::ImageDecode,
            Self::NoFaceDetected => ErrorKind::NoFaceDetected,
            Self::MultipleFacesDetected(_) => ErrorKind::MultipleFacesDetected,
            Self::LivenessCheckFailed(_) => ErrorKind::LivenessCheckFailed,
            Self::ImageQuality(_) => ErrorKind::ImageQuality,
            Self::Encoding(_) => ErrorKind::Encoding,
            Self::NoEnrollmentFound => ErrorKind::NoEnrollmentFound,
            Self::NoMatch => ErrorKind::NoMatch,
            Self::Store(_) => ErrorKind::Store,
        }
    }
}

impl ErrorKind {
    /// Internal defects, as opposed to conditions the user fixes by retaking the photo.
    pub fn is_internal(self) -> bool {
        matches!(self, Self::Encoding | Self::Store)
    }
}
