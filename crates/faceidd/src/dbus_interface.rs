use crate::engine::{EngineError, EngineHandle};
use std::time::Instant;
use zbus::interface;

pub const BUS_NAME: &str = "org.faceid.Engine1";
pub const OBJECT_PATH: &str = "/org/faceid/Engine1";

const MAX_IDENTITY_LEN: usize = 128;

/// D-Bus interface for the faceid daemon.
///
/// Bus name: org.faceid.Engine1
/// Object path: /org/faceid/Engine1
///
/// Images travel as raw `ay` payloads; any encoded format the decoder
/// understands is accepted, including base64 data URIs.
pub struct FaceIdService {
    engine: EngineHandle,
    max_image_bytes: usize,
    sealed_store: bool,
    started: Instant,
}

impl FaceIdService {
    pub fn new(engine: EngineHandle, max_image_bytes: usize, sealed_store: bool) -> Self {
        Self {
            engine,
            max_image_bytes,
            sealed_store,
            started: Instant::now(),
        }
    }

    fn check_image(&self, image: &[u8]) -> zbus::fdo::Result<()> {
        if image.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("image is empty".into()));
        }
        if image.len() > self.max_image_bytes {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "image is {} bytes; limit is {}",
                image.len(),
                self.max_image_bytes
            )));
        }
        Ok(())
    }
}

#[interface(name = "org.faceid.Engine1")]
impl FaceIdService {
    /// Enroll the single face in `image` under `identity`.
    /// Returns (success, message).
    async fn enroll(&self, identity: &str, image: Vec<u8>) -> zbus::fdo::Result<(bool, String)> {
        check_identity(identity)?;
        self.check_image(&image)?;
        tracing::info!(identity, bytes = image.len(), "enroll requested");
        let outcome = self
            .engine
            .enroll(identity.to_string(), image)
            .await
            .map_err(to_fdo)?;
        Ok((outcome.is_success(), outcome.message()))
    }

    /// Identify the face in `image`. Returns the outcome as JSON.
    async fn authenticate(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        self.check_image(&image)?;
        tracing::info!(bytes = image.len(), "authenticate requested");
        let outcome = self.engine.authenticate(image).await.map_err(to_fdo)?;
        to_json(&outcome)
    }

    /// Check the face in `image` against `identity` only. Returns JSON.
    async fn verify(&self, identity: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        check_identity(identity)?;
        self.check_image(&image)?;
        tracing::info!(identity, bytes = image.len(), "verify requested");
        let outcome = self
            .engine
            .verify(identity.to_string(), image)
            .await
            .map_err(to_fdo)?;
        to_json(&outcome)
    }

    async fn has_enrollment(&self, identity: &str) -> zbus::fdo::Result<bool> {
        check_identity(identity)?;
        self.engine
            .has_enrollment(identity.to_string())
            .await
            .map_err(to_fdo)
    }

    async fn remove_enrollment(&self, identity: &str) -> zbus::fdo::Result<bool> {
        check_identity(identity)?;
        tracing::info!(identity, "remove requested");
        self.engine
            .remove_enrollment(identity.to_string())
            .await
            .map_err(to_fdo)
    }

    /// Drop cached encodings so external store edits take effect.
    async fn reload(&self) {
        self.engine.reload();
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "enrolled": status.enrolled,
            "workers": status.workers,
            "strict_mode": status.strict_mode,
            "threshold": status.threshold,
            "sealed_store": self.sealed_store,
            "uptime_secs": self.started.elapsed().as_secs(),
        })
        .to_string())
    }
}

fn check_identity(identity: &str) -> zbus::fdo::Result<()> {
    if identity.is_empty() {
        return Err(zbus::fdo::Error::InvalidArgs("identity is empty".into()));
    }
    if identity.len() > MAX_IDENTITY_LEN {
        return Err(zbus::fdo::Error::InvalidArgs(format!(
            "identity longer than {MAX_IDENTITY_LEN} bytes"
        )));
    }
    if identity.chars().any(char::is_control) {
        return Err(zbus::fdo::Error::InvalidArgs(
            "identity contains control characters".into(),
        ));
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    tracing::error!(error = %err, "engine request failed");
    match err {
        EngineError::Timeout(_) => zbus::fdo::Error::TimedOut(err.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}
