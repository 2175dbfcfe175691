//! AES-256-GCM sealing of encoding blobs at rest.
//!
//! Sealed layout: `b"FSL1" | nonce (12) | ciphertext+tag`. The key is the
//! SHA-256 digest of arbitrary key material, typically a root-only file.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SEAL_MAGIC: &[u8; 4] = b"FSL1";
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum SealError {
    #[error("cannot read key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("key file {0} is empty")]
    EmptyKey(PathBuf),
    #[error("sealed blob is malformed: {0}")]
    Malformed(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (wrong key or tampered blob)")]
    Decrypt,
}

pub struct BlobSealer {
    cipher: Aes256Gcm,
}

impl BlobSealer {
    pub fn from_key_material(material: &[u8]) -> Self {
        let key = Sha256::digest(material);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Derive the key from the contents of `path`. Surrounding whitespace is
    /// ignored so a trailing newline does not change the key.
    pub fn from_key_file(path: &Path) -> Result<Self, SealError> {
        let raw = std::fs::read(path).map_err(|source| SealError::KeyFile {
            path: path.to_path_buf(),
            source,
        })?;
        let material = trim_ascii_whitespace(&raw);
        if material.is_empty() {
            return Err(SealError::EmptyKey(path.to_path_buf()));
        }
        tracing::debug!(path = %path.display(), "blob sealing key loaded");
        Ok(Self::from_key_material(material))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SealError::Encrypt)?;

        let mut out = Vec::with_capacity(SEAL_MAGIC.len() + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(SEAL_MAGIC);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
        let Some(body) = sealed.strip_prefix(&SEAL_MAGIC[..]) else {
            return Err(SealError::Malformed("missing seal header".into()));
        };
        if body.len() < NONCE_LEN {
            return Err(SealError::Malformed(format!(
                "expected at least {NONCE_LEN} nonce bytes, found {}",
                body.len()
            )));
        }
        let (nonce, ciphertext) = body.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::Decrypt)
    }
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}
