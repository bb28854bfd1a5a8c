//! Signed download paths for restore artifacts.
//!
//! A download path segment is HMAC-SHA256 based, scoped to one operation id.
//! Format: `<op_id_hex>-<hmac_hex>` where `op_id_hex` is the big-endian
//! 64-bit id in 16 hex chars and the HMAC is computed over those 8 raw
//! bytes with a process-scoped secret. The transport appends
//! `/<file_subpath>` and verifies the segment before streaming anything.

use std::path::Path;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Size of the generated secret in bytes.
const SECRET_LEN: usize = 32;

/// Errors that can occur verifying a download path.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("invalid download path format: {0}")]
    InvalidFormat(String),

    #[error("download signature verification failed")]
    Unauthorized,
}

/// Signs and verifies download path segments with a process-scoped secret.
#[derive(Clone)]
pub struct Signer {
    secret: Vec<u8>,
}

impl Signer {
    /// Create a signer from raw secret bytes.
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Load the hex-encoded secret from `path`, generating and persisting a
    /// fresh one (0600 on Unix) on first start.
    pub fn load_or_generate(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read secret file {}", path.display()))?;
            let secret = hex::decode(contents.trim())
                .with_context(|| format!("secret file {} is not valid hex", path.display()))?;
            return Ok(Self::new(secret));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create secret directory {}", parent.display())
                })?;
            }
        }

        let mut secret = vec![0u8; SECRET_LEN];
        rand::Rng::fill(&mut rand::rng(), &mut secret[..]);

        std::fs::write(path, hex::encode(&secret))
            .with_context(|| format!("failed to write secret file {}", path.display()))?;

        // Owner read/write only on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)
                .with_context(|| format!("failed to set permissions on {}", path.display()))?;
        }

        Ok(Self::new(secret))
    }

    /// Produce the signed path segment for an operation id.
    pub fn sign(&self, op_id: i64) -> String {
        let mac = compute_hmac(&self.secret, &op_id.to_be_bytes());
        format!("{:016x}-{}", op_id as u64, hex::encode(mac))
    }

    /// Verify a signed path segment and extract the operation id.
    ///
    /// Parses `<op_id_hex>-<hmac_hex>`, recomputes the HMAC over the
    /// big-endian id bytes, and compares in constant time.
    pub fn verify(&self, segment: &str) -> Result<i64, SignError> {
        let (op_hex, sig_hex) = segment
            .split_once('-')
            .ok_or_else(|| SignError::InvalidFormat("missing '-' separator".into()))?;

        if op_hex.len() != 16 {
            return Err(SignError::InvalidFormat(format!(
                "operation id must be 16 hex chars, got {}",
                op_hex.len()
            )));
        }
        let op_id = u64::from_str_radix(op_hex, 16)
            .map_err(|e| SignError::InvalidFormat(format!("invalid operation id hex: {e}")))?
            as i64;

        let provided = hex::decode(sig_hex)
            .map_err(|e| SignError::InvalidFormat(format!("invalid signature hex: {e}")))?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC can take key of any size");
        mac.update(&op_id.to_be_bytes());
        // `verify_slice` is constant-time.
        mac.verify_slice(&provided)
            .map_err(|_| SignError::Unauthorized)?;

        Ok(op_id)
    }

    /// Verify a full download path `<segment>/<file_subpath>` and return
    /// `(op_id, subpath)`.
    pub fn verify_download_path<'a>(&self, path: &'a str) -> Result<(i64, &'a str), SignError> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let (segment, subpath) = path
            .split_once('/')
            .ok_or_else(|| SignError::InvalidFormat("missing file subpath".into()))?;
        let op_id = self.verify(segment)?;
        Ok((op_id, subpath))
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

fn compute_hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signer() -> Signer {
        Signer::new(b"test-secret-key-for-warden".to_vec())
    }

    #[test]
    fn sign_has_expected_shape() {
        let signer = test_signer();
        let segment = signer.sign(7);

        let (op_hex, sig_hex) = segment.split_once('-').unwrap();
        assert_eq!(op_hex, "0000000000000007");
        // SHA-256 = 32 bytes = 64 hex chars.
        assert_eq!(sig_hex.len(), 64);
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let signer = test_signer();
        for op_id in [0, 1, 7, 42, i64::MAX] {
            let segment = signer.sign(op_id);
            assert_eq!(signer.verify(&segment).unwrap(), op_id);
        }
    }

    #[test]
    fn flipping_low_signature_bit_is_unauthorized() {
        let signer = test_signer();
        let segment = signer.sign(7);

        let (op_hex, sig_hex) = segment.split_once('-').unwrap();
        let mut sig = hex::decode(sig_hex).unwrap();
        sig[31] ^= 0x01;
        let tampered = format!("{op_hex}-{}", hex::encode(sig));

        assert!(matches!(
            signer.verify(&tampered),
            Err(SignError::Unauthorized)
        ));
    }

    #[test]
    fn tampered_op_id_is_unauthorized() {
        let signer = test_signer();
        let segment = signer.sign(7);
        let tampered = segment.replacen("0000000000000007", "0000000000000008", 1);

        assert!(matches!(
            signer.verify(&tampered),
            Err(SignError::Unauthorized)
        ));
    }

    #[test]
    fn wrong_secret_is_unauthorized() {
        let signer = test_signer();
        let other = Signer::new(b"some-other-secret".to_vec());
        let segment = signer.sign(7);

        assert!(matches!(other.verify(&segment), Err(SignError::Unauthorized)));
    }

    #[test]
    fn malformed_segments_are_format_errors() {
        let signer = test_signer();
        for bad in [
            "",
            "no-separator-here-but-wrong",
            "0007-abcd",
            "000000000000000z-abcd",
            "0000000000000007-zzzz",
        ] {
            assert!(
                matches!(signer.verify(bad), Err(SignError::InvalidFormat(_))),
                "expected format error for {bad:?}"
            );
        }
    }

    #[test]
    fn download_path_verification_extracts_subpath() {
        let signer = test_signer();
        let segment = signer.sign(12);
        let path = format!("/{segment}/archive/files.tar.gz");

        let (op_id, subpath) = signer.verify_download_path(&path).unwrap();
        assert_eq!(op_id, 12);
        assert_eq!(subpath, "archive/files.tar.gz");
    }

    #[test]
    fn download_path_without_subpath_is_rejected() {
        let signer = test_signer();
        let segment = signer.sign(12);
        assert!(matches!(
            signer.verify_download_path(&segment),
            Err(SignError::InvalidFormat(_))
        ));
    }

    #[test]
    fn load_or_generate_persists_and_reloads() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("secret");

        let first = Signer::load_or_generate(&path).unwrap();
        let second = Signer::load_or_generate(&path).unwrap();

        // Same persisted secret produces identical signatures.
        assert_eq!(first.sign(99), second.sign(99));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim().len(), SECRET_LEN * 2);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
