//! HMAC-SHA256 authentication of message bodies.

use crate::core::{Result, TallyError};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex-encoded HMAC of the body.
pub const HASH_HEADER: &str = "HashSHA256";

/// RPC metadata key for the same value (metadata keys are lowercase).
pub const HASH_METADATA: &str = "hashsha256";

/// Signs and verifies bodies with a shared secret.
///
/// An empty or missing key disables both directions.
#[derive(Clone, Default)]
pub struct Signer {
    key: Option<Vec<u8>>,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Signer {
    /// Create a signer; `None` or an empty key turns signing off
    pub fn new(key: Option<&str>) -> Self {
        Self {
            key: key.filter(|k| !k.is_empty()).map(|k| k.as_bytes().to_vec()),
        }
    }

    /// Returns true if a key is configured
    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    fn mac(key: &[u8], body: &[u8]) -> HmacSha256 {
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(body);
        mac
    }

    /// Hex HMAC of `body`; `None` when no key is set or the body is empty.
    pub fn sign(&self, body: &[u8]) -> Option<String> {
        let key = self.key.as_deref()?;
        if body.is_empty() {
            return None;
        }
        Some(hex::encode(Self::mac(key, body).finalize().into_bytes()))
    }

    /// Checks a received signature against `body`.
    ///
    /// Without a key every request passes. With a key, a present header must
    /// match in constant time; a missing header is only accepted for an
    /// empty body.
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> Result<()> {
        let Some(key) = self.key.as_deref() else {
            return Ok(());
        };
        match signature {
            Some(sig) => {
                let expected = hex::decode(sig.trim()).map_err(|_| TallyError::BadHmac)?;
                Self::mac(key, body)
                    .verify_slice(&expected)
                    .map_err(|_| TallyError::BadHmac)
            },
            None if body.is_empty() => Ok(()),
            None => Err(TallyError::BadHmac),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = Signer::new(Some("s3cret"));
        let sig = signer.sign(b"payload").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(signer.verify(b"payload", Some(&sig)).is_ok());
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        let signer = Signer::new(Some("Jefe"));
        let sig = signer.sign(b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sig = Signer::new(Some("wrong")).sign(b"payload").unwrap();
        let err = Signer::new(Some("s3cret")).verify(b"payload", Some(&sig)).unwrap_err();
        assert!(matches!(err, TallyError::BadHmac));
    }

    #[test]
    fn test_no_signature_for_empty_body_or_key() {
        assert!(Signer::new(Some("k")).sign(b"").is_none());
        assert!(Signer::new(None).sign(b"body").is_none());
        assert!(Signer::new(Some("")).sign(b"body").is_none());
    }

    #[test]
    fn test_verify_rules() {
        let keyless = Signer::new(None);
        assert!(keyless.verify(b"body", Some("deadbeef")).is_ok());

        let keyed = Signer::new(Some("k"));
        assert!(keyed.verify(b"", None).is_ok());
        assert!(matches!(keyed.verify(b"body", None), Err(TallyError::BadHmac)));
        assert!(matches!(keyed.verify(b"body", Some("not-hex")), Err(TallyError::BadHmac)));
    }
}
