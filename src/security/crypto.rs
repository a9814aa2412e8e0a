//! RSA-OAEP (SHA-256) body encryption.
//!
//! A single OAEP block holds at most `k - 2 * 32 - 2` bytes of plaintext,
//! where `k` is the modulus size in bytes. Longer bodies are split into
//! blocks of that size, each encrypted on its own; the ciphertext is the
//! concatenation of `k`-byte blocks.

use crate::core::{Result, TallyError};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::path::Path;

/// Smallest accepted modulus.
pub const MIN_KEY_BITS: usize = 2048;

const SHA256_LEN: usize = 32;

fn oaep() -> Oaep {
    Oaep::new::<Sha256>()
}

fn plaintext_block(modulus_bytes: usize) -> usize {
    modulus_bytes - 2 * SHA256_LEN - 2
}

fn check_size(modulus_bytes: usize) -> Result<()> {
    if modulus_bytes * 8 < MIN_KEY_BITS {
        return Err(TallyError::crypto(format!(
            "RSA key has {} bits, at least {} required",
            modulus_bytes * 8,
            MIN_KEY_BITS
        )));
    }
    Ok(())
}

/// Agent side: encrypts outgoing bodies with the server's public key.
#[derive(Debug, Clone)]
pub struct Encryptor {
    key: RsaPublicKey,
}

impl Encryptor {
    /// Parse a PEM public key (SPKI or PKCS#1)
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| TallyError::crypto(format!("invalid RSA public key: {e}")))?;
        check_size(key.size())?;
        Ok(Self { key })
    }

    /// Read and parse a PEM public key file
    pub fn from_file(path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            TallyError::crypto(format!("failed to read public key {}: {e}", path.display()))
        })?;
        Self::from_pem(&pem)
    }

    /// Wrap an already parsed key
    pub fn from_key(key: RsaPublicKey) -> Result<Self> {
        check_size(key.size())?;
        Ok(Self { key })
    }

    /// Encrypt `plaintext` block by block.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let k = self.key.size();
        let block = plaintext_block(k);
        let mut rng = rand::thread_rng();
        let mut out = Vec::with_capacity(plaintext.len().div_ceil(block).max(1) * k);

        for chunk in plaintext.chunks(block) {
            let encrypted = self
                .key
                .encrypt(&mut rng, oaep(), chunk)
                .map_err(|e| TallyError::crypto(format!("encryption failed: {e}")))?;
            out.extend_from_slice(&encrypted);
        }
        Ok(out)
    }
}

/// Server side: decrypts inbound bodies with the private key.
#[derive(Debug, Clone)]
pub struct Decryptor {
    key: RsaPrivateKey,
}

impl Decryptor {
    /// Parse a PEM private key (PKCS#8 or PKCS#1)
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| TallyError::crypto(format!("invalid RSA private key: {e}")))?;
        check_size(key.size())?;
        Ok(Self { key })
    }

    /// Read and parse a PEM private key file
    pub fn from_file(path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            TallyError::crypto(format!("failed to read private key {}: {e}", path.display()))
        })?;
        Self::from_pem(&pem)
    }

    /// Wrap an already parsed key
    pub fn from_key(key: RsaPrivateKey) -> Result<Self> {
        check_size(key.size())?;
        Ok(Self { key })
    }

    /// Decrypt a concatenation of `k`-byte OAEP blocks.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let k = self.key.size();
        if ciphertext.len() % k != 0 {
            return Err(TallyError::crypto(format!(
                "ciphertext length {} is not a multiple of {k}",
                ciphertext.len()
            )));
        }
        let mut out = Vec::with_capacity(ciphertext.len());
        for block in ciphertext.chunks(k) {
            let plain = self
                .key
                .decrypt(oaep(), block)
                .map_err(|e| TallyError::crypto(format!("decryption failed: {e}")))?;
            out.extend_from_slice(&plain);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    fn keypair() -> (Encryptor, Decryptor) {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let public = RsaPublicKey::from(&private);
        (Encryptor::from_key(public).unwrap(), Decryptor::from_key(private).unwrap())
    }

    #[test]
    fn test_multi_block_body() {
        let (enc, dec) = keypair();
        let body: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        let ciphertext = enc.encrypt(&body).unwrap();
        assert_eq!(ciphertext.len() % 256, 0);
        assert_eq!(ciphertext.len(), 6 * 256);
        assert_eq!(dec.decrypt(&ciphertext).unwrap(), body);
    }

    #[test]
    fn test_pem_loading() {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let public_pem = RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let private_pem = private.to_pkcs8_pem(LineEnding::LF).unwrap();

        let enc = Encryptor::from_pem(&public_pem).unwrap();
        let dec = Decryptor::from_pem(&private_pem).unwrap();
        let ciphertext = enc.encrypt(br#"[{"id":"x","type":"counter","delta":1}]"#).unwrap();
        assert_eq!(
            dec.decrypt(&ciphertext).unwrap(),
            br#"[{"id":"x","type":"counter","delta":1}]"#
        );
    }

    #[test]
    fn test_small_keys_rejected() {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        assert!(matches!(
            Decryptor::from_key(private),
            Err(TallyError::Crypto(_))
        ));
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let (enc, dec) = keypair();
        let mut ciphertext = enc.encrypt(b"hello").unwrap();
        ciphertext.pop();
        assert!(dec.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_garbage_pem_rejected() {
        assert!(Encryptor::from_pem("not a key").is_err());
        assert!(Decryptor::from_pem("not a key").is_err());
    }
}
