use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Key, KeyInit, Nonce};
use rand::RngCore;

use crate::error::StatikoError;

/// Nonce length for AES-GCM, prepended to every ciphertext.
const NONCE_LEN: usize = 12;

/// Upper bound for each side of an encrypted key/cert pair.
const MAX_PEM_LEN: usize = 200 * 1024;

/// Symmetric codec for secrets embedded in the state document.
///
/// Wire form: `nonce(12B) ∥ AES-128-GCM ciphertext`. One fresh nonce per
/// encryption; the master key comes from configuration and never changes
/// at runtime.
#[derive(Clone)]
pub struct SecretCodec {
    cipher: Aes128Gcm,
}

impl SecretCodec {
    pub fn new(master_key: [u8; 16]) -> Self {
        let key = Key::<Aes128Gcm>::from_slice(&master_key);
        Self {
            cipher: Aes128Gcm::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StatikoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| StatikoError::Internal("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, StatikoError> {
        if blob.len() < NONCE_LEN {
            return Err(StatikoError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: &[],
                },
            )
            .map_err(|_| StatikoError::Decrypt)
    }

    /// Encrypt a PEM key/cert pair as one blob.
    pub fn encrypt_cert_pair(&self, key: &[u8], cert: &[u8]) -> Result<Vec<u8>, StatikoError> {
        self.encrypt(&encode_cert_pair(key, cert)?)
    }

    /// Decrypt and unframe a PEM key/cert pair.
    pub fn decrypt_cert_pair(&self, blob: &[u8]) -> Result<(Vec<u8>, Vec<u8>), StatikoError> {
        decode_cert_pair(&self.decrypt(blob)?)
    }
}

/// `le_u32(len_key) ∥ le_u32(len_cert) ∥ key ∥ cert`
pub fn encode_cert_pair(key: &[u8], cert: &[u8]) -> Result<Vec<u8>, StatikoError> {
    if key.is_empty() || cert.is_empty() {
        return Err(StatikoError::Validation(
            "key and certificate must both be non-empty".to_string(),
        ));
    }
    if key.len() > MAX_PEM_LEN || cert.len() > MAX_PEM_LEN {
        return Err(StatikoError::Validation(format!(
            "key or certificate exceeds {} bytes",
            MAX_PEM_LEN
        )));
    }

    let mut out = Vec::with_capacity(8 + key.len() + cert.len());
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(&(cert.len() as u32).to_le_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(cert);
    Ok(out)
}

pub fn decode_cert_pair(data: &[u8]) -> Result<(Vec<u8>, Vec<u8>), StatikoError> {
    if data.len() < 8 {
        return Err(StatikoError::Corrupt);
    }
    let key_len = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
    let cert_len = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
    if data.len() != 8 + key_len + cert_len {
        return Err(StatikoError::Corrupt);
    }
    let key = data[8..8 + key_len].to_vec();
    let cert = data[8 + key_len..].to_vec();
    Ok((key, cert))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> SecretCodec {
        SecretCodec::new([42u8; 16])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let c = codec();
        for plaintext in [&b""[..], b"x", b"a longer secret with spaces", &[0u8; 4096]] {
            let blob = c.encrypt(plaintext).unwrap();
            // nonce + ciphertext + 16-byte GCM tag
            assert_eq!(blob.len(), NONCE_LEN + plaintext.len() + 16);
            assert_eq!(c.decrypt(&blob).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_fresh_nonce_per_encryption() {
        let c = codec();
        let a = c.encrypt(b"same").unwrap();
        let b = c.encrypt(b"same").unwrap();
        assert_ne!(a, b);
        assert_ne!(&a[..NONCE_LEN], &b[..NONCE_LEN]);
    }

    #[test]
    fn test_tampered_ciphertext_fails_auth() {
        let c = codec();
        let mut blob = c.encrypt(b"payload").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(c.decrypt(&blob), Err(StatikoError::Decrypt)));
    }

    #[test]
    fn test_wrong_key_fails_auth() {
        let blob = codec().encrypt(b"payload").unwrap();
        let other = SecretCodec::new([43u8; 16]);
        assert!(matches!(other.decrypt(&blob), Err(StatikoError::Decrypt)));
    }

    #[test]
    fn test_truncated_blob() {
        let c = codec();
        assert!(matches!(c.decrypt(&[1, 2, 3]), Err(StatikoError::Decrypt)));
    }

    #[test]
    fn test_cert_pair_roundtrip() {
        let (key, cert) = decode_cert_pair(&encode_cert_pair(b"KEY", b"CERT").unwrap()).unwrap();
        assert_eq!(key, b"KEY");
        assert_eq!(cert, b"CERT");
    }

    #[test]
    fn test_cert_pair_encrypted_roundtrip() {
        let c = codec();
        let blob = c.encrypt_cert_pair(b"-----KEY-----", b"-----CERT-----").unwrap();
        let (key, cert) = c.decrypt_cert_pair(&blob).unwrap();
        assert_eq!(key, b"-----KEY-----");
        assert_eq!(cert, b"-----CERT-----");
    }

    #[test]
    fn test_cert_pair_rejects_empty_sides() {
        assert!(encode_cert_pair(b"", b"CERT").is_err());
        assert!(encode_cert_pair(b"KEY", b"").is_err());
    }

    #[test]
    fn test_cert_pair_rejects_oversize() {
        let big = vec![0u8; MAX_PEM_LEN + 1];
        assert!(encode_cert_pair(&big, b"CERT").is_err());
        assert!(encode_cert_pair(b"KEY", &big).is_err());
    }

    #[test]
    fn test_cert_pair_length_mismatch_is_corrupt() {
        let mut framed = encode_cert_pair(b"KEY", b"CERT").unwrap();
        framed.push(0);
        assert!(matches!(
            decode_cert_pair(&framed),
            Err(StatikoError::Corrupt)
        ));
        assert!(matches!(decode_cert_pair(&[0; 4]), Err(StatikoError::Corrupt)));
    }
}
