//! OpenFunnel PII Encryption
//!
//! Authenticated encryption for sensitive lead/contact fields plus a
//! deterministic, secret-keyed fingerprint enabling indexed equality
//! search without decryption.
//!
//! Each field category carries independent key material: compromise of
//! the email key exposes nothing about phone ciphertexts, and fingerprints
//! cannot be correlated across categories. The associated data binds every
//! ciphertext to its category and key version, so a blob produced for one
//! cannot be replayed as another.
//!
//! Plaintext, keys, and secrets never appear in logs or error values.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use base64::Engine;
use funnel_common::CryptoConfig;
use hmac::{Hmac, Mac};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Instant;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Sensitive field category; each category has its own key material and
/// normalization rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldCategory {
    Email,
    Phone,
}

impl FieldCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldCategory::Email => "email",
            FieldCategory::Phone => "phone",
        }
    }

    /// Canonical form used for fingerprinting, so semantically-equal
    /// inputs in different textual shapes hash identically
    pub fn normalize(&self, raw: &str) -> String {
        match self {
            FieldCategory::Email => raw.trim().to_lowercase(),
            FieldCategory::Phone => raw.chars().filter(|c| c.is_ascii_digit()).collect(),
        }
    }
}

impl std::fmt::Display for FieldCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An encrypted field as persisted by the owning record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedField {
    /// Base64 of `nonce || ciphertext || tag`; fresh nonce per encryption
    pub ciphertext: String,
    /// Deterministic keyed hash of the normalized plaintext (hex)
    pub fingerprint: String,
    /// Key version that produced the ciphertext
    pub key_version: u32,
}

/// Encryption failures
///
/// A tag mismatch is always surfaced: masking it would silently accept
/// tampered data.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid input: {0}")]
    Validation(&'static str),
    #[error("authentication tag mismatch")]
    TagMismatch,
    #[error("no key material for category {category} version {version}")]
    UnknownKeyVersion {
        category: FieldCategory,
        version: u32,
    },
    #[error("key rotation is an operational runbook, not an automated path")]
    NotImplemented,
}

struct CategoryKeys {
    keys: HashMap<u32, [u8; KEY_LEN]>,
    fingerprint_secret: Vec<u8>,
}

/// Crypto operation counters and latency
pub struct CryptoMetrics {
    ops: IntCounterVec,
    errors: IntCounterVec,
    latency: HistogramVec,
}

impl CryptoMetrics {
    fn new() -> Self {
        Self {
            ops: IntCounterVec::new(
                Opts::new("funnel_crypto_ops_total", "Crypto operations"),
                &["category", "direction"],
            )
            .expect("static metric definition"),
            errors: IntCounterVec::new(
                Opts::new("funnel_crypto_errors_total", "Crypto operation failures"),
                &["category", "direction"],
            )
            .expect("static metric definition"),
            latency: HistogramVec::new(
                HistogramOpts::new(
                    "funnel_crypto_op_seconds",
                    "Crypto operation latency",
                )
                .buckets(vec![1e-6, 1e-5, 1e-4, 1e-3, 1e-2]),
                &["direction"],
            )
            .expect("static metric definition"),
        }
    }

    /// Register every collector on `registry`
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.ops.clone()))?;
        registry.register(Box::new(self.errors.clone()))?;
        registry.register(Box::new(self.latency.clone()))?;
        Ok(())
    }
}

/// PII encryption and fingerprinting service
pub struct EncryptionService {
    active_version: u32,
    categories: HashMap<FieldCategory, CategoryKeys>,
    metrics: CryptoMetrics,
}

impl EncryptionService {
    /// Build from configuration; every category must carry key material
    /// for the active version and a fingerprint secret.
    pub fn from_config(config: &CryptoConfig) -> Result<Self, CryptoError> {
        let mut categories = HashMap::new();

        for category in [FieldCategory::Email, FieldCategory::Phone] {
            let field = config
                .fields
                .get(category.as_str())
                .ok_or(CryptoError::Validation("missing category key material"))?;

            let mut keys = HashMap::new();
            for (&version, hex_key) in &field.keys {
                let bytes = hex::decode(hex_key)
                    .map_err(|_| CryptoError::Validation("key material is not valid hex"))?;
                let key: [u8; KEY_LEN] = bytes
                    .try_into()
                    .map_err(|_| CryptoError::Validation("key material must be 256-bit"))?;
                keys.insert(version, key);
            }
            if !keys.contains_key(&config.active_version) {
                return Err(CryptoError::UnknownKeyVersion {
                    category,
                    version: config.active_version,
                });
            }

            let fingerprint_secret = hex::decode(&field.fingerprint_secret)
                .map_err(|_| CryptoError::Validation("fingerprint secret is not valid hex"))?;
            if fingerprint_secret.is_empty() {
                return Err(CryptoError::Validation("fingerprint secret is empty"));
            }

            categories.insert(
                category,
                CategoryKeys {
                    keys,
                    fingerprint_secret,
                },
            );
        }

        Ok(Self {
            active_version: config.active_version,
            categories,
            metrics: CryptoMetrics::new(),
        })
    }

    pub fn metrics(&self) -> &CryptoMetrics {
        &self.metrics
    }

    /// Key version used for new encryptions
    pub fn current_key_version(&self) -> u32 {
        self.active_version
    }

    /// Key rotation stays an operational runbook
    pub fn rotate_keys(&self) -> Result<(), CryptoError> {
        Err(CryptoError::NotImplemented)
    }

    /// Encrypt a plaintext field under the active key version
    ///
    /// Ciphertext is fresh on every call (random nonce); the fingerprint
    /// is deterministic for equality search.
    pub fn encrypt(
        &self,
        plaintext: &str,
        category: FieldCategory,
    ) -> Result<EncryptedField, CryptoError> {
        let started = Instant::now();
        let result = self.encrypt_inner(plaintext, category);
        self.observe(category, "encrypt", started, result.is_ok());
        result
    }

    fn encrypt_inner(
        &self,
        plaintext: &str,
        category: FieldCategory,
    ) -> Result<EncryptedField, CryptoError> {
        if plaintext.is_empty() {
            return Err(CryptoError::Validation("plaintext is empty"));
        }

        let version = self.active_version;
        let key = self.key_for(category, version)?;
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key));

        let mut nonce = [0u8; NONCE_LEN];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut nonce);

        let aad = Self::associated_data(category, version);
        let ciphertext = cipher
            .encrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Validation("encryption failed"))?;

        // nonce and tag lengths are fixed, so the blob needs no framing
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);

        Ok(EncryptedField {
            ciphertext: base64::engine::general_purpose::STANDARD.encode(&blob),
            fingerprint: self.fingerprint(plaintext, category)?,
            key_version: version,
        })
    }

    /// Decrypt a ciphertext blob produced by [`encrypt`](Self::encrypt)
    ///
    /// `key_version` defaults to the active version; a wrong version or
    /// category fails authentication.
    pub fn decrypt(
        &self,
        ciphertext: &str,
        category: FieldCategory,
        key_version: Option<u32>,
    ) -> Result<String, CryptoError> {
        let started = Instant::now();
        let result = self.decrypt_inner(ciphertext, category, key_version);
        self.observe(category, "decrypt", started, result.is_ok());
        result
    }

    fn decrypt_inner(
        &self,
        ciphertext: &str,
        category: FieldCategory,
        key_version: Option<u32>,
    ) -> Result<String, CryptoError> {
        let version = key_version.unwrap_or(self.active_version);
        let key = self.key_for(category, version)?;

        let blob = base64::engine::general_purpose::STANDARD
            .decode(ciphertext)
            .map_err(|_| CryptoError::Validation("ciphertext is not valid base64"))?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Validation("ciphertext too short"));
        }

        let (nonce, body) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
        let aad = Self::associated_data(category, version);

        let plaintext = cipher
            .decrypt(
                GenericArray::from_slice(nonce),
                Payload {
                    msg: body,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::TagMismatch)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Validation("plaintext is not utf-8"))
    }

    /// Deterministic keyed hash of the normalized plaintext (hex digest)
    pub fn fingerprint(
        &self,
        plaintext: &str,
        category: FieldCategory,
    ) -> Result<String, CryptoError> {
        let keys = self
            .categories
            .get(&category)
            .ok_or(CryptoError::Validation("missing category key material"))?;

        let normalized = category.normalize(plaintext);
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&keys.fingerprint_secret)
            .expect("HMAC accepts any key length");
        mac.update(normalized.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn key_for(&self, category: FieldCategory, version: u32) -> Result<&[u8; KEY_LEN], CryptoError> {
        self.categories
            .get(&category)
            .and_then(|c| c.keys.get(&version))
            .ok_or(CryptoError::UnknownKeyVersion { category, version })
    }

    fn associated_data(category: FieldCategory, version: u32) -> String {
        format!("{}:{}", category, version)
    }

    fn observe(&self, category: FieldCategory, direction: &str, started: Instant, ok: bool) {
        self.metrics
            .ops
            .with_label_values(&[category.as_str(), direction])
            .inc();
        if !ok {
            self.metrics
                .errors
                .with_label_values(&[category.as_str(), direction])
                .inc();
        }
        self.metrics
            .latency
            .with_label_values(&[direction])
            .observe(started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funnel_common::FieldKeyConfig;

    fn test_config(versions: &[u32], active: u32) -> CryptoConfig {
        let mut fields = HashMap::new();
        for (i, name) in ["email", "phone"].iter().enumerate() {
            let mut keys = HashMap::new();
            for &v in versions {
                // Distinct deterministic key per category and version.
                keys.insert(v, format!("{:02x}", (i as u8) * 16 + v as u8).repeat(32));
            }
            fields.insert(
                name.to_string(),
                FieldKeyConfig {
                    keys,
                    fingerprint_secret: format!("{:02x}", i as u8 + 0x40).repeat(32),
                },
            );
        }
        CryptoConfig {
            active_version: active,
            fields,
        }
    }

    fn service() -> EncryptionService {
        EncryptionService::from_config(&test_config(&[1], 1)).unwrap()
    }

    #[test]
    fn roundtrip_both_categories() {
        let svc = service();
        for (category, value) in [
            (FieldCategory::Email, "user@example.com"),
            (FieldCategory::Phone, "+1 (555) 123-4567"),
        ] {
            let field = svc.encrypt(value, category).unwrap();
            let plain = svc.decrypt(&field.ciphertext, category, Some(field.key_version)).unwrap();
            assert_eq!(plain, value);
        }
    }

    #[test]
    fn ciphertext_is_fresh_but_fingerprint_is_stable() {
        let svc = service();
        let a = svc.encrypt("user@example.com", FieldCategory::Email).unwrap();
        let b = svc.encrypt("user@example.com", FieldCategory::Email).unwrap();

        assert_ne!(a.ciphertext, b.ciphertext);
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn flipping_any_byte_fails_authentication() {
        let svc = service();
        let field = svc.encrypt("user@example.com", FieldCategory::Email).unwrap();
        let blob = base64::engine::general_purpose::STANDARD
            .decode(&field.ciphertext)
            .unwrap();

        for index in [0, blob.len() / 2, blob.len() - 1] {
            let mut tampered = blob.clone();
            tampered[index] ^= 0x01;
            let tampered_b64 = base64::engine::general_purpose::STANDARD.encode(&tampered);
            assert!(matches!(
                svc.decrypt(&tampered_b64, FieldCategory::Email, None),
                Err(CryptoError::TagMismatch)
            ));
        }
    }

    #[test]
    fn category_is_bound_into_the_ciphertext() {
        let svc = service();
        let field = svc.encrypt("5551234567", FieldCategory::Phone).unwrap();
        assert!(matches!(
            svc.decrypt(&field.ciphertext, FieldCategory::Email, None),
            Err(CryptoError::TagMismatch | CryptoError::UnknownKeyVersion { .. })
        ));
    }

    #[test]
    fn key_version_mismatch_fails_both_ways() {
        let svc = EncryptionService::from_config(&test_config(&[1, 2], 1)).unwrap();
        let v1 = svc.encrypt("user@example.com", FieldCategory::Email).unwrap();
        assert_eq!(v1.key_version, 1);
        assert!(matches!(
            svc.decrypt(&v1.ciphertext, FieldCategory::Email, Some(2)),
            Err(CryptoError::TagMismatch)
        ));

        let svc2 = EncryptionService::from_config(&test_config(&[1, 2], 2)).unwrap();
        let v2 = svc2.encrypt("user@example.com", FieldCategory::Email).unwrap();
        assert!(matches!(
            svc2.decrypt(&v2.ciphertext, FieldCategory::Email, Some(1)),
            Err(CryptoError::TagMismatch)
        ));
    }

    #[test]
    fn email_fingerprint_is_case_and_whitespace_insensitive() {
        let svc = service();
        assert_eq!(
            svc.fingerprint("Test@Example.com", FieldCategory::Email).unwrap(),
            svc.fingerprint(" test@example.com ", FieldCategory::Email).unwrap()
        );
    }

    #[test]
    fn phone_fingerprint_ignores_formatting() {
        let svc = service();
        assert_eq!(
            svc.fingerprint("(555) 123-4567", FieldCategory::Phone).unwrap(),
            svc.fingerprint("555.123.4567", FieldCategory::Phone).unwrap()
        );
    }

    #[test]
    fn fingerprints_do_not_correlate_across_categories() {
        let svc = service();
        assert_ne!(
            svc.fingerprint("5551234567", FieldCategory::Phone).unwrap(),
            svc.fingerprint("5551234567", FieldCategory::Email).unwrap()
        );
    }

    #[test]
    fn malformed_input_is_a_validation_error() {
        let svc = service();
        assert!(matches!(
            svc.decrypt("not base64 ***", FieldCategory::Email, None),
            Err(CryptoError::Validation(_))
        ));
        assert!(matches!(
            svc.decrypt("AAAA", FieldCategory::Email, None),
            Err(CryptoError::Validation(_))
        ));
        assert!(matches!(
            svc.encrypt("", FieldCategory::Email),
            Err(CryptoError::Validation(_))
        ));
    }

    #[test]
    fn unknown_key_version_is_distinguished() {
        let svc = service();
        let field = svc.encrypt("user@example.com", FieldCategory::Email).unwrap();
        assert!(matches!(
            svc.decrypt(&field.ciphertext, FieldCategory::Email, Some(9)),
            Err(CryptoError::UnknownKeyVersion { version: 9, .. })
        ));
    }

    #[test]
    fn rotation_is_not_automated() {
        assert!(matches!(service().rotate_keys(), Err(CryptoError::NotImplemented)));
    }

    #[test]
    fn errors_never_carry_plaintext() {
        let svc = service();
        let err = svc.encrypt("", FieldCategory::Email).unwrap_err();
        let rendered = format!("{err} {err:?}");
        assert!(!rendered.contains("example.com"));
    }
}
