//! Certificate generation/storage and verification-key derivation.
//!
//! Certificates are RSA 2048, self-signed, `O=KDE`, `OU=Kde connect`,
//! CN = device id, with a configurable validity period. This module also
//! exposes the raw SubjectPublicKeyInfo bytes needed to derive the
//! human-verifiable pairing string.

use crate::error::Result;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509, X509Name};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

const CERT_ORG: &str = "KDE";
const CERT_ORG_UNIT: &str = "Kde connect";

/// A device's self-signed identity certificate and private key.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub device_id: String,
    /// DER-encoded certificate.
    pub certificate: Vec<u8>,
    /// DER-encoded private key.
    pub private_key: Vec<u8>,
    /// Colon-separated uppercase-hex SHA-256 fingerprint.
    pub fingerprint: String,
}

impl CertificateInfo {
    /// Generate a new self-signed certificate with `device_id` as the
    /// subject common name.
    pub fn generate(device_id: impl Into<String>, validity_years: i64) -> Result<Self> {
        let device_id = device_id.into();

        let rsa = Rsa::generate(2048)?;
        let pkey = PKey::from_rsa(rsa)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        builder.set_serial_number(&serial.to_asn1_integer()?)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_text("O", CERT_ORG)?;
        name.append_entry_by_text("OU", CERT_ORG_UNIT)?;
        name.append_entry_by_text("CN", &device_id)?;
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        builder.set_not_before(&Asn1Time::days_from_now(0)?)?;
        builder.set_not_after(&Asn1Time::days_from_now((validity_years * 365) as u32)?)?;
        builder.set_pubkey(&pkey)?;

        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_encipherment()
                .key_agreement()
                .build()?,
        )?;

        builder.sign(&pkey, MessageDigest::sha256())?;
        let cert = builder.build();

        let certificate = cert.to_der()?;
        let private_key = pkey.private_key_to_der()?;
        let fingerprint = Self::calculate_fingerprint(&certificate);

        Ok(Self {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// Colon-separated uppercase hex SHA-256 of the DER certificate.
    pub fn calculate_fingerprint(cert_der: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(cert_der);
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// The certificate's SubjectPublicKeyInfo, DER-encoded — the bytes used
    /// directly by the verification key derivation.
    pub fn subject_public_key_info(&self) -> Result<Vec<u8>> {
        let cert = X509::from_der(&self.certificate)?;
        Ok(cert.public_key()?.public_key_to_der()?)
    }

    pub fn save_to_files(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let cert = X509::from_der(&self.certificate)?;
        fs::write(cert_path, cert.to_pem()?)?;

        let pkey = PKey::private_key_from_der(&self.private_key)?;
        fs::write(key_path, pkey.private_key_to_pem_pkcs8()?)?;
        Ok(())
    }

    pub fn load_from_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = fs::read(cert_path.as_ref())?;
        let cert = X509::from_pem(&cert_pem)?;
        let certificate = cert.to_der()?;

        let key_pem = fs::read(key_path.as_ref())?;
        let pkey = PKey::private_key_from_pem(&key_pem)?;
        let private_key = pkey.private_key_to_der()?;

        let device_id = Self::extract_device_id(&cert)?;
        let fingerprint = Self::calculate_fingerprint(&certificate);

        Ok(Self {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// Load from a DER-encoded peer certificate received over the wire
    /// (no private key, since we never hold the peer's).
    pub fn from_peer_der(cert_der: &[u8]) -> Result<(String, String)> {
        let cert = X509::from_der(cert_der)?;
        let device_id = Self::extract_device_id(&cert)?;
        let fingerprint = Self::calculate_fingerprint(cert_der);
        Ok((device_id, fingerprint))
    }

    fn extract_device_id(cert: &X509) -> Result<String> {
        for entry in cert.subject_name().entries() {
            if entry.object().nid() == openssl::nid::Nid::COMMONNAME {
                return Ok(entry.data().as_utf8()?.to_string());
            }
        }
        Err(crate::error::ProtocolError::InvalidField(
            "certificate has no common name".to_string(),
        ))
    }
}

/// Convert a DER-encoded certificate to PEM, for writing the peer
/// certificate file that marks a device as paired.
pub fn der_to_pem(der: &[u8]) -> Result<Vec<u8>> {
    Ok(X509::from_der(der)?.to_pem()?)
}

/// The inverse of [`der_to_pem`], used when loading a previously persisted
/// peer certificate back off disk.
pub fn pem_to_der(pem: &[u8]) -> Result<Vec<u8>> {
    Ok(X509::from_pem(pem)?.to_der()?)
}

/// Derive the 8-hex-digit verification key from two SubjectPublicKeyInfo
/// byte strings and, for protocol v8, the pairing timestamp.
///
/// Symmetric by construction: callers on either side of the handshake pass
/// their own key as `a` and the peer's as `b` (or vice versa) and get the
/// same result, since the two are sorted before concatenation.
pub fn derive_verification_key(a: &[u8], b: &[u8], pairing_timestamp_v8: Option<i64>) -> String {
    let (first, second) = if a >= b { (a, b) } else { (b, a) };

    let mut hasher = Sha256::new();
    hasher.update(first);
    hasher.update(second);
    if let Some(ts) = pairing_timestamp_v8 {
        hasher.update(ts.to_string().as_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..4]).to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generate_produces_usable_certificate() {
        let cert = CertificateInfo::generate("test-device-id-0000000000000000", 10).unwrap();
        assert!(!cert.certificate.is_empty());
        assert!(!cert.private_key.is_empty());
        assert_eq!(cert.fingerprint.split(':').count(), 32);
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");

        let original = CertificateInfo::generate("roundtrip-device-0000000000000", 10).unwrap();
        original.save_to_files(&cert_path, &key_path).unwrap();

        let loaded = CertificateInfo::load_from_files(&cert_path, &key_path).unwrap();
        assert_eq!(original.fingerprint, loaded.fingerprint);
        assert_eq!(original.device_id, loaded.device_id);
    }

    #[test]
    fn verification_key_is_order_independent() {
        let a = CertificateInfo::generate("device-a-000000000000000000000", 10).unwrap();
        let b = CertificateInfo::generate("device-b-000000000000000000000", 10).unwrap();
        let spki_a = a.subject_public_key_info().unwrap();
        let spki_b = b.subject_public_key_info().unwrap();

        let k1 = derive_verification_key(&spki_a, &spki_b, Some(1000));
        let k2 = derive_verification_key(&spki_b, &spki_a, Some(1000));
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 8);
        assert!(k1.chars().all(|c| c.is_ascii_hexdigit() && (c.is_ascii_digit() || c.is_uppercase())));
    }

    #[test]
    fn verification_key_changes_with_timestamp() {
        let a = CertificateInfo::generate("device-c-000000000000000000000", 10).unwrap();
        let b = CertificateInfo::generate("device-d-000000000000000000000", 10).unwrap();
        let spki_a = a.subject_public_key_info().unwrap();
        let spki_b = b.subject_public_key_info().unwrap();

        let k1 = derive_verification_key(&spki_a, &spki_b, Some(1000));
        let k2 = derive_verification_key(&spki_a, &spki_b, Some(2000));
        assert_ne!(k1, k2);
    }
}
