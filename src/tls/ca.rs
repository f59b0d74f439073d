//! Certificate Authority store
//!
//! Holds the operator's CA certificate and key, plus the single leaf key pair
//! shared by every certificate minted during the process lifetime. Nothing in
//! here changes after construction.

use aws_lc_rs::signature::{
    EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING, ECDSA_P384_SHA384_ASN1_SIGNING,
};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::io::BufReader;
use std::path::Path;

use crate::error::{Error, Result};

/// A freshly generated CA certificate and key pair
pub struct GeneratedCa {
    /// PEM-encoded certificate
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
}

impl GeneratedCa {
    /// Generate a new self-signed CA certificate valid for ten years
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "Semiproxy Interception CA");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "Semiproxy");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + time::Duration::days(3650);

        let key_pair = KeyPair::generate().map_err(|e| Error::certificate(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::certificate(e.to_string()))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Save the certificate and key to files
    pub fn save(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(cert_path.as_ref(), &self.cert_pem).map_err(|e| {
            Error::certificate(format!(
                "Failed to write certificate to '{}': {}",
                cert_path.as_ref().display(),
                e
            ))
        })?;

        std::fs::write(key_path.as_ref(), &self.key_pem).map_err(|e| {
            Error::certificate(format!(
                "Failed to write key to '{}': {}",
                key_path.as_ref().display(),
                e
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(key_path.as_ref())?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(key_path.as_ref(), perms)?;
        }

        Ok(())
    }
}

/// Loaded CA material plus the shared leaf key pair
pub struct CertificateAuthority {
    /// CA certificate as loaded, handed out as the trust anchor
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    /// CA certificate rebuilt from the loaded PEM, used as the signing issuer
    issuer: rcgen::Certificate,
    key_pair: KeyPair,
    leaf_key: KeyPair,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_der_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load a CA from PEM-encoded certificate and key and generate the
    /// shared leaf key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair = parse_ca_key(key_pem)?;
        let leaf_key = generate_leaf_key()?;
        Self::assemble(cert_pem, key_pair, leaf_key)
    }

    /// Load a CA from files, synchronously
    pub fn from_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = read_pem(cert_path.as_ref(), "CA certificate")?;
        let key_pem = read_pem(key_path.as_ref(), "CA key")?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Load CA certificate, then CA key, then generate the leaf key.
    ///
    /// Each step only runs once the previous one succeeded. Key generation
    /// runs on the blocking pool.
    pub async fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        let cert_pem = tokio::fs::read_to_string(cert_path).await.map_err(|e| {
            Error::certificate(format!(
                "Failed to read CA certificate '{}': {}",
                cert_path.display(),
                e
            ))
        })?;
        tracing::debug!(path = %cert_path.display(), "Loaded CA certificate");

        let key_pem = tokio::fs::read_to_string(key_path).await.map_err(|e| {
            Error::certificate(format!(
                "Failed to read CA key '{}': {}",
                key_path.display(),
                e
            ))
        })?;
        let key_pair = parse_ca_key(&key_pem)?;
        tracing::debug!(path = %key_path.display(), "Loaded CA key");

        let leaf_key = tokio::task::spawn_blocking(generate_leaf_key)
            .await
            .map_err(|e| Error::certificate(format!("Leaf key generation task failed: {}", e)))??;
        tracing::debug!("Generated shared leaf key");

        Self::assemble(&cert_pem, key_pair, leaf_key)
    }

    fn assemble(cert_pem: &str, key_pair: KeyPair, leaf_key: KeyPair) -> Result<Self> {
        let mut cert_reader = BufReader::new(cert_pem.as_bytes());
        let cert_der = rustls_pemfile::certs(&mut cert_reader)
            .filter_map(|r| r.ok())
            .next()
            .ok_or_else(|| Error::certificate("No certificate found in PEM"))?;

        let issuer = CertificateParams::from_ca_cert_pem(cert_pem)
            .and_then(|params| params.self_signed(&key_pair))
            .map_err(|e| Error::certificate(format!("Failed to parse CA certificate: {}", e)))?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            cert_der,
            issuer,
            key_pair,
            leaf_key,
        })
    }

    /// The CA certificate in PEM form, as it was loaded
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// The CA certificate in DER form
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// The leaf key shared by every minted certificate
    pub fn leaf_key(&self) -> &KeyPair {
        &self.leaf_key
    }

    /// The shared leaf key as PKCS#8 DER, for TLS server configs
    pub fn leaf_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.leaf_key.serialize_der()))
    }

    /// The shared leaf key as PEM
    pub fn leaf_key_pem(&self) -> String {
        self.leaf_key.serialize_pem()
    }

    pub(crate) fn issuer(&self) -> &rcgen::Certificate {
        &self.issuer
    }

    pub(crate) fn issuer_key(&self) -> &KeyPair {
        &self.key_pair
    }
}

fn read_pem(path: &Path, what: &str) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        Error::certificate(format!(
            "Failed to read {} '{}': {}",
            what,
            path.display(),
            e
        ))
    })
}

/// Parse the CA key from PKCS#8, PKCS#1 (`RSA PRIVATE KEY`) or SEC1
/// (`EC PRIVATE KEY`) PEM
fn parse_ca_key(key_pem: &str) -> Result<KeyPair> {
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))
        .map_err(|e| Error::certificate(format!("Failed to read CA private key: {}", e)))?
        .ok_or_else(|| Error::certificate("No private key found in CA key PEM"))?;

    let key_pair = match &key {
        PrivateKeyDer::Pkcs8(pkcs8) => KeyPair::try_from(pkcs8.secret_pkcs8_der()),
        PrivateKeyDer::Pkcs1(pkcs1) => {
            let pkcs8 = pkcs1_to_pkcs8(pkcs1.secret_pkcs1_der());
            KeyPair::try_from(pkcs8.as_slice())
        }
        PrivateKeyDer::Sec1(sec1) => {
            let pkcs8 = sec1_to_pkcs8(sec1.secret_sec1_der())?;
            KeyPair::try_from(pkcs8.as_slice())
        }
        _ => return Err(Error::certificate("Unsupported CA private key format")),
    };
    key_pair.map_err(|e| Error::certificate(format!("Failed to parse CA private key: {}", e)))
}

/// Re-encode a SEC1 EC key on P-256 or P-384 as PKCS#8
fn sec1_to_pkcs8(sec1: &[u8]) -> Result<Vec<u8>> {
    let key_pair = [&ECDSA_P256_SHA256_ASN1_SIGNING, &ECDSA_P384_SHA384_ASN1_SIGNING]
        .into_iter()
        .find_map(|alg| EcdsaKeyPair::from_private_key_der(alg, sec1).ok())
        .ok_or_else(|| Error::certificate("CA EC key must be on P-256 or P-384"))?;

    key_pair
        .to_pkcs8v1()
        .map(|doc| doc.as_ref().to_vec())
        .map_err(|_| Error::certificate("Failed to re-encode CA EC key as PKCS#8"))
}

/// `rsaEncryption` AlgorithmIdentifier: OID 1.2.840.113549.1.1.1 with NULL parameters
const RSA_ALGORITHM_ID: &[u8] = &[
    0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x05, 0x00,
];

/// Wrap a PKCS#1 RSAPrivateKey in a PKCS#8 PrivateKeyInfo
fn pkcs1_to_pkcs8(pkcs1: &[u8]) -> Vec<u8> {
    let mut body = vec![0x02, 0x01, 0x00];
    body.extend_from_slice(RSA_ALGORITHM_ID);
    body.push(0x04);
    push_der_len(&mut body, pkcs1.len());
    body.extend_from_slice(pkcs1);

    let mut out = vec![0x30];
    push_der_len(&mut out, body.len());
    out.extend_from_slice(&body);
    out
}

fn push_der_len(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

fn generate_leaf_key() -> Result<KeyPair> {
    KeyPair::generate().map_err(|e| Error::certificate(format!("Failed to generate leaf key: {}", e)))
}
