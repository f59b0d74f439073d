//! Leaf certificate minting
//!
//! Builds a CSR for the domain with the shared leaf key, then signs it with
//! the CA. Stateless apart from the CA store it borrows.

use rand::Rng;
use rcgen::{
    CertificateParams, CertificateSigningRequestParams, DnType, ExtendedKeyUsagePurpose,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::CertificateDer;

use super::ca::CertificateAuthority;
use crate::error::{Error, Result};

/// Validity window of every minted certificate
pub const LEAF_VALIDITY_DAYS: i64 = 100;

/// Placeholder subject country
const LEAF_COUNTRY: &str = "XX";

/// Serial numbers are drawn from `1..SERIAL_BOUND`. Collisions are possible
/// and tolerated.
const SERIAL_BOUND: u64 = 1_000_000;

/// A CA-signed certificate for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafCertificate {
    domain: String,
    pem: String,
    der: CertificateDer<'static>,
}

impl LeafCertificate {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }
}

/// Mint a certificate for `domain` signed by `ca`, carrying the shared leaf key
pub fn mint_certificate(ca: &CertificateAuthority, domain: &str) -> Result<LeafCertificate> {
    let csr_pem = build_csr(ca, domain)?;

    let mut request = CertificateSigningRequestParams::from_pem(&csr_pem)
        .map_err(|e| Error::generation(format!("Failed to parse CSR for '{}': {}", domain, e)))?;

    let serial = rand::thread_rng().gen_range(1..SERIAL_BOUND);
    request.params.serial_number = Some(SerialNumber::from(serial));
    request.params.not_before = time::OffsetDateTime::now_utc();
    request.params.not_after =
        request.params.not_before + time::Duration::days(LEAF_VALIDITY_DAYS);
    request.params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    request.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = request
        .signed_by(ca.issuer(), ca.issuer_key())
        .map_err(|e| Error::generation(format!("Failed to sign certificate for '{}': {}", domain, e)))?;

    tracing::debug!(domain = %domain, serial, "Signed leaf certificate");

    Ok(LeafCertificate {
        domain: domain.to_string(),
        pem: cert.pem(),
        der: CertificateDer::from(cert.der().to_vec()),
    })
}

/// Certificate signing request for `domain`, signed with the shared leaf key
fn build_csr(ca: &CertificateAuthority, domain: &str) -> Result<String> {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CountryName, LEAF_COUNTRY);
    params.distinguished_name.push(DnType::CommonName, domain);
    params.subject_alt_names = vec![SanType::DnsName(domain.try_into().map_err(|e| {
        Error::generation(format!("Invalid domain '{}': {}", domain, e))
    })?)];

    params
        .serialize_request(ca.leaf_key())
        .and_then(|csr| csr.pem())
        .map_err(|e| Error::generation(format!("Failed to build CSR for '{}': {}", domain, e)))
}
