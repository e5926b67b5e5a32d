use crate::state::CertMeta;
use anyhow::{Context, Result};
use rsa::pkcs8::EncodePrivateKey;
use time::{Duration, OffsetDateTime};
use tracing::info;

/// Organization on generated certificates. Renewal logic uses this string
/// to tell a generated placeholder apart from an imported or CA-issued
/// certificate.
pub const SELF_SIGNED_ORG: &str = "statiko self-signed";

/// Generated certificates stay valid this long.
const VALIDITY: Duration = Duration::days(5 * 365);

/// Certificates whose remaining validity is below this fail validation.
const MIN_REMAINING: time::Duration = time::Duration::hours(12);

/// Generate a 4096-bit RSA self-signed certificate for the given domains.
/// The first domain becomes the common name; all of them land in the SAN
/// list. Returns (key_pem, cert_pem).
pub fn generate(domains: &[String]) -> Result<(String, String)> {
    anyhow::ensure!(!domains.is_empty(), "cannot issue a certificate for zero domains");

    let rsa_key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 4096)
        .context("generating RSA key")?;
    let pkcs8 = rsa_key.to_pkcs8_der().context("encoding RSA key")?;
    let key_pair = rcgen::KeyPair::try_from(pkcs8.as_bytes()).context("loading RSA key pair")?;

    let mut sorted = domains.to_vec();
    sorted.sort();

    let mut params =
        rcgen::CertificateParams::new(sorted.clone()).context("building certificate params")?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, domains[0].clone());
    params
        .distinguished_name
        .push(rcgen::DnType::OrganizationName, SELF_SIGNED_ORG);
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = OffsetDateTime::now_utc() + VALIDITY;

    let cert = params
        .self_signed(&key_pair)
        .context("signing certificate")?;

    info!(
        "certs: self-signed generated, cn={}, domains={}",
        domains[0],
        sorted.join(",")
    );
    Ok((key_pair.serialize_pem(), cert.pem()))
}

/// Parsed facts about a PEM certificate.
pub struct ParsedCert {
    pub meta: CertMeta,
    pub organization: Option<String>,
}

pub fn parse(cert_pem: &[u8]) -> Result<ParsedCert> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem)
        .map_err(|e| anyhow::anyhow!("invalid PEM: {}", e))?;
    let cert = pem.parse_x509().context("parsing x509")?;

    let mut dns_names: Vec<String> = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let x509_parser::extensions::GeneralName::DNSName(d) = name {
                dns_names.push(d.to_string());
            }
        }
    }
    dns_names.sort();

    let organization = cert
        .subject()
        .iter_organization()
        .next()
        .and_then(|o| o.as_str().ok())
        .map(String::from);

    Ok(ParsedCert {
        meta: CertMeta {
            dns_names,
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
        },
        organization,
    })
}

/// Why a stored certificate can no longer be served.
#[derive(Debug, PartialEq, Eq)]
pub enum ValidationFailure {
    Expiring,
    NotYetValid,
    DomainMismatch,
    Unparseable,
}

/// Check a generated/issued certificate against the domains it should
/// cover. Imported certificates are exempt from the domain check (they may
/// be wildcards); pass `None` for them.
pub fn validate(cert_pem: &[u8], domains: Option<&[String]>) -> Result<(), ValidationFailure> {
    let parsed = parse(cert_pem).map_err(|_| ValidationFailure::Unparseable)?;
    let now = OffsetDateTime::now_utc().unix_timestamp();

    if parsed.meta.not_after < now + MIN_REMAINING.whole_seconds() {
        return Err(ValidationFailure::Expiring);
    }
    if parsed.meta.not_before > now {
        return Err(ValidationFailure::NotYetValid);
    }
    if let Some(domains) = domains {
        let mut expected = domains.to_vec();
        expected.sort();
        if parsed.meta.dns_names != expected {
            return Err(ValidationFailure::DomainMismatch);
        }
    }
    Ok(())
}

/// True when the certificate was produced by `generate` (as opposed to a
/// CA-issued or imported one).
pub fn is_generated(cert_pem: &[u8]) -> bool {
    parse(cert_pem)
        .ok()
        .and_then(|p| p.organization)
        .is_some_and(|org| org == SELF_SIGNED_ORG)
}
