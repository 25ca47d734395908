use crate::acme::object::Identifier;
use crate::crypto::sha256;
use anyhow::{Context, bail};
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use time::macros::format_description;
use tracing::warn;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::num_bigint::BigUint;
use x509_parser::prelude::FromDer;

/// Upper bound on how many certificates we accept in one downloaded chain.
pub const MAX_CERTIFICATE_CHAIN_LENGTH: usize = 10;

/// The fields of an X.509 certificate this engine cares about, together with
/// the raw DER they were parsed from.
#[derive(Debug)]
pub struct ParsedX509Certificate {
    pub serial: BigUint,
    pub subject: String,
    pub issuer: String,
    pub not_before: time::OffsetDateTime,
    pub not_after: time::OffsetDateTime,
    pub subject_alternative_names: Vec<Identifier>,
    pub der: Vec<u8>,
}

impl ParsedX509Certificate {
    pub fn from_der(der: &[u8]) -> anyhow::Result<Self> {
        let (_, cert) = x509_parser::certificate::X509Certificate::from_der(der)
            .context("Decoding X509 DER structure failed")?;
        let mut subject_alternative_names = Vec::new();
        for extension in cert.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = extension.parsed_extension() {
                for general_name in &san.general_names {
                    match general_name {
                        GeneralName::DNSName(dns_name) => {
                            subject_alternative_names.push(Identifier::Dns {
                                value: (*dns_name).to_string(),
                            });
                        }
                        unsupported => {
                            warn!("Ignoring unsupported general name {unsupported} in certificate");
                        }
                    }
                }
            }
        }
        Ok(Self {
            serial: cert.serial.clone(),
            subject: cert.subject.to_string(),
            issuer: cert.issuer.to_string(),
            not_before: cert.validity.not_before.to_datetime(),
            not_after: cert.validity.not_after.to_datetime(),
            subject_alternative_names,
            der: der.to_vec(),
        })
    }

    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }

    /// Whether this certificate covers the given ASCII domain name, either via
    /// its subject CN or a SAN entry.
    pub fn covers(&self, ascii_domain: &str) -> bool {
        self.subject_alternative_names
            .iter()
            .any(|san| san.as_str() == ascii_domain)
            || self.subject.contains(ascii_domain)
    }

    /// Stable identifier for the issued certificate: the expiry date plus a
    /// short fingerprint, `YYYYMMDD_<8 hex>`.
    pub fn certificate_id(&self) -> String {
        let date_format = format_description!("[year][month][day]");
        let date = self
            .not_after
            .format(&date_format)
            .unwrap_or_else(|_| "00000000".to_string());
        let fingerprint = sha256(&self.der);
        let short: String = fingerprint
            .iter()
            .take(4)
            .map(|byte| format!("{byte:02x}"))
            .collect();
        format!("{date}_{short}")
    }
}

/// Splits a PEM chain into the DER encodings of its certificates, in order.
/// The leaf is expected first, per RFC 8555 Section 9.1.
pub fn split_pem_chain(pem_bytes: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
    let blocks = pem::parse_many(pem_bytes).context("Reading PEM blocks failed")?;
    let ders: Vec<Vec<u8>> = blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .take(MAX_CERTIFICATE_CHAIN_LENGTH)
        .map(|block| block.contents().to_vec())
        .collect();
    if ders.is_empty() {
        bail!("Downloaded chain does not contain any certificate");
    }
    Ok(ders)
}

/// Builds and signs a PKCS#10 CSR. The common name is the primary (first)
/// domain; all identifiers become subject alternative names. Returns DER.
pub fn create_and_sign_csr(
    cert_key: &rcgen::KeyPair,
    ascii_identifiers: &[String],
) -> anyhow::Result<Vec<u8>> {
    let Some(primary) = ascii_identifiers.first() else {
        bail!("Cannot build a CSR without identifiers");
    };
    let mut cert_params = rcgen::CertificateParams::new(ascii_identifiers.to_vec())
        .context("CSR generation failed")?;
    let mut distinguished_name = rcgen::DistinguishedName::new();
    distinguished_name.push(rcgen::DnType::CommonName, primary);
    cert_params.distinguished_name = distinguished_name;
    let csr = cert_params
        .serialize_request(cert_key)
        .context("Signing CSR failed")?;
    Ok(csr.der().to_vec())
}

/// Decodes a caller-supplied CSR: PEM framing is stripped if present, otherwise
/// the input is treated as bare base64.
pub fn decode_custom_csr(input: &str) -> anyhow::Result<Vec<u8>> {
    if input.contains("-----") {
        let block = pem::parse(input).context("Reading CSR PEM failed")?;
        return Ok(block.contents().to_vec());
    }
    let compact: String = input.split_whitespace().collect();
    BASE64_STANDARD
        .decode(compact)
        .context("CSR is neither PEM nor valid base64")
}
