use crate::cert::{
    ParsedX509Certificate, create_and_sign_csr, decode_custom_csr, split_pem_chain,
};
use crate::crypto::asymmetric::{Curve, KeyPair, KeyType, new_key};
use crate::crypto::sha256;
use crate::dns::name::DnsName;
use crate::trust::IssuerCache;
use anyhow::{Context, anyhow};
use aws_lc_rs::rsa::KeySize;
use p12_keystore::{Certificate as StoredCertificate, KeyStore, KeyStoreEntry, PrivateKeyChain};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use time::macros::format_description;
use tracing::{debug, info, warn};

/// Certificate key algorithms callers can request. The JWA-style names mirror
/// what the configuration surface accepts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CsrKeyAlg {
    #[default]
    Rs256,
    Es256,
    Es384,
    Es512,
}

impl CsrKeyAlg {
    pub fn key_type(self) -> KeyType {
        match self {
            CsrKeyAlg::Rs256 => KeyType::Rsa(KeySize::Rsa2048),
            CsrKeyAlg::Es256 => KeyType::Ecdsa(Curve::P256),
            CsrKeyAlg::Es384 => KeyType::Ecdsa(Curve::P384),
            CsrKeyAlg::Es512 => KeyType::Ecdsa(Curve::P521),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CsrKeyAlg::Rs256 => "RS256",
            CsrKeyAlg::Es256 => "ES256",
            CsrKeyAlg::Es384 => "ES384",
            CsrKeyAlg::Es512 => "ES512",
        }
    }
}

impl Display for CsrKeyAlg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CsrKeyAlg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RS256" => Ok(CsrKeyAlg::Rs256),
            "ES256" => Ok(CsrKeyAlg::Es256),
            "ES384" => Ok(CsrKeyAlg::Es384),
            "ES512" => Ok(CsrKeyAlg::Es512),
            other => Err(anyhow!("Unknown certificate key algorithm {other}")),
        }
    }
}

/// Key and CSR for one finalization. The key is absent when the caller brought
/// their own CSR (the matching key never passes through the engine then).
pub struct CsrMaterial {
    pub key: Option<KeyPair>,
    pub csr_der: Vec<u8>,
}

/// Produces the CSR to submit at finalization: a caller-supplied CSR wins,
/// otherwise a key is loaded or generated and a fresh CSR is signed with it.
pub fn prepare_csr_material(
    ascii_identifiers: &[String],
    alg: CsrKeyAlg,
    custom_csr_pem: Option<&str>,
    custom_private_key_pem: Option<&str>,
) -> anyhow::Result<CsrMaterial> {
    if let Some(custom_csr) = custom_csr_pem {
        debug!("Using caller-supplied CSR");
        return Ok(CsrMaterial {
            key: None,
            csr_der: decode_custom_csr(custom_csr)?,
        });
    }
    let key = match custom_private_key_pem {
        Some(pem) => {
            debug!("Using caller-supplied private key for the certificate");
            KeyPair::from_pem(pem).context("Loading caller-supplied private key")?
        }
        None => {
            debug!("Generating {alg} certificate key");
            new_key(alg.key_type())?
        }
    };
    let rcgen_key = key.to_rcgen_keypair()?;
    let csr_der = create_and_sign_csr(&rcgen_key, ascii_identifiers)?;
    Ok(CsrMaterial {
        key: Some(key),
        csr_der,
    })
}

/// The output deliverable of a successful order.
#[derive(Debug)]
pub struct CertificateArtifact {
    pub certificate_id: String,
    pub friendly_name: String,
    pub pfx_path: PathBuf,
    pub pkcs12: Vec<u8>,
    pub leaf: ParsedX509Certificate,
    pub chain_der: Vec<Vec<u8>>,
}

/// Packages a downloaded chain and its private key into a password-protected
/// PKCS#12, completing missing issuers from the [`IssuerCache`].
pub struct CertificateAssembler {
    assets_dir: PathBuf,
    issuer_cache: Arc<IssuerCache>,
}

impl CertificateAssembler {
    pub fn new(assets_dir: PathBuf, issuer_cache: Arc<IssuerCache>) -> Self {
        Self {
            assets_dir,
            issuer_cache,
        }
    }

    /// Assembles and persists the PKCS#12 artifact. The output path is
    /// deterministic: `<assets>/<primary, '*' -> '_'>/<certId>.pfx`.
    pub fn assemble(
        &self,
        primary: &DnsName,
        chain_pem: &[u8],
        private_key: &KeyPair,
        password: &str,
    ) -> anyhow::Result<CertificateArtifact> {
        let ders = split_pem_chain(chain_pem)?;
        let leaf = ParsedX509Certificate::from_der(&ders[0])?;
        if !leaf.covers(primary.as_ascii()) {
            warn!(
                "Downloaded leaf certificate (subject {}) does not obviously cover {}",
                leaf.subject,
                primary.as_ascii()
            );
        }
        let certificate_id = leaf.certificate_id();
        let friendly_name = friendly_name(primary, &leaf);
        let key_der = private_key
            .to_pkcs8_der()
            .map_err(|e| anyhow!("Serializing certificate key failed: {e}"))?;

        let chain_der = self.complete_chain(ders);
        let pkcs12 = match build_pkcs12(&friendly_name, &key_der, &chain_der, password) {
            Ok(pkcs12) => pkcs12,
            Err(first_failure) => {
                // One retry after refreshing the issuer cache; stale cached
                // issuers are the most common cause of packaging failures
                warn!("PKCS#12 assembly failed ({first_failure:#}), refreshing issuer cache");
                self.issuer_cache.refresh();
                let chain_der = self.complete_chain(split_pem_chain(chain_pem)?);
                build_pkcs12(&friendly_name, &key_der, &chain_der, password).context(
                    "Building the PKCS#12 failed twice. Check that the system clock is correct \
                     and that the host trust store contains the issuing CA",
                )?
            }
        };

        let directory = self
            .assets_dir
            .join(primary.as_ascii().replace('*', "_"));
        std::fs::create_dir_all(&directory)
            .context(format!("Creating output directory {}", directory.display()))?;
        let pfx_path = directory.join(format!("{certificate_id}.pfx"));
        std::fs::write(&pfx_path, &pkcs12)
            .context(format!("Writing PKCS#12 to {}", pfx_path.display()))?;
        info!("Stored certificate bundle at {}", pfx_path.display());

        Ok(CertificateArtifact {
            certificate_id,
            friendly_name,
            pfx_path,
            pkcs12,
            leaf,
            chain_der,
        })
    }

    /// Appends cached issuers for any intermediates the server omitted. Never
    /// fails; an incomplete chain is packaged as-is.
    fn complete_chain(&self, mut chain: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        loop {
            let Some(last) = chain.last() else {
                return chain;
            };
            let Ok(parsed) = ParsedX509Certificate::from_der(last) else {
                return chain;
            };
            if parsed.is_self_issued() {
                return chain;
            }
            match self.issuer_cache.find_issuer(&parsed.issuer) {
                Some(issuer_der) if !chain.contains(&issuer_der) => {
                    debug!("Completing chain with cached issuer {}", parsed.issuer);
                    chain.push(issuer_der);
                }
                _ => return chain,
            }
        }
    }
}

fn friendly_name(primary: &DnsName, leaf: &ParsedX509Certificate) -> String {
    let date_format = format_description!("[year]-[month]-[day]");
    let effective = leaf
        .not_before
        .format(&date_format)
        .unwrap_or_else(|_| "unknown".to_string());
    let expiry = leaf
        .not_after
        .format(&date_format)
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{} [Certify] {effective} to {expiry}", primary.as_ascii())
}

fn build_pkcs12(
    friendly_name: &str,
    key_pkcs8_der: &[u8],
    chain_der: &[Vec<u8>],
    password: &str,
) -> anyhow::Result<Vec<u8>> {
    let mut chain = Vec::with_capacity(chain_der.len());
    for der in chain_der {
        chain.push(
            StoredCertificate::from_der(der)
                .map_err(|e| anyhow!("Parsing certificate for PKCS#12 failed: {e}"))?,
        );
    }
    let local_key_id = sha256(&chain_der[0]).to_vec();
    let key_chain = PrivateKeyChain::new(key_pkcs8_der, local_key_id, chain);
    let mut store = KeyStore::new();
    store.add_entry(friendly_name, KeyStoreEntry::PrivateKeyChain(key_chain));
    store
        .writer(password)
        .write()
        .map_err(|e| anyhow!("Encoding PKCS#12 failed: {e}"))
}

/// Opens a persisted PKCS#12 and returns the DER of the first certificate in
/// its key chain (the leaf).
pub fn extract_leaf_der(pkcs12: &[u8], password: &str) -> anyhow::Result<Vec<u8>> {
    let store = KeyStore::from_pkcs12(pkcs12, password)
        .map_err(|e| anyhow!("Opening PKCS#12 failed: {e}"))?;
    let (_, key_chain) = store
        .private_key_chain()
        .ok_or_else(|| anyhow!("PKCS#12 does not contain a private key entry"))?;
    let leaf = key_chain
        .chain()
        .first()
        .ok_or_else(|| anyhow!("PKCS#12 private key entry has no certificate chain"))?;
    Ok(leaf.as_der().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn test_leaf(domain: &str) -> (String, KeyPair) {
        let rc_key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
        let cert = params.self_signed(&rc_key).unwrap();
        let key = KeyPair::from_pem(&rc_key.serialize_pem()).unwrap();
        (cert.pem(), key)
    }

    fn assembler(dir: &std::path::Path) -> CertificateAssembler {
        CertificateAssembler::new(dir.to_path_buf(), Arc::new(IssuerCache::new_empty()))
    }

    #[rstest]
    #[case(CsrKeyAlg::Es256)]
    #[case(CsrKeyAlg::Es384)]
    #[case(CsrKeyAlg::Es512)]
    fn test_prepare_csr_material_generates_key(#[case] alg: CsrKeyAlg) {
        let identifiers = vec!["host.example.com".to_string()];
        let material = prepare_csr_material(&identifiers, alg, None, None).unwrap();
        assert!(material.key.is_some());
        assert!(!material.csr_der.is_empty());
    }

    #[test]
    fn test_prepare_csr_material_prefers_custom_csr() {
        let identifiers = vec!["host.example.com".to_string()];
        let rc_key = rcgen::KeyPair::generate().unwrap();
        let csr_der = create_and_sign_csr(&rc_key, &identifiers).unwrap();
        let csr_pem = pem::encode(&pem::Pem::new("CERTIFICATE REQUEST", csr_der.clone()));
        let material =
            prepare_csr_material(&identifiers, CsrKeyAlg::default(), Some(&csr_pem), None)
                .unwrap();
        assert!(material.key.is_none(), "custom CSR means no key material");
        assert_eq!(material.csr_der, csr_der);
    }

    #[test]
    fn test_assemble_writes_deterministic_path() {
        let dir = tempfile::tempdir().unwrap();
        let (chain_pem, key) = test_leaf("host.example.com");
        let primary: DnsName = "host.example.com".try_into().unwrap();
        let artifact = assembler(dir.path())
            .assemble(&primary, chain_pem.as_bytes(), &key, "secret")
            .unwrap();
        assert!(artifact.pfx_path.exists());
        assert!(
            artifact
                .pfx_path
                .starts_with(dir.path().join("host.example.com"))
        );
        assert_eq!(
            artifact.pfx_path.file_name().unwrap().to_str().unwrap(),
            format!("{}.pfx", artifact.certificate_id)
        );
    }

    #[test]
    fn test_assemble_replaces_wildcard_in_path() {
        let dir = tempfile::tempdir().unwrap();
        let (chain_pem, key) = test_leaf("*.example.com");
        let primary: DnsName = "*.example.com".try_into().unwrap();
        let artifact = assembler(dir.path())
            .assemble(&primary, chain_pem.as_bytes(), &key, "secret")
            .unwrap();
        assert!(artifact.pfx_path.starts_with(dir.path().join("_.example.com")));
    }

    #[test]
    fn test_certificate_id_shape() {
        let dir = tempfile::tempdir().unwrap();
        let (chain_pem, key) = test_leaf("host.example.com");
        let primary: DnsName = "host.example.com".try_into().unwrap();
        let artifact = assembler(dir.path())
            .assemble(&primary, chain_pem.as_bytes(), &key, "secret")
            .unwrap();
        let (date, fingerprint) = artifact.certificate_id.split_once('_').unwrap();
        assert_eq!(date.len(), 8);
        assert!(date.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(fingerprint.len(), 8);
        assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_friendly_name_format() {
        let dir = tempfile::tempdir().unwrap();
        let (chain_pem, key) = test_leaf("host.example.com");
        let primary: DnsName = "host.example.com".try_into().unwrap();
        let artifact = assembler(dir.path())
            .assemble(&primary, chain_pem.as_bytes(), &key, "secret")
            .unwrap();
        assert!(
            artifact
                .friendly_name
                .starts_with("host.example.com [Certify] ")
        );
        assert!(artifact.friendly_name.contains(" to "));
    }

    #[test]
    fn test_pkcs12_round_trips_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let (chain_pem, key) = test_leaf("host.example.com");
        let primary: DnsName = "host.example.com".try_into().unwrap();
        let artifact = assembler(dir.path())
            .assemble(&primary, chain_pem.as_bytes(), &key, "secret")
            .unwrap();
        let leaf_der = extract_leaf_der(&artifact.pkcs12, "secret").unwrap();
        assert_eq!(leaf_der, artifact.leaf.der);
    }

    #[test]
    fn test_missing_intermediate_is_completed_from_issuer_cache() {
        let dir = tempfile::tempdir().unwrap();
        // A small CA hierarchy: leaf signed by an issuing CA that the server
        // "forgot" to include in the chain
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(vec![]).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "certmill test CA");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_rc_key = rcgen::KeyPair::generate().unwrap();
        let leaf_params =
            rcgen::CertificateParams::new(vec!["host.example.com".to_string()]).unwrap();
        let leaf_cert = leaf_params
            .signed_by(&leaf_rc_key, &ca_cert, &ca_key)
            .unwrap();
        let leaf_key = KeyPair::from_pem(&leaf_rc_key.serialize_pem()).unwrap();

        let issuer_cache = Arc::new(IssuerCache::new_empty());
        issuer_cache.replace_with(vec![ca_cert.der().to_vec()]);
        let assembler = CertificateAssembler::new(dir.path().to_path_buf(), issuer_cache);
        let primary: DnsName = "host.example.com".try_into().unwrap();
        let artifact = assembler
            .assemble(&primary, leaf_cert.pem().as_bytes(), &leaf_key, "secret")
            .unwrap();
        assert_eq!(artifact.chain_der.len(), 2, "cached issuer must be appended");
        assert_eq!(artifact.chain_der[1], ca_cert.der().to_vec());
    }

    #[test]
    fn test_pkcs12_rejects_wrong_password() {
        let dir = tempfile::tempdir().unwrap();
        let (chain_pem, key) = test_leaf("host.example.com");
        let primary: DnsName = "host.example.com".try_into().unwrap();
        let artifact = assembler(dir.path())
            .assemble(&primary, chain_pem.as_bytes(), &key, "secret")
            .unwrap();
        assert!(extract_leaf_der(&artifact.pkcs12, "wrong").is_err());
    }
}
