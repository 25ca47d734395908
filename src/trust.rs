use crate::cert::ParsedX509Certificate;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// One cached CA certificate, indexed by its subject.
#[derive(Debug, Clone)]
struct CachedIssuer {
    subject: String,
    der: Vec<u8>,
}

/// A process-local, best-effort cache of root and intermediate CA certificates
/// read from the host trust store. Only used to complete server-supplied
/// chains; never authoritative. Readers always see an immutable snapshot, a
/// refresh swaps the whole snapshot out.
#[derive(Debug, Default)]
pub struct IssuerCache {
    snapshot: RwLock<Arc<Vec<CachedIssuer>>>,
}

impl IssuerCache {
    pub fn new_empty() -> Self {
        Self::default()
    }

    /// Builds a cache populated from the host trust store. Population failures
    /// are logged and leave the cache empty; an empty cache is not an error.
    pub fn from_host_store() -> Self {
        let cache = Self::new_empty();
        cache.refresh();
        cache
    }

    /// Re-reads the host trust store and swaps in a fresh snapshot.
    pub fn refresh(&self) {
        let result = rustls_native_certs::load_native_certs();
        for error in &result.errors {
            warn!("Problem reading host trust store: {error}");
        }
        let issuers = Self::index_certificates(result.certs.iter().map(AsRef::as_ref));
        debug!("Issuer cache now holds {} CA certificates", issuers.len());
        *self.snapshot.write() = Arc::new(issuers);
    }

    /// Replaces the snapshot with explicit certificates. Used by tests and by
    /// callers that bring their own CA bundle.
    pub fn replace_with(&self, der_certificates: impl IntoIterator<Item = Vec<u8>>) {
        let owned: Vec<Vec<u8>> = der_certificates.into_iter().collect();
        let issuers = Self::index_certificates(owned.iter().map(Vec::as_slice));
        *self.snapshot.write() = Arc::new(issuers);
    }

    fn index_certificates<'a>(ders: impl Iterator<Item = &'a [u8]>) -> Vec<CachedIssuer> {
        ders.filter_map(|der| match ParsedX509Certificate::from_der(der) {
            Ok(parsed) => Some(CachedIssuer {
                subject: parsed.subject,
                der: der.to_vec(),
            }),
            Err(e) => {
                debug!("Skipping unparseable trust store entry: {e:#}");
                None
            }
        })
        .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.read().is_empty()
    }

    /// Looks up a certificate whose subject matches the given issuer name.
    pub fn find_issuer(&self, issuer: &str) -> Option<Vec<u8>> {
        let snapshot = Arc::clone(&self.snapshot.read());
        snapshot
            .iter()
            .find(|cached| cached.subject == issuer)
            .map(|cached| cached.der.clone())
    }
}
