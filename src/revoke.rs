use crate::acme::client::AcmeClient;
use crate::acme::object::RevocationReason;
use crate::assemble::extract_leaf_der;
use crate::crypto::jws::JsonWebKey;
use crate::error::{EngineContext, EngineError, EngineResult};
use anyhow::Context;
use std::path::Path;
use tracing::info;

/// Revokes previously issued certificates out of their persisted PKCS#12
/// bundles, signed by the account key.
pub struct Revoker<'a> {
    client: &'a AcmeClient,
    signer: &'a JsonWebKey,
}

impl<'a> Revoker<'a> {
    pub fn new(client: &'a AcmeClient, signer: &'a JsonWebKey) -> Self {
        Self { client, signer }
    }

    /// Loads the PKCS#12 at `pfx_path`, extracts the leaf certificate, and
    /// submits a revocation request for it.
    pub async fn revoke_file(
        &self,
        pfx_path: &Path,
        password: &str,
        reason: RevocationReason,
    ) -> EngineResult<()> {
        let der = self.load_leaf(pfx_path, password)?;
        self.revoke_der(&der, reason).await
    }

    /// Submits a revocation request for a certificate given as DER.
    pub async fn revoke_der(&self, der: &[u8], reason: RevocationReason) -> EngineResult<()> {
        self.client
            .revoke_certificate(self.signer, der, reason)
            .await
            .map_err(|e| match EngineError::from(e) {
                // Rate limits keep their own kind, everything else is a
                // revocation failure for the caller
                rate_limit @ EngineError::RateLimited { .. } => rate_limit,
                other => EngineError::RevocationFailed(anyhow::Error::new(other)),
            })?;
        info!("Certificate revoked");
        Ok(())
    }

    fn load_leaf(&self, pfx_path: &Path, password: &str) -> EngineResult<Vec<u8>> {
        let display = pfx_path.display().to_string();
        let bytes = std::fs::read(pfx_path)
            .context(format!("Reading PKCS#12 file {display}"))
            .revocation_failure()?;
        extract_leaf_der(&bytes, password)
            .context(format!("Extracting leaf certificate from {display}"))
            .revocation_failure()
    }
}
