//! certmill is an ACME (RFC 8555) client engine. It drives certificate orders
//! from an authenticated account through identifier authorization (HTTP-01 or
//! DNS-01), CSR generation, finalization and chain download, packages the
//! result as PKCS#12, and can revoke what it issued.
//!
//! Peripheral concerns stay outside: challenge publication goes through the
//! [`ChallengeResponder`] seam, persistence of the signing settings through
//! [`SettingsStore`]. The [`Engine`] is an explicit handle; there is no global
//! state.

pub mod account;
pub mod acme;
pub mod assemble;
pub mod cert;
pub mod challenge;
pub mod config;
pub mod crypto;
pub mod dns;
pub mod error;
pub mod order;
pub mod revoke;
pub mod trust;
pub mod util;

pub use account::{AccountHealth, AccountManager, SettingsStore, SigningSettings};
pub use acme::object::RevocationReason;
pub use assemble::{CertificateArtifact, CsrKeyAlg};
pub use challenge::{
    ChallengeKind, ChallengePreferences, ChallengeResponder, ChallengeResponse, NullResponder,
    ResponderHandle,
};
pub use config::FileSettingsStore;
pub use dns::name::DnsName;
pub use error::{EngineError, EngineResult};
pub use order::{OrderRequest, OrderState};

use crate::account::AccountManager as Manager;
use crate::acme::client::{AcmeClient, AcmeClientBuilder};
use crate::acme::error::Error as AcmeError;
use crate::acme::http::{HttpClient, HttpOptions};
use crate::acme::object::Account;
use crate::assemble::CertificateAssembler;
use crate::crypto::asymmetric::KeyPair;
use crate::error::EngineContext;
use crate::order::OrderOrchestrator;
use crate::revoke::Revoker;
use crate::trust::IssuerCache;
use anyhow::{Context, anyhow};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

/// A Transport idle longer than this is re-initialized before the next order.
const TRANSPORT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        // Operations deeper in the stack wrap protocol errors in context;
        // recover the classification instead of flattening everything
        match err.downcast::<AcmeError>() {
            Ok(acme) => EngineError::from_acme(acme),
            Err(err) => EngineError::ClientFailure(err),
        }
    }
}

/// Engine-wide configuration. `http_options` is per-engine on purpose:
/// disabling TLS validation is scoped to this engine's transport, never global.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub directory_url: Url,
    pub assets_dir: PathBuf,
    pub http_options: HttpOptions,
}

#[derive(Debug)]
struct ClientSlot {
    client: Option<Arc<AcmeClient>>,
    last_used: Instant,
}

/// The explicit handle callers hold. One engine talks to one ACME directory
/// with one account; orders run independently on top of it.
pub struct Engine {
    config: EngineConfig,
    account: tokio::sync::RwLock<Manager>,
    client_slot: tokio::sync::Mutex<ClientSlot>,
    issuer_cache: Arc<IssuerCache>,
    orders_in_flight: Arc<parking_lot::Mutex<HashSet<Url>>>,
}

impl Engine {
    /// Creates an engine, loading the signing settings through the given store
    /// and populating the issuer cache from the host trust store.
    pub fn new(config: EngineConfig, store: Box<dyn SettingsStore>) -> anyhow::Result<Self> {
        let account = Manager::load(store).context("Loading signing settings")?;
        Ok(Self {
            config,
            account: tokio::sync::RwLock::new(account),
            client_slot: tokio::sync::Mutex::new(ClientSlot {
                client: None,
                last_used: Instant::now(),
            }),
            issuer_cache: Arc::new(IssuerCache::from_host_store()),
            orders_in_flight: Arc::new(parking_lot::Mutex::new(HashSet::new())),
        })
    }

    /// Returns the shared ACME client, building (or rebuilding, after the idle
    /// timeout) it on demand.
    async fn client(&self) -> EngineResult<Arc<AcmeClient>> {
        let mut slot = self.client_slot.lock().await;
        let now = Instant::now();
        let stale = now.duration_since(slot.last_used) > TRANSPORT_IDLE_TIMEOUT;
        if slot.client.is_none() || stale {
            if stale && slot.client.is_some() {
                debug!("Transport was idle beyond the timeout, re-initializing");
            }
            let http = HttpClient::try_new_with_options(&self.config.http_options)
                .map_err(EngineError::from)?;
            let client = AcmeClientBuilder::new(self.config.directory_url.clone())
                .with_http_client(http)
                .try_build()
                .await
                .map_err(EngineError::from)?;
            slot.client = Some(Arc::new(client));
        }
        slot.last_used = now;
        Ok(Arc::clone(slot.client.as_ref().expect("client was just built")))
    }

    pub async fn register_account(
        &self,
        email: Option<&str>,
        terms_agreed: bool,
    ) -> EngineResult<Account> {
        let client = self.client().await?;
        let mut account = self.account.write().await;
        account
            .register(&client, email, terms_agreed)
            .await
            .map_err(EngineError::from)
    }

    pub async fn lookup_existing_account(&self) -> EngineResult<Account> {
        let client = self.client().await?;
        let mut account = self.account.write().await;
        account
            .lookup_existing(&client)
            .await
            .map_err(EngineError::from)
    }

    pub async fn update_account(
        &self,
        email: Option<&str>,
        terms_agreed: bool,
    ) -> EngineResult<Account> {
        let client = self.client().await?;
        let mut account = self.account.write().await;
        account
            .update(&client, email, terms_agreed)
            .await
            .map_err(EngineError::from)
    }

    pub async fn deactivate_account(&self) -> EngineResult<()> {
        let client = self.client().await?;
        let mut account = self.account.write().await;
        account.deactivate(&client).await.map_err(EngineError::from)
    }

    /// Rolls the account key. Takes the account write lock, so in-flight
    /// signing operations complete before the swap and new ones see the new key.
    pub async fn rollover_account_key(&self) -> EngineResult<()> {
        let client = self.client().await?;
        let mut account = self.account.write().await;
        account.rollover(&client).await.map_err(EngineError::from)
    }

    pub async fn account_health(&self) -> EngineResult<AccountHealth> {
        let client = self.client().await?;
        let account = self.account.read().await;
        account.health(&client).await.map_err(EngineError::from)
    }

    /// Runs one certificate order end to end and assembles the PKCS#12
    /// artifact. The returned path is the externally visible result.
    pub async fn order_certificate(
        &self,
        request: OrderRequest,
        responder: &dyn ChallengeResponder,
        pfx_password: &str,
    ) -> EngineResult<CertificateArtifact> {
        let client = self.client().await?;
        let account = self.account.read().await;
        let signer = account.signer().client_failure()?;

        // Resumed orders are single-flight: two concurrent runs on the same
        // order URI are refused. Fresh orders get a unique URI from the CA.
        let _guard = match &request.order_resume_uri {
            Some(order_url) => Some(self.lock_order(order_url.clone())?),
            None => None,
        };

        let mut orchestrator = OrderOrchestrator::new(&client, signer, responder);
        let finalized = orchestrator.run(&request).await?;

        let cert_key = match finalized.cert_key {
            Some(key) => key,
            None => match &request.custom_private_key_pem {
                Some(pem) => KeyPair::from_pem(pem)
                    .context("Loading caller-supplied private key for packaging")
                    .assembly_failure()?,
                None => {
                    return Err(EngineError::AssemblyFailure(anyhow!(
                        "No private key available to package the downloaded certificate"
                    )));
                }
            },
        };
        let assembler = CertificateAssembler::new(
            self.config.assets_dir.clone(),
            Arc::clone(&self.issuer_cache),
        );
        assembler
            .assemble(
                &request.primary_domain,
                &finalized.chain_pem,
                &cert_key,
                pfx_password,
            )
            .assembly_failure()
    }

    /// Revokes a certificate from its persisted PKCS#12 bundle.
    pub async fn revoke_certificate(
        &self,
        pfx_path: &Path,
        pfx_password: &str,
        reason: RevocationReason,
    ) -> EngineResult<()> {
        let client = self.client().await?;
        let account = self.account.read().await;
        let signer = account.signer().client_failure()?;
        let revoker = Revoker::new(&client, signer);
        revoker.revoke_file(pfx_path, pfx_password, reason).await
    }

    pub fn issuer_cache(&self) -> &IssuerCache {
        &self.issuer_cache
    }

    fn lock_order(&self, order_url: Url) -> EngineResult<OrderGuard> {
        let mut in_flight = self.orders_in_flight.lock();
        if !in_flight.insert(order_url.clone()) {
            return Err(EngineError::ClientFailure(anyhow!(
                "Another run is already in flight for order {order_url}"
            )));
        }
        Ok(OrderGuard {
            registry: Arc::clone(&self.orders_in_flight),
            order_url,
        })
    }
}

/// Releases an order's single-flight slot when the run ends, on all paths.
struct OrderGuard {
    registry: Arc<parking_lot::Mutex<HashSet<Url>>>,
    order_url: Url,
}

impl Drop for OrderGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.order_url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::SigningSettings;
    use parking_lot::Mutex;

    #[derive(Debug, Default, Clone)]
    struct MemoryStore {
        inner: Arc<Mutex<Option<SigningSettings>>>,
    }

    impl SettingsStore for MemoryStore {
        fn load(&self) -> anyhow::Result<Option<SigningSettings>> {
            Ok(self.inner.lock().clone())
        }

        fn save(&self, settings: &SigningSettings) -> anyhow::Result<()> {
            *self.inner.lock() = Some(settings.clone());
            Ok(())
        }
    }

    fn test_engine() -> Engine {
        let config = EngineConfig {
            directory_url: Url::parse("https://ca.invalid/directory").unwrap(),
            assets_dir: std::env::temp_dir(),
            http_options: HttpOptions::default(),
        };
        Engine::new(config, Box::new(MemoryStore::default())).unwrap()
    }

    #[test]
    fn test_order_lock_is_single_flight() {
        let engine = test_engine();
        let order_url = Url::parse("https://ca.invalid/order/1").unwrap();
        let guard = engine.lock_order(order_url.clone()).unwrap();
        let second = engine.lock_order(order_url.clone());
        assert!(matches!(second, Err(EngineError::ClientFailure(_))));
        drop(guard);
        // released on drop, a new run may start
        let _ = engine.lock_order(order_url).unwrap();
    }

    #[test]
    fn test_distinct_orders_do_not_conflict() {
        let engine = test_engine();
        let first = engine
            .lock_order(Url::parse("https://ca.invalid/order/1").unwrap())
            .unwrap();
        let second = engine
            .lock_order(Url::parse("https://ca.invalid/order/2").unwrap())
            .unwrap();
        drop((first, second));
    }

    #[tokio::test]
    async fn test_ordering_without_account_is_refused() {
        let engine = test_engine();
        // No account registered: the signer is unavailable before any network
        // traffic happens, but building a client against ca.invalid fails
        // first, so this must error either way without panicking.
        let request = OrderRequest::new("example.com".try_into().unwrap());
        let responder = NullResponder::default();
        let result = engine
            .order_certificate(request, &responder, "secret")
            .await;
        assert!(result.is_err());
    }
}
