use crate::acme::client::{AccountRegisterOptions, AcmeClient};
use crate::acme::error::Error as AcmeError;
use crate::acme::object::{Account, AccountStatus, AccountUpdateRequest};
use crate::crypto::asymmetric::{Curve, KeyPair, KeyType, new_key};
use crate::crypto::jws::JsonWebKey;
use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

/// The signing settings blob persisted through a [`SettingsStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_uri: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_key_pem: Option<String>,
}

/// Narrow persistence seam for the signing settings blob. The engine never
/// touches certificate storage; only this blob crosses the boundary.
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Option<SigningSettings>>;
    fn save(&self, settings: &SigningSettings) -> anyhow::Result<()>;
}

/// Stable account status for callers, independent of the wire representation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccountHealth {
    Valid,
    Deactivated,
    Revoked,
    DoesNotExist,
    Unknown,
}

impl From<AccountStatus> for AccountHealth {
    fn from(status: AccountStatus) -> Self {
        match status {
            AccountStatus::Valid => AccountHealth::Valid,
            AccountStatus::Deactivated => AccountHealth::Deactivated,
            AccountStatus::Revoked => AccountHealth::Revoked,
            AccountStatus::Unknown => AccountHealth::Unknown,
        }
    }
}

/// Owns the account key pair and drives all account-level ACME operations.
/// Everything else borrows the signer; key rotation therefore requires
/// exclusive access and cannot race in-flight requests.
pub struct AccountManager {
    store: Box<dyn SettingsStore>,
    settings: SigningSettings,
    signer: Option<JsonWebKey>,
}

impl AccountManager {
    /// Loads the settings blob (migrating legacy key material if the store
    /// does) and reconstructs the signer if an account key is present.
    pub fn load(store: Box<dyn SettingsStore>) -> anyhow::Result<Self> {
        let settings = store.load()?.unwrap_or(SigningSettings {
            account_email: None,
            account_uri: None,
            account_key_pem: None,
        });
        let signer = match (&settings.account_key_pem, &settings.account_uri) {
            (Some(pem), Some(uri)) => {
                let keypair =
                    KeyPair::from_pem(pem).context("Loading account key from settings blob")?;
                Some(JsonWebKey::new_existing(keypair, uri.clone()))
            }
            (Some(pem), None) => {
                let keypair =
                    KeyPair::from_pem(pem).context("Loading account key from settings blob")?;
                Some(JsonWebKey::new(keypair))
            }
            _ => None,
        };
        Ok(Self {
            store,
            settings,
            signer,
        })
    }

    /// The signer bound to the current account, if an account is registered.
    pub fn signer(&self) -> anyhow::Result<&JsonWebKey> {
        match (&self.signer, &self.settings.account_uri) {
            (Some(signer), Some(_)) => Ok(signer),
            _ => bail!("No ACME account is registered yet"),
        }
    }

    pub fn account_uri(&self) -> Option<&Url> {
        self.settings.account_uri.as_ref()
    }

    pub fn account_email(&self) -> Option<&str> {
        self.settings.account_email.as_deref()
    }

    fn contact_urls(email: Option<&str>) -> Vec<Url> {
        email
            .and_then(|email| Url::parse(&format!("mailto:{email}")).ok())
            .into_iter()
            .collect()
    }

    fn persist(&self) -> anyhow::Result<()> {
        self.store
            .save(&self.settings)
            .context("Persisting signing settings blob")
    }

    fn take_or_create_key(&mut self) -> anyhow::Result<JsonWebKey> {
        if let Some(existing) = self.signer.take() {
            // newAccount requests carry the full JWK header, not a kid
            return Ok(JsonWebKey::new(existing.into_keypair()));
        }
        debug!("Generating a fresh ECDSA P-256 account key");
        let keypair = new_key(KeyType::Ecdsa(Curve::P256))?;
        Ok(JsonWebKey::new(keypair))
    }

    /// Registers a new account (or adopts the existing account for the loaded
    /// key) and persists the resulting settings blob.
    pub async fn register(
        &mut self,
        client: &AcmeClient,
        email: Option<&str>,
        terms_agreed: bool,
    ) -> anyhow::Result<Account> {
        let jwk = self.take_or_create_key()?;
        let options = AccountRegisterOptions {
            key: jwk,
            contact: Self::contact_urls(email),
            terms_of_service_agreed: Some(terms_agreed),
            only_return_existing: false,
        };
        let (account_key, account_url, account) = match client.register_account(options).await {
            Ok(registered) => registered,
            Err(e) => {
                // Leave the manager without a signer rather than with a signer
                // in an undefined binding state
                self.signer = None;
                return Err(e).context("Registering ACME account");
            }
        };
        info!("Registered ACME account at {account_url}");
        self.settings.account_email = email.map(ToString::to_string);
        self.settings.account_uri = Some(account_url);
        self.settings.account_key_pem = None;
        self.signer = Some(account_key);
        self.store_key_pem()?;
        Ok(account)
    }

    /// Looks up the account for the loaded key without creating one
    /// (`onlyReturnExisting`).
    pub async fn lookup_existing(&mut self, client: &AcmeClient) -> anyhow::Result<Account> {
        let jwk = self.take_or_create_key()?;
        let options = AccountRegisterOptions {
            key: jwk,
            contact: vec![],
            terms_of_service_agreed: None,
            only_return_existing: true,
        };
        let (account_key, account_url, account) = match client.register_account(options).await {
            Ok(found) => found,
            Err(e) => {
                self.signer = None;
                return Err(e).context("Looking up existing ACME account");
            }
        };
        debug!("Found existing ACME account at {account_url}");
        self.settings.account_uri = Some(account_url);
        self.signer = Some(account_key);
        self.store_key_pem()?;
        Ok(account)
    }

    pub async fn update(
        &mut self,
        client: &AcmeClient,
        email: Option<&str>,
        terms_agreed: bool,
    ) -> anyhow::Result<Account> {
        let signer = self.signer()?;
        let account_url = self
            .settings
            .account_uri
            .clone()
            .context("No account URI recorded")?;
        let update = AccountUpdateRequest {
            contact: Self::contact_urls(email),
            terms_of_service_agreed: Some(terms_agreed),
        };
        let account = client
            .update_account(signer, &account_url, &update)
            .await
            .context("Updating ACME account")?;
        self.settings.account_email = email.map(ToString::to_string);
        self.persist()?;
        Ok(account)
    }

    pub async fn deactivate(&mut self, client: &AcmeClient) -> anyhow::Result<()> {
        let signer = self.signer()?;
        let account_url = self
            .settings
            .account_uri
            .clone()
            .context("No account URI recorded")?;
        let account = client
            .deactivate_account(signer, &account_url)
            .await
            .context("Deactivating ACME account")?;
        if !matches!(account.status, AccountStatus::Deactivated) {
            bail!(
                "ACME account has unexpected status {} after deactivation",
                account.status
            );
        }
        info!("Deactivated ACME account {account_url}");
        self.settings.account_uri = None;
        self.settings.account_key_pem = None;
        self.signer = None;
        self.persist()?;
        Ok(())
    }

    /// Generates a new account key and performs a `keyChange`. The active key
    /// is only swapped once the server has accepted the rollover.
    pub async fn rollover(&mut self, client: &AcmeClient) -> anyhow::Result<()> {
        let old_signer = self.signer()?;
        let account_url = self
            .settings
            .account_uri
            .clone()
            .context("No account URI recorded")?;
        let new_keypair = new_key(KeyType::Ecdsa(Curve::P256))?;
        let new_signer = JsonWebKey::new(new_keypair);
        client
            .change_key(old_signer, &account_url, &new_signer)
            .await
            .context("Rolling over ACME account key")?;
        info!("Account key rollover accepted by the CA");
        self.signer = Some(new_signer.into_existing(account_url));
        self.store_key_pem()?;
        Ok(())
    }

    /// Fetches the current account and maps its status, treating an
    /// `accountDoesNotExist` problem as a status rather than an error.
    pub async fn health(&self, client: &AcmeClient) -> anyhow::Result<AccountHealth> {
        let Some(account_url) = &self.settings.account_uri else {
            return Ok(AccountHealth::DoesNotExist);
        };
        let signer = self.signer()?;
        match client.fetch_account(signer, account_url).await {
            Ok(account) => Ok(account.status.into()),
            Err(AcmeError::AcmeProblem(problem)) if problem.is_account_does_not_exist() => {
                Ok(AccountHealth::DoesNotExist)
            }
            Err(e) => Err(e).context("Fetching ACME account status"),
        }
    }

    fn store_key_pem(&mut self) -> anyhow::Result<()> {
        if let Some(signer) = &self.signer {
            // The signer wraps the only copy of the key; serialize it through a
            // reload-safe PEM round trip for persistence.
            let pem = signer_key_pem(signer)?;
            self.settings.account_key_pem = Some(pem);
        }
        self.persist()
    }
}

fn signer_key_pem(signer: &JsonWebKey) -> anyhow::Result<String> {
    // KeyPair exposes PEM only through the key itself; the signer shares it
    let pem = signer
        .keypair_pem()
        .context("Serializing account key to PEM")?;
    Ok(pem)
}
