use crate::acme::error::ProtocolResult;
use crate::acme::error::{Error, RateLimitError};
use crate::acme::http::HttpClient;
use crate::acme::http::RelationLink;
use crate::acme::object::{
    Account, AccountRequest, AccountUpdateRequest, Authorization, Challenge, Deactivation,
    Directory, EmptyObject, FinalizeRequest, KeyChangeRequest, NewOrderRequest, Nonce, Order,
    RevocationReason, RevocationRequest,
};
use crate::crypto::jws::{EMPTY_PAYLOAD, JsonWebKey, ProtectedHeader};
use crate::util::serde_helper::PassthroughBytes;
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::de::value::BytesDeserializer;
use std::any::TypeId;
use std::time::{Duration, SystemTime};
use tracing::debug;
use url::Url;

/// The maximum number of retries we do, per request
const MAX_RETRIES: usize = 3;
/// The default time we wait between retries, if a retry is needed
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(3);
/// The maximum amount of time we're willing to wait in between retries
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(2 * 60);

pub struct AcmeClientBuilder {
    server_url: Url,
    http_client: Option<HttpClient>,
}

impl AcmeClientBuilder {
    pub fn new(acme_server_url: Url) -> AcmeClientBuilder {
        Self {
            server_url: acme_server_url,
            http_client: None,
        }
    }

    #[must_use]
    pub fn with_http_client(mut self, http_client: HttpClient) -> Self {
        self.http_client = Some(http_client);
        self
    }

    pub async fn try_build(self) -> ProtocolResult<AcmeClient> {
        AcmeClient::try_new(self).await
    }
}

/// A client for one ACME directory. Holds the cached directory resource and the
/// nonce slot; all signing is delegated to the caller-provided [`JsonWebKey`].
#[derive(Debug)]
pub struct AcmeClient {
    http_client: HttpClient,
    directory: Directory,
    // Single-slot nonce cache: at most one unused nonce at a time, and a nonce
    // is moved out (never cloned) when consumed.
    nonce_slot: Mutex<Option<Nonce>>,
}

impl AcmeClient {
    async fn try_new(builder: AcmeClientBuilder) -> ProtocolResult<Self> {
        let http_client = builder
            .http_client
            .ok_or_else(HttpClient::try_new)
            .or_else(|e| e)?;
        let directory_response = http_client.get(builder.server_url).await?;
        let directory = match directory_response.status() {
            StatusCode::OK => directory_response.json().await?,
            _ => return Err(Error::from_http_response(directory_response).await),
        };
        Ok(Self {
            http_client,
            directory,
            nonce_slot: Mutex::new(None),
        })
    }

    /// Takes the cached nonce, or fetches a fresh one from `newNonce`.
    pub async fn get_nonce(&self) -> ProtocolResult<Nonce> {
        let mut last_error;
        let mut retry = 0;
        loop {
            let pooled_nonce = self.nonce_slot.lock().take();
            if let Some(pooled_nonce) = pooled_nonce {
                return Ok(pooled_nonce);
            }

            let response = self
                .http_client
                .head(self.directory.new_nonce.clone())
                .await?;
            if let Some(nonce) = HttpClient::extract_nonce(&response) {
                return Ok(nonce);
            }

            let retry_after = HttpClient::extract_backoff(&response);
            last_error = Error::from_http_response(response).await;
            retry += 1;
            if retry > MAX_RETRIES {
                break;
            }
            let backoff = backoff_from_retry_after(retry_after);
            tokio::time::sleep(backoff).await;
        }
        Err(last_error)
    }

    fn try_store_nonce(&self, maybe_nonce: Option<Nonce>) {
        if let Some(nonce) = maybe_nonce {
            let mut slot = self.nonce_slot.lock();
            // Keep the slot single-occupancy; a concurrent request that already
            // filled it wins and this nonce is dropped.
            if slot.is_none() {
                *slot = Some(nonce);
            }
        }
    }

    async fn post_with_retry<T: Serialize, R: DeserializeOwned + 'static>(
        &self,
        target_url: &Url,
        key: &JsonWebKey,
        payload: Option<&T>,
    ) -> ProtocolResult<AcmeResponse<R>> {
        let mut last_error;
        let mut retry = 0;
        // A badNonce failure earns exactly one immediate retry that does not
        // count towards the regular retry budget.
        let mut bad_nonce_retry_available = true;
        let mut header = ProtectedHeader::new(
            key.algorithm(),
            self.get_nonce().await?,
            target_url.clone(),
            key.parameters().clone(),
        );
        loop {
            let signed = key.sign(&header, payload)?;
            let response = self.http_client.post(target_url.clone(), &signed).await?;

            let retry_after = HttpClient::extract_backoff(&response);
            let new_nonce = HttpClient::extract_nonce(&response);
            let links = HttpClient::extract_relation_links(&response);
            let location = HttpClient::extract_location(&response);
            let status = response.status();

            match status {
                StatusCode::OK | StatusCode::CREATED => {
                    self.try_store_nonce(new_nonce);
                    // The ACME protocol uses JSON for every POST response,
                    // except when downloading a certificate. Callers requesting
                    // PassthroughBytes get the raw body instead; the condition
                    // resolves at compile time based on `R`.
                    let body: R = if TypeId::of::<R>() == TypeId::of::<PassthroughBytes>() {
                        let bytes = response.bytes().await?;
                        let deserializer =
                            BytesDeserializer::<'_, serde::de::value::Error>::new(&bytes);
                        R::deserialize(deserializer).map_err(|_| {
                            Error::ProtocolViolation("Failed to capture raw response body")
                        })?
                    } else {
                        response.json().await?
                    };
                    return Ok(AcmeResponse {
                        status,
                        location,
                        links,
                        retry_after,
                        body,
                    });
                }
                _ => {
                    last_error = Error::from_http_response(response).await;
                    if let Error::AcmeProblem(problem) = &last_error {
                        if problem.is_bad_nonce() {
                            if bad_nonce_retry_available {
                                bad_nonce_retry_available = false;
                                // The error response carries a fresh nonce;
                                // fall back to newNonce if it does not
                                header.nonce = match new_nonce {
                                    Some(nonce) => nonce,
                                    None => self.get_nonce().await?,
                                };
                                debug!("Retrying request once with fresh nonce after badNonce");
                                continue;
                            }
                        } else {
                            self.try_store_nonce(new_nonce);
                        }

                        if problem.is_rate_limit() {
                            return Err(RateLimitError {
                                problem: problem.clone(),
                                retry_after,
                            }
                            .into());
                        }
                    } else {
                        self.try_store_nonce(new_nonce);
                    }
                }
            }
            retry += 1;
            // Give up if the request doesn't seem salvageable
            if status.is_client_error() || retry > MAX_RETRIES {
                break;
            }
            let backoff = backoff_from_retry_after(retry_after);
            tokio::time::sleep(backoff).await;
            header.nonce = self.get_nonce().await?;
        }
        Err(last_error)
    }

    /// The ACME directory resource. Cached for the lifetime of this client.
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Registers a new account, or looks up an existing account for the key if
    /// `only_return_existing` is set. Returns the signer bound to the account
    /// URL together with the account resource.
    pub async fn register_account(
        &self,
        options: AccountRegisterOptions,
    ) -> ProtocolResult<(JsonWebKey, Url, Account)> {
        let jwk = options.key;
        let target_url = &self.directory().new_account;
        let payload = AccountRequest {
            contact: options.contact,
            terms_of_service_agreed: options.terms_of_service_agreed,
            only_return_existing: options.only_return_existing,
        };
        let response = self
            .post_with_retry(target_url, &jwk, Some(&payload))
            .await?;
        let account_url = response.location.ok_or(Error::ProtocolViolation(
            "ACME server did not provide an account URL",
        ))?;
        let account = response.body;
        let account_key = jwk.into_existing(account_url.clone());
        Ok((account_key, account_url, account))
    }

    pub async fn fetch_account(
        &self,
        account_key: &JsonWebKey,
        account_url: &Url,
    ) -> ProtocolResult<Account> {
        let response = self
            .post_with_retry(account_url, account_key, EMPTY_PAYLOAD)
            .await?;
        Ok(response.body)
    }

    pub async fn update_account(
        &self,
        account_key: &JsonWebKey,
        account_url: &Url,
        update: &AccountUpdateRequest,
    ) -> ProtocolResult<Account> {
        let response = self
            .post_with_retry(account_url, account_key, Some(update))
            .await?;
        Ok(response.body)
    }

    pub async fn deactivate_account(
        &self,
        account_key: &JsonWebKey,
        account_url: &Url,
    ) -> ProtocolResult<Account> {
        let response = self
            .post_with_retry(account_url, account_key, Some(&Deactivation::new()))
            .await?;
        Ok(response.body)
    }

    /// Rolls the account over to a new key (RFC 8555 Section 7.3.5): the inner
    /// JWS is signed by the new key and carries it as `jwk`, the outer envelope
    /// is signed by the current account key.
    pub async fn change_key(
        &self,
        account_key: &JsonWebKey,
        account_url: &Url,
        new_key: &JsonWebKey,
    ) -> ProtocolResult<()> {
        let target_url = &self.directory().key_change;
        let inner_payload = KeyChangeRequest {
            account: account_url.clone(),
            old_key: account_key.public_parameters(),
        };
        // The inner JWS has no nonce, but must target the same URL
        let inner_header = ProtectedHeader::new(
            new_key.algorithm(),
            Nonce::new_empty(),
            target_url.clone(),
            new_key.parameters().clone(),
        );
        let inner = new_key.sign(&inner_header, Some(&inner_payload))?;
        // The keyChange response body carries no information; capture raw bytes
        let _: AcmeResponse<PassthroughBytes> = self
            .post_with_retry(target_url, account_key, Some(&inner))
            .await?;
        Ok(())
    }

    pub async fn new_order(
        &self,
        account_key: &JsonWebKey,
        request: &NewOrderRequest,
    ) -> ProtocolResult<(Url, Order)> {
        let target_url = &self.directory().new_order;
        let response = self
            .post_with_retry(target_url, account_key, Some(request))
            .await?;
        let order_url = response.location.ok_or(Error::ProtocolViolation(
            "ACME server did not provide an order URL for created order",
        ))?;
        Ok((order_url, response.body))
    }

    pub async fn get_order(
        &self,
        account_key: &JsonWebKey,
        order_url: &Url,
    ) -> ProtocolResult<Order> {
        let response = self
            .post_with_retry(order_url, account_key, EMPTY_PAYLOAD)
            .await?;
        Ok(response.body)
    }

    pub async fn get_authorization(
        &self,
        account_key: &JsonWebKey,
        authz_url: &Url,
    ) -> ProtocolResult<Authorization> {
        let response = self
            .post_with_retry(authz_url, account_key, EMPTY_PAYLOAD)
            .await?;
        Ok(response.body)
    }

    pub async fn get_challenge(
        &self,
        account_key: &JsonWebKey,
        challenge_url: &Url,
    ) -> ProtocolResult<Challenge> {
        let response = self
            .post_with_retry(challenge_url, account_key, EMPTY_PAYLOAD)
            .await?;
        Ok(response.body)
    }

    /// Asks the CA to validate a challenge (POST with an empty object). The
    /// returned challenge is a snapshot; polling is up to the caller.
    pub async fn request_validation(
        &self,
        account_key: &JsonWebKey,
        challenge_url: &Url,
    ) -> ProtocolResult<Challenge> {
        let response = self
            .post_with_retry(challenge_url, account_key, Some(&EmptyObject {}))
            .await?;
        Ok(response.body)
    }

    /// Submits a CSR (DER) to the order's finalize URL.
    pub async fn finalize_order(
        &self,
        account_key: &JsonWebKey,
        finalize_url: &Url,
        csr_der: &[u8],
    ) -> ProtocolResult<Order> {
        let request = FinalizeRequest {
            csr: BASE64_URL_SAFE_NO_PAD.encode(csr_der),
        };
        let response = self
            .post_with_retry(finalize_url, account_key, Some(&request))
            .await?;
        Ok(response.body)
    }

    pub async fn download_certificate(
        &self,
        account_key: &JsonWebKey,
        certificate_url: &Url,
    ) -> ProtocolResult<DownloadedCertificate> {
        let response = self
            .post_with_retry(certificate_url, account_key, EMPTY_PAYLOAD)
            .await?;
        let alternate_chains = response
            .links
            .into_iter()
            .filter(|link| link.relation == "alternate")
            .map(|link| link.url)
            .collect();
        Ok(DownloadedCertificate {
            pem: response.body,
            alternate_chains,
        })
    }

    /// Revokes a certificate given its DER encoding. Success is an HTTP 200.
    pub async fn revoke_certificate(
        &self,
        account_key: &JsonWebKey,
        certificate_der: &[u8],
        reason: RevocationReason,
    ) -> ProtocolResult<()> {
        let target_url = &self.directory().revoke_cert;
        let request = RevocationRequest {
            certificate: BASE64_URL_SAFE_NO_PAD.encode(certificate_der),
            reason,
        };
        // Success is an HTTP 200 with an empty body
        let response: AcmeResponse<PassthroughBytes> = self
            .post_with_retry(target_url, account_key, Some(&request))
            .await?;
        if response.status == StatusCode::OK {
            Ok(())
        } else {
            Err(Error::ProtocolViolation(
                "CA accepted revocation request with unexpected status",
            ))
        }
    }
}

#[derive(Debug)]
pub struct AcmeResponse<T: DeserializeOwned> {
    pub status: StatusCode,
    pub location: Option<Url>,
    pub links: Vec<RelationLink>,
    pub retry_after: Option<SystemTime>,
    pub body: T,
}

#[derive(Debug)]
pub struct AccountRegisterOptions {
    pub key: JsonWebKey,
    pub contact: Vec<Url>,
    pub terms_of_service_agreed: Option<bool>,
    pub only_return_existing: bool,
}

#[derive(Debug)]
pub struct DownloadedCertificate {
    pub pem: PassthroughBytes,
    pub alternate_chains: Vec<Url>,
}

pub(crate) fn backoff_from_retry_after(retry_after: Option<SystemTime>) -> Duration {
    retry_after
        .and_then(|date| date.duration_since(SystemTime::now()).ok())
        .map_or(DEFAULT_RETRY_BACKOFF, |backoff| {
            if backoff > MAX_RETRY_BACKOFF {
                MAX_RETRY_BACKOFF
            } else {
                backoff
            }
        })
}
