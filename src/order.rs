use crate::acme::client::AcmeClient;
use crate::acme::error::Problem;
use crate::acme::object::{
    Authorization, AuthorizationStatus, Challenge, ChallengeStatus, Identifier, NewOrderRequest,
    Order, OrderStatus,
};
use crate::assemble::{CsrKeyAlg, CsrMaterial, prepare_csr_material};
use crate::challenge::{
    ChallengePreferences, ChallengeResponder, ChallengeResponse, select_challenge,
};
use crate::crypto::asymmetric::KeyPair;
use crate::crypto::jws::JsonWebKey;
use crate::dns::name::DnsName;
use crate::error::{EngineError, EngineResult};
use crate::util::poll::{PollSchedule, poll_until};
use anyhow::anyhow;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Order creation is retried a fixed number of times; the counter decrements
/// once per attempt.
const CREATE_ATTEMPTS: u32 = 3;
const CREATE_BACKOFF: Duration = Duration::from_secs(1);

fn challenge_delay(remaining: u32) -> Duration {
    Duration::from_millis(1000 + u64::from(11 - remaining) * 500)
}

fn one_second(_remaining: u32) -> Duration {
    Duration::from_secs(1)
}

fn two_seconds(_remaining: u32) -> Duration {
    Duration::from_secs(2)
}

const CHALLENGE_POLL: PollSchedule = PollSchedule::new(10, challenge_delay);
const AUTHORIZATION_POLL: PollSchedule = PollSchedule::new(20, one_second);
const ORDER_READY_POLL: PollSchedule = PollSchedule::new(5, two_seconds);
const ORDER_VALID_POLL: PollSchedule = PollSchedule::new(10, two_seconds);

/// Everything a caller can configure on one certificate order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub primary_domain: DnsName,
    pub subject_alternative_names: Vec<DnsName>,
    pub csr_key_alg: CsrKeyAlg,
    pub custom_csr_pem: Option<String>,
    pub custom_private_key_pem: Option<String>,
    pub challenge_preferences: ChallengePreferences,
    pub order_resume_uri: Option<Url>,
    /// Passed through to the responder for DNS-01 publications
    pub dns_propagation_delay: Duration,
}

impl OrderRequest {
    pub fn new(primary_domain: DnsName) -> Self {
        Self {
            primary_domain,
            subject_alternative_names: vec![],
            csr_key_alg: CsrKeyAlg::default(),
            custom_csr_pem: None,
            custom_private_key_pem: None,
            challenge_preferences: ChallengePreferences::default(),
            order_resume_uri: None,
            dns_propagation_delay: Duration::ZERO,
        }
    }

    /// The deduplicated identifier list, primary domain first.
    pub(crate) fn requested_names(&self) -> Vec<DnsName> {
        let mut names = vec![self.primary_domain.clone()];
        for name in &self.subject_alternative_names {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

/// The orchestrator's observable progress through one order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OrderState {
    Draft,
    Created,
    AuthorizationsPending,
    AuthorizationsValid,
    Finalizing,
    Downloading,
    Completed,
    Failed,
}

/// The result of a completed order run: the downloaded chain plus the private
/// key that belongs to it (absent when the caller supplied a CSR, or when a
/// resumed order was already finalized elsewhere).
#[derive(Debug)]
pub struct FinalizedOrder {
    pub order_url: Url,
    pub identifiers: Vec<String>,
    pub chain_pem: Vec<u8>,
    pub cert_key: Option<KeyPair>,
}

/// Drives one certificate order from creation to chain download. One
/// orchestrator handles exactly one order at a time; all its transitions are
/// sequential.
pub struct OrderOrchestrator<'a> {
    client: &'a AcmeClient,
    signer: &'a JsonWebKey,
    responder: &'a dyn ChallengeResponder,
    state: OrderState,
}

impl<'a> OrderOrchestrator<'a> {
    pub fn new(
        client: &'a AcmeClient,
        signer: &'a JsonWebKey,
        responder: &'a dyn ChallengeResponder,
    ) -> Self {
        Self {
            client,
            signer,
            responder,
            state: OrderState::Draft,
        }
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    fn set_state(&mut self, next: OrderState) {
        debug!("Order state: {:?} -> {next:?}", self.state);
        self.state = next;
    }

    pub async fn run(&mut self, request: &OrderRequest) -> EngineResult<FinalizedOrder> {
        let result = self.run_inner(request).await;
        if result.is_err() {
            self.set_state(OrderState::Failed);
        }
        result
    }

    async fn run_inner(&mut self, request: &OrderRequest) -> EngineResult<FinalizedOrder> {
        let names = request.requested_names();
        let ascii: Vec<String> = names
            .iter()
            .map(|name| name.as_ascii().to_string())
            .collect();
        info!("Ordering certificate for {}", ascii.join(", "));

        let (order_url, mut order) = self.create_or_resume(request, &ascii).await?;
        self.set_state(OrderState::Created);

        match order.status {
            OrderStatus::Pending => {
                self.set_state(OrderState::AuthorizationsPending);
                self.authorize_all(request, &names, &order).await?;
                self.set_state(OrderState::AuthorizationsValid);
                info!("All identifiers authorized");
                order = self
                    .client
                    .get_order(self.signer, &order_url)
                    .await
                    .map_err(EngineError::from)?;
            }
            OrderStatus::Ready | OrderStatus::Processing => {
                debug!("Order requires no further authorization, skipping challenge phase");
                self.set_state(OrderState::AuthorizationsValid);
            }
            OrderStatus::Valid => {
                debug!("Order is already valid, downloading without re-finalizing");
                self.set_state(OrderState::AuthorizationsValid);
            }
            OrderStatus::Invalid => {
                return Err(order_failure(order.error, "Order is invalid at creation"));
            }
        }

        let mut cert_key = None;
        if !matches!(order.status, OrderStatus::Valid) {
            self.set_state(OrderState::Finalizing);
            let (final_order, key) = self
                .finalize(request, order, &order_url, &ascii)
                .await?;
            order = final_order;
            cert_key = key;
        }

        self.set_state(OrderState::Downloading);
        let certificate_url = order.certificate.ok_or_else(|| {
            EngineError::CaFailure(anyhow!("CA did not provide a certificate URL for valid order"))
        })?;
        debug!("Final certificate available @ {certificate_url}");
        let downloaded = self
            .client
            .download_certificate(self.signer, &certificate_url)
            .await
            .map_err(EngineError::from)?;
        self.set_state(OrderState::Completed);
        info!("Successfully issued a certificate!");
        Ok(FinalizedOrder {
            order_url,
            identifiers: ascii,
            chain_pem: downloaded.pem.to_vec(),
            cert_key,
        })
    }

    async fn create_or_resume(
        &self,
        request: &OrderRequest,
        ascii: &[String],
    ) -> EngineResult<(Url, Order)> {
        if let Some(resume_url) = &request.order_resume_uri {
            debug!("Resuming existing order @ {resume_url}");
            let order = self
                .client
                .get_order(self.signer, resume_url)
                .await
                .map_err(EngineError::from)?;
            return Ok((resume_url.clone(), order));
        }
        let new_order = NewOrderRequest {
            identifiers: ascii
                .iter()
                .map(|name| Identifier::Dns { value: name.clone() })
                .collect(),
        };
        let mut attempts = CREATE_ATTEMPTS;
        loop {
            match self.client.new_order(self.signer, &new_order).await {
                Ok((order_url, order)) => {
                    debug!("Order URL: {order_url}");
                    return Ok((order_url, order));
                }
                Err(e) => {
                    let engine_err = EngineError::from(e);
                    attempts -= 1;
                    match &engine_err {
                        EngineError::Transient(inner) if attempts > 0 => {
                            warn!("Order creation failed ({inner:#}), retrying");
                            tokio::time::sleep(CREATE_BACKOFF).await;
                        }
                        _ => return Err(engine_err),
                    }
                }
            }
        }
    }

    async fn authorize_all(
        &self,
        request: &OrderRequest,
        names: &[DnsName],
        order: &Order,
    ) -> EngineResult<()> {
        for authz_url in &order.authorizations {
            debug!("Checking authorization @ {authz_url}");
            let authz = self
                .client
                .get_authorization(self.signer, authz_url)
                .await
                .map_err(EngineError::from)?;
            match authz.status {
                AuthorizationStatus::Valid => {
                    debug!("Authorization for {} already valid", authz.identifier);
                }
                AuthorizationStatus::Pending => {
                    self.authorize_one(request, names, authz_url, &authz).await?;
                }
                AuthorizationStatus::Invalid
                | AuthorizationStatus::Deactivated
                | AuthorizationStatus::Expired
                | AuthorizationStatus::Revoked => {
                    return Err(authorization_failure(&authz));
                }
            }
        }
        Ok(())
    }

    async fn authorize_one(
        &self,
        request: &OrderRequest,
        names: &[DnsName],
        authz_url: &Url,
        authz: &Authorization,
    ) -> EngineResult<()> {
        let identifier = matching_name(names, authz).ok_or_else(|| {
            EngineError::CaFailure(anyhow!(
                "Order contains a pending authorization for {}, which was not part of our request",
                authz.identifier
            ))
        })?;
        info!("Authorizing {identifier}");
        let challenge = select_challenge(authz, identifier, &request.challenge_preferences)
            .ok_or_else(|| {
                EngineError::ClientFailure(anyhow!(
                    "Authorization for {identifier} has no pending challenge matching the configured preferences"
                ))
            })?;
        let response =
            ChallengeResponse::prepare(self.signer, identifier, &challenge.inner_challenge)
                .ok_or_else(|| {
                    EngineError::ClientFailure(anyhow!(
                        "Cannot prepare a response for the selected challenge type"
                    ))
                })?;
        debug!(
            "Selected {} challenge @ {} for {identifier}",
            response.kind(),
            challenge.url
        );

        let handle = match &response {
            ChallengeResponse::Http01 {
                domain,
                token,
                key_authorization,
            } => {
                self.responder
                    .publish_http01(domain, token, key_authorization)
                    .await
            }
            ChallengeResponse::Dns01 {
                record_name,
                record_value,
            } => {
                self.responder
                    .publish_dns01(record_name, record_value, request.dns_propagation_delay)
                    .await
            }
        }
        .map_err(|e| {
            EngineError::ClientFailure(
                e.context(format!("Publishing challenge response for {identifier}")),
            )
        })?;
        debug!(
            "Responder {} acked challenge publication",
            self.responder.name()
        );

        // Whatever happens during validation, the published response is
        // removed again before returning
        let result = self
            .validate_and_await(identifier, authz_url, &challenge.url)
            .await;
        if let Err(e) = self.responder.cleanup(handle).await {
            warn!("Responder failed to clean up challenge response for {identifier}: {e:#}");
        }
        result
    }

    async fn validate_and_await(
        &self,
        identifier: &DnsName,
        authz_url: &Url,
        challenge_url: &Url,
    ) -> EngineResult<()> {
        let mut challenge = self
            .client
            .request_validation(self.signer, challenge_url)
            .await
            .map_err(EngineError::from)?;

        if !challenge_is_terminal(&challenge) {
            let polled = poll_until(
                CHALLENGE_POLL,
                || self.client.get_challenge(self.signer, challenge_url),
                challenge_is_terminal,
            )
            .await
            .map_err(EngineError::from)?;
            if let Some(polled) = polled {
                challenge = polled;
            } else {
                debug!(
                    "Challenge for {identifier} did not settle within its budget, \
                     falling back to polling the authorization"
                );
            }
        }
        if matches!(challenge.status, ChallengeStatus::Invalid) {
            return Err(self
                .challenge_failure(identifier, challenge_url, challenge.error)
                .await);
        }

        // The challenge may report valid before the authorization does; the
        // authorization is what gates finalization
        let authz = poll_until(
            AUTHORIZATION_POLL,
            || self.client.get_authorization(self.signer, authz_url),
            |authz: &Authorization| !matches!(authz.status, AuthorizationStatus::Pending),
        )
        .await
        .map_err(EngineError::from)?;
        match authz {
            Some(authz) if matches!(authz.status, AuthorizationStatus::Valid) => {
                info!("Successfully validated {identifier}");
                Ok(())
            }
            Some(authz) => Err(self
                .challenge_failure(identifier, challenge_url, failed_authz_problem(&authz))
                .await),
            None => Err(EngineError::Transient(anyhow!(
                "Timed out waiting for the authorization of {identifier} to settle"
            ))),
        }
    }

    /// Builds an `AuthorizationFailed` error, re-fetching the challenge for a
    /// problem document when the caller does not already have one.
    async fn challenge_failure(
        &self,
        identifier: &DnsName,
        challenge_url: &Url,
        known_problem: Option<Problem>,
    ) -> EngineError {
        let problem = match known_problem {
            Some(problem) => Some(problem),
            None => self
                .client
                .get_challenge(self.signer, challenge_url)
                .await
                .ok()
                .and_then(|challenge| challenge.error),
        };
        EngineError::AuthorizationFailed {
            identifier: identifier.as_ascii().to_string(),
            problem: problem.unwrap_or_else(|| Problem {
                typ: "urn:ietf:params:acme:error:unauthorized".to_string(),
                detail: Some("The CA rejected the challenge without details".to_string()),
                subproblems: vec![],
            }),
        }
    }

    async fn finalize(
        &self,
        request: &OrderRequest,
        mut order: Order,
        order_url: &Url,
        ascii: &[String],
    ) -> EngineResult<(Order, Option<KeyPair>)> {
        if matches!(order.status, OrderStatus::Pending) {
            // Authorizations are valid but the CA has not flipped the order yet
            let polled = poll_until(
                ORDER_READY_POLL,
                || self.client.get_order(self.signer, order_url),
                |order: &Order| !matches!(order.status, OrderStatus::Pending),
            )
            .await
            .map_err(EngineError::from)?;
            order = polled.ok_or(EngineError::FinalizationTimeout(
                "Order did not become ready after all authorizations were validated",
            ))?;
        }

        let mut cert_key = None;
        match order.status {
            OrderStatus::Ready => {
                let CsrMaterial { key, csr_der } = prepare_csr_material(
                    ascii,
                    request.csr_key_alg,
                    request.custom_csr_pem.as_deref(),
                    request.custom_private_key_pem.as_deref(),
                )
                .map_err(EngineError::AssemblyFailure)?;
                cert_key = key;
                debug!("Submitting CSR to {}", order.finalize);
                order = self
                    .client
                    .finalize_order(self.signer, &order.finalize, &csr_der)
                    .await
                    .map_err(EngineError::from)?;
            }
            OrderStatus::Processing => {
                debug!("Order is already processing, awaiting the CA");
            }
            OrderStatus::Valid => return Ok((order, None)),
            OrderStatus::Pending | OrderStatus::Invalid => {
                return Err(order_failure(
                    order.error,
                    "Order cannot be finalized from its current status",
                ));
            }
        }

        if !matches!(order.status, OrderStatus::Valid) {
            let polled = poll_until(
                ORDER_VALID_POLL,
                || self.client.get_order(self.signer, order_url),
                |order: &Order| {
                    matches!(order.status, OrderStatus::Valid | OrderStatus::Invalid)
                },
            )
            .await
            .map_err(EngineError::from)?;
            order = polled.ok_or(EngineError::FinalizationTimeout(
                "Order did not become valid after finalization",
            ))?;
        }
        if matches!(order.status, OrderStatus::Invalid) {
            return Err(order_failure(order.error, "Order failed after finalization"));
        }
        Ok((order, cert_key))
    }
}

fn challenge_is_terminal(challenge: &Challenge) -> bool {
    matches!(
        challenge.status,
        ChallengeStatus::Valid | ChallengeStatus::Invalid
    )
}

/// Maps an authorization resource back to the requested name it proves.
/// Wildcard authorizations carry the base name plus the wildcard flag.
fn matching_name<'n>(names: &'n [DnsName], authz: &Authorization) -> Option<&'n DnsName> {
    let value = authz.identifier.as_str();
    names.iter().find(|name| {
        if authz.wildcard || name.is_wildcard() {
            name.is_wildcard() && name.without_wildcard().as_ascii() == value
        } else {
            name.as_ascii() == value
        }
    })
}

fn failed_authz_problem(authz: &Authorization) -> Option<Problem> {
    authz
        .challenges
        .iter()
        .find_map(|challenge| challenge.error.clone())
}

fn authorization_failure(authz: &Authorization) -> EngineError {
    EngineError::AuthorizationFailed {
        identifier: authz.identifier.as_str().to_string(),
        problem: failed_authz_problem(authz).unwrap_or_else(|| Problem {
            typ: "urn:ietf:params:acme:error:unauthorized".to_string(),
            detail: Some(format!(
                "Authorization is in unusable state {:?}",
                authz.status
            )),
            subproblems: vec![],
        }),
    }
}

fn order_failure(problem: Option<Problem>, fallback: &'static str) -> EngineError {
    match problem {
        Some(problem) => EngineError::CaFailure(anyhow!("{fallback}: {problem}")),
        None => EngineError::CaFailure(anyhow!("{fallback} (no error reported by the CA)")),
    }
}
