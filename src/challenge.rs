use crate::acme::object::{Authorization, Challenge, ChallengeStatus, InnerChallenge, Token};
use crate::crypto::jws::JsonWebKey;
use crate::dns::name::DnsName;
use async_trait::async_trait;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// The challenge types this engine can drive.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    Http01,
    Dns01,
}

impl ChallengeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeKind::Http01 => "http-01",
            ChallengeKind::Dns01 => "dns-01",
        }
    }
}

impl Display for ChallengeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which challenge types the caller permits. An empty set means no restriction.
#[derive(Debug, Clone, Default)]
pub struct ChallengePreferences {
    enabled: Vec<ChallengeKind>,
}

impl ChallengePreferences {
    pub fn new(enabled: impl Into<Vec<ChallengeKind>>) -> Self {
        Self {
            enabled: enabled.into(),
        }
    }

    pub fn allows(&self, kind: ChallengeKind) -> bool {
        self.enabled.is_empty() || self.enabled.contains(&kind)
    }
}

/// The externally visible artifact that must be published before a challenge
/// can be validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeResponse {
    Http01 {
        domain: DnsName,
        token: Token,
        /// Served verbatim as the response body
        key_authorization: String,
    },
    Dns01 {
        /// `_acme-challenge.<domain without wildcard>`
        record_name: DnsName,
        /// base64url(SHA-256(key authorization))
        record_value: String,
    },
}

impl ChallengeResponse {
    /// Builds the publication artifact for a selected challenge.
    pub fn prepare(
        signer: &JsonWebKey,
        identifier: &DnsName,
        challenge: &InnerChallenge,
    ) -> Option<Self> {
        match challenge {
            InnerChallenge::Http(http) => Some(ChallengeResponse::Http01 {
                domain: identifier.clone(),
                token: http.token.clone(),
                key_authorization: signer.key_authorization(&http.token),
            }),
            InnerChallenge::Dns(dns) => Some(ChallengeResponse::Dns01 {
                record_name: identifier.to_acme_challenge_name().ok()?,
                record_value: signer.dns_txt_value(&dns.token),
            }),
            InnerChallenge::Unknown => None,
        }
    }

    pub fn kind(&self) -> ChallengeKind {
        match self {
            ChallengeResponse::Http01 { .. } => ChallengeKind::Http01,
            ChallengeResponse::Dns01 { .. } => ChallengeKind::Dns01,
        }
    }

    /// The well-known URL path an HTTP-01 response must be served under.
    pub fn http_path(&self) -> Option<String> {
        match self {
            ChallengeResponse::Http01 { token, .. } => {
                Some(format!("/.well-known/acme-challenge/{token}"))
            }
            ChallengeResponse::Dns01 { .. } => None,
        }
    }
}

/// Selects the challenge to attempt for one authorization. Wildcard
/// authorizations never select HTTP-01, regardless of preferences.
pub(crate) fn select_challenge<'a>(
    authz: &'a Authorization,
    identifier: &DnsName,
    preferences: &ChallengePreferences,
) -> Option<&'a Challenge> {
    let wildcard = authz.wildcard || identifier.is_wildcard();
    authz
        .challenges
        .iter()
        .filter(|challenge| matches!(challenge.status, ChallengeStatus::Pending))
        .find(|challenge| match &challenge.inner_challenge {
            InnerChallenge::Http(_) => !wildcard && preferences.allows(ChallengeKind::Http01),
            InnerChallenge::Dns(_) => preferences.allows(ChallengeKind::Dns01),
            InnerChallenge::Unknown => false,
        })
}

/// Opaque identifier for one published challenge response, handed back to the
/// responder for cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResponderHandle(String);

impl ResponderHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ResponderHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The external publisher of challenge responses. Implementations place files
/// on web servers or TXT records on authoritative nameservers; the engine only
/// waits for their ack.
#[async_trait]
pub trait ChallengeResponder: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish_http01(
        &self,
        domain: &DnsName,
        token: &Token,
        key_authorization: &str,
    ) -> anyhow::Result<ResponderHandle>;

    async fn publish_dns01(
        &self,
        record_name: &DnsName,
        record_value: &str,
        propagation_delay: Duration,
    ) -> anyhow::Result<ResponderHandle>;

    /// Best-effort removal of a previously published response.
    async fn cleanup(&self, handle: ResponderHandle) -> anyhow::Result<()>;
}

/// A responder that publishes nothing. Useful against CAs that accept anything
/// (test servers), and as a stand-in during dry runs.
#[derive(Debug, Default, Clone)]
pub struct NullResponder {}

#[async_trait]
impl ChallengeResponder for NullResponder {
    fn name(&self) -> &'static str {
        "null responder"
    }

    async fn publish_http01(
        &self,
        domain: &DnsName,
        token: &Token,
        _key_authorization: &str,
    ) -> anyhow::Result<ResponderHandle> {
        Ok(ResponderHandle::new(format!("http-01/{domain}/{token}")))
    }

    async fn publish_dns01(
        &self,
        record_name: &DnsName,
        _record_value: &str,
        _propagation_delay: Duration,
    ) -> anyhow::Result<ResponderHandle> {
        Ok(ResponderHandle::new(format!("dns-01/{record_name}")))
    }

    async fn cleanup(&self, _handle: ResponderHandle) -> anyhow::Result<()> {
        Ok(())
    }
}
