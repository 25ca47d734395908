use crate::acme::error::{Error, Problem};
use crate::crypto::jws::JsonWebKeyParameters;
use crate::util::serde_helper::optional_offset_date_time;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use url::Url;

/// The ACME directory resource: entry points for everything else.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Directory {
    pub new_nonce: Url,
    pub new_account: Url,
    pub new_order: Url,
    pub new_authz: Option<Url>,
    pub revoke_cert: Url,
    pub key_change: Url,
    pub meta: Option<Metadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Metadata {
    pub terms_of_service: Option<Url>,
    pub website: Option<Url>,
    #[serde(default)]
    pub caa_identities: Vec<String>,
    #[serde(default)]
    pub external_account_required: bool,
    #[serde(default)]
    pub profiles: HashMap<String, String>,
}

/// A replay nonce. Validated on construction: RFC 8555 nonces are base64url
/// strings, anything else is rejected early.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct Nonce(String);

impl Nonce {
    pub fn new_empty() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<String> for Nonce {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        for char in value.chars() {
            if char.is_ascii_alphanumeric() || char == '_' || char == '-' {
                continue;
            }
            return Err(Error::ProtocolViolation("Invalid nonce value"));
        }
        Ok(Self(value))
    }
}

impl FromStr for Nonce {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Nonce::try_from(s.to_string())
    }
}

impl Display for Nonce {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A challenge token, same character set restrictions as [`Nonce`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct Token(String);

impl TryFrom<String> for Token {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        for char in value.chars() {
            if char.is_ascii_alphanumeric() || char == '_' || char == '-' {
                continue;
            }
            return Err(Error::ProtocolViolation("Invalid token value"));
        }
        Ok(Self(value))
    }
}

impl FromStr for Token {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Token::try_from(s.to_string())
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Token {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRequest {
    #[serde(default)]
    pub contact: Vec<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service_agreed: Option<bool>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub only_return_existing: bool,
}

/// Payload for updating contact details on an existing account.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountUpdateRequest {
    pub contact: Vec<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service_agreed: Option<bool>,
}

/// Inner payload of a `keyChange` request; the envelope signing is handled by
/// the client.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyChangeRequest {
    pub account: Url,
    pub old_key: JsonWebKeyParameters,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Account {
    pub status: AccountStatus,
    #[serde(default)]
    pub contact: Vec<Url>,
    pub orders: Option<Url>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
    #[serde(other)]
    Unknown,
}

impl Display for AccountStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                AccountStatus::Valid => "valid",
                AccountStatus::Deactivated => "deactivated",
                AccountStatus::Revoked => "revoked",
                AccountStatus::Unknown => "unknown",
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "camelCase")]
pub enum Identifier {
    Dns {
        value: String,
    },
    #[serde(other)]
    Unknown,
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Identifier::Dns { value }
    }
}

impl FromStr for Identifier {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Identifier::from(s.to_string()))
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.to_string()
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let value: &str = self.borrow();
        write!(f, "{value}")
    }
}

impl Borrow<str> for Identifier {
    fn borrow(&self) -> &str {
        match self {
            Identifier::Dns { value } => value.as_str(),
            Identifier::Unknown => "unknown",
        }
    }
}

impl Identifier {
    pub fn as_str(&self) -> &str {
        self.borrow()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderRequest {
    pub identifiers: Vec<Identifier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Order {
    pub status: OrderStatus,
    #[serde(default, with = "optional_offset_date_time")]
    pub expires: Option<time::OffsetDateTime>,
    pub identifiers: Vec<Identifier>,
    #[serde(default, with = "optional_offset_date_time")]
    pub not_before: Option<time::OffsetDateTime>,
    #[serde(default, with = "optional_offset_date_time")]
    pub not_after: Option<time::OffsetDateTime>,
    pub error: Option<Problem>,
    pub authorizations: Vec<Url>,
    pub finalize: Url,
    pub certificate: Option<Url>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    #[serde(other)]
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    #[serde(default, with = "optional_offset_date_time")]
    pub expires: Option<time::OffsetDateTime>,
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub wildcard: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Deactivated,
    Expired,
    Revoked,
    #[serde(other)]
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Challenge {
    pub url: Url,
    pub status: ChallengeStatus,
    #[serde(default, with = "optional_offset_date_time")]
    pub validated: Option<time::OffsetDateTime>,
    pub error: Option<Problem>,
    #[serde(flatten)]
    pub inner_challenge: InnerChallenge,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    #[serde(other)]
    Invalid,
}

/// The challenge-type specific part of a challenge resource. Unsupported types
/// (such as tls-alpn-01) deserialize to `Unknown` and are filtered out before
/// challenge selection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
#[cfg_attr(test, derive(Serialize))]
pub enum InnerChallenge {
    #[serde(rename = "http-01")]
    Http(HttpChallenge),
    #[serde(rename = "dns-01")]
    Dns(DnsChallenge),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct HttpChallenge {
    pub token: Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct DnsChallenge {
    pub token: Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmptyObject {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub csr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deactivation {
    pub status: &'static str,
}

impl Deactivation {
    pub fn new() -> Self {
        Self {
            status: "deactivated",
        }
    }
}

impl Default for Deactivation {
    fn default() -> Self {
        Self::new()
    }
}

/// RFC 5280 CRL reason codes accepted by `revokeCert`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RevocationReason {
    #[default]
    Unspecified,
    KeyCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
}

impl RevocationReason {
    pub fn code(self) -> u8 {
        match self {
            RevocationReason::Unspecified => 0,
            RevocationReason::KeyCompromise => 1,
            RevocationReason::AffiliationChanged => 3,
            RevocationReason::Superseded => 4,
            RevocationReason::CessationOfOperation => 5,
        }
    }
}

impl Serialize for RevocationReason {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationRequest {
    /// base64url-encoded DER of the certificate to revoke
    pub certificate: String,
    pub reason: RevocationReason,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("\"valid\"", AccountStatus::Valid)]
    #[case("\"deactivated\"", AccountStatus::Deactivated)]
    #[case("\"revoked\"", AccountStatus::Revoked)]
    #[case("\"newExtendedAccountStatus\"", AccountStatus::Unknown)]
    fn test_deserialize_account_status(#[case] test_value: &str, #[case] expected: AccountStatus) {
        let account_status: AccountStatus = serde_json::from_str(test_value).unwrap();
        assert_eq!(account_status, expected);
    }

    #[rstest]
    #[case(r#"{"type":"dns","value":"example.com"}"#, "example.com")]
    fn test_deserialize_identifier(#[case] test_value: &str, #[case] expected: Identifier) {
        let identifier: Identifier = serde_json::from_str(test_value).unwrap();
        assert_eq!(identifier, expected);
    }

    #[rstest]
    #[case("\"pending\"", OrderStatus::Pending)]
    #[case("\"ready\"", OrderStatus::Ready)]
    #[case("\"processing\"", OrderStatus::Processing)]
    #[case("\"valid\"", OrderStatus::Valid)]
    #[case("\"invalid\"", OrderStatus::Invalid)]
    #[case("\"garbageStatus\"", OrderStatus::Invalid)]
    fn test_deserialize_order_status(#[case] test_value: &str, #[case] expected: OrderStatus) {
        let order_status: OrderStatus = serde_json::from_str(test_value).unwrap();
        assert_eq!(order_status, expected);
    }

    #[rstest]
    #[case("\"pending\"", ChallengeStatus::Pending)]
    #[case("\"processing\"", ChallengeStatus::Processing)]
    #[case("\"valid\"", ChallengeStatus::Valid)]
    #[case("\"invalid\"", ChallengeStatus::Invalid)]
    #[case("\"garbageStatus\"", ChallengeStatus::Invalid)]
    fn test_deserialize_challenge_status(
        #[case] test_value: &str,
        #[case] expected: ChallengeStatus,
    ) {
        let challenge_status: ChallengeStatus = serde_json::from_str(test_value).unwrap();
        assert_eq!(challenge_status, expected);
    }

    #[rstest]
    #[case(r#"{"type":"http-01","token":"QWERTZ"}"#, InnerChallenge::Http(
        HttpChallenge{ token: Token::from_str("QWERTZ").unwrap() }
    ))]
    #[case(r#"{"type":"dns-01","token":"QWERTZ"}"#, InnerChallenge::Dns(
        DnsChallenge{ token: Token::from_str("QWERTZ").unwrap() }
    ))]
    #[case(r#"{"type":"tls-alpn-01","token":"QWERTZ"}"#, InnerChallenge::Unknown)]
    fn test_deserialize_inner_challenge(
        #[case] test_value: &str,
        #[case] expected: InnerChallenge,
    ) {
        let challenge: InnerChallenge = serde_json::from_str(test_value).unwrap();
        assert_eq!(challenge, expected);
    }

    #[rstest]
    #[case("not a nonce!!")]
    #[case("also not=a=nonce")]
    fn test_invalid_nonce_rejected(#[case] value: &str) {
        assert!(Nonce::try_from(value.to_string()).is_err());
    }

    #[rstest]
    #[case(AccountRequest{
            contact: vec!(Url::parse("mailto:admin@example.org").unwrap()),
            terms_of_service_agreed: Some(true),
            only_return_existing: false,
        }, r#"{"contact":["mailto:admin@example.org"],"termsOfServiceAgreed":true}"#)]
    #[case(AccountRequest{
            contact: vec!(),
            terms_of_service_agreed: None,
            only_return_existing: true,
        }, r#"{"contact":[],"onlyReturnExisting":true}"#)]
    fn test_serialize_account_request(
        #[case] account_request: AccountRequest,
        #[case] expected: &str,
    ) {
        let serialized =
            serde_json::to_string(&account_request).expect("serialization must not fail");
        assert_eq!(serialized, expected);
    }

    #[rstest]
    #[case(NewOrderRequest {
        identifiers: vec![Identifier::from_str("example.com").unwrap()],
        },
        r#"{"identifiers":[{"type":"dns","value":"example.com"}]}"#)]
    #[case(NewOrderRequest {
        identifiers: vec![Identifier::from_str("example.com").unwrap(), Identifier::from_str("api.example.com").unwrap()],
        },
        r#"{"identifiers":[{"type":"dns","value":"example.com"},{"type":"dns","value":"api.example.com"}]}"#)]
    fn test_serialize_new_order_request(#[case] request: NewOrderRequest, #[case] expected: &str) {
        let serialized = serde_json::to_string(&request).expect("serialization must not fail");
        assert_eq!(serialized, expected);
    }

    #[test]
    fn test_serialize_empty_object() {
        let serialized =
            serde_json::to_string(&EmptyObject {}).expect("serialization must not fail");
        assert_eq!(serialized, r"{}");
    }

    #[test]
    fn test_serialize_deactivated() {
        let serialized =
            serde_json::to_string(&Deactivation::new()).expect("serialization must not fail");
        assert_eq!(serialized, r#"{"status":"deactivated"}"#);
    }

    #[test]
    fn test_serialize_revocation_request() {
        let request = RevocationRequest {
            certificate: "ZGVyLWJ5dGVz".to_string(),
            reason: RevocationReason::default(),
        };
        let serialized = serde_json::to_string(&request).unwrap();
        assert_eq!(serialized, r#"{"certificate":"ZGVyLWJ5dGVz","reason":0}"#);
    }

    #[test]
    fn test_deserialize_order() {
        let json = r#"{
            "status": "pending",
            "expires": "2026-01-20T14:09:07.99Z",
            "identifiers": [
                {"type": "dns", "value": "example.com"},
                {"type": "dns", "value": "*.example.com"}
            ],
            "authorizations": [
                "https://ca.example/authz/1",
                "https://ca.example/authz/2"
            ],
            "finalize": "https://ca.example/order/1/finalize"
        }"#;
        let order: Order = serde_json::from_str(json).unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.identifiers.len(), 2);
        assert_eq!(order.authorizations.len(), 2);
        assert!(order.certificate.is_none());
    }

    #[test]
    fn test_deserialize_authorization_with_wildcard() {
        let json = r#"{
            "identifier": {"type": "dns", "value": "example.com"},
            "status": "pending",
            "wildcard": true,
            "challenges": [
                {"type": "http-01", "url": "https://ca.example/chall/1", "status": "pending", "token": "tokenA"},
                {"type": "dns-01", "url": "https://ca.example/chall/2", "status": "pending", "token": "tokenB"}
            ]
        }"#;
        let authz: Authorization = serde_json::from_str(json).unwrap();
        assert!(authz.wildcard);
        assert_eq!(authz.challenges.len(), 2);
        assert_eq!(authz.status, AuthorizationStatus::Pending);
    }
}
