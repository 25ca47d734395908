use crate::acme::object::{Nonce, Token};
use crate::crypto::asymmetric::{Curve, KeyPair};
use crate::crypto::{SignatureError, sha256};
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Serialize)]
pub struct ProtectedHeader {
    #[serde(rename = "alg")]
    algorithm: Algorithm,
    #[serde(skip_serializing_if = "Nonce::is_empty")]
    pub nonce: Nonce,
    #[serde(rename = "url")]
    target_url: Url,
    #[serde(flatten)]
    key: KeyParameters,
}

impl ProtectedHeader {
    pub fn new(algorithm: Algorithm, nonce: Nonce, target_url: Url, key: KeyParameters) -> Self {
        Self {
            algorithm,
            nonce,
            target_url,
            key,
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub enum Algorithm {
    #[serde(rename = "ES256")]
    EcdsaP256Sha256,
    #[serde(rename = "ES384")]
    EcdsaP384Sha384,
    #[serde(rename = "ES512")]
    EcdsaP521Sha512,
    #[serde(rename = "RS256")]
    RsaPkcs1Sha256,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum KeyParameters {
    /// Full public key, for requests made before an account exists (`newAccount`,
    /// and the inner `keyChange` envelope).
    #[serde(rename = "jwk")]
    FullKey(JsonWebKeyParameters),
    /// Account URL, for all authenticated requests.
    #[serde(rename = "kid")]
    AccountUrl(Url),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum JsonWebKeyParameters {
    Ecdsa(JsonWebKeyEcdsa),
    Rsa(JsonWebKeyRsa),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JsonWebKeyEcdsa {
    #[serde(rename = "kty")]
    key_type: &'static str,
    #[serde(rename = "crv")]
    curve: Curve,
    #[serde(rename = "x")]
    x_coordinate: String,
    #[serde(rename = "y")]
    y_coordinate: String,
}

impl JsonWebKeyEcdsa {
    pub fn new(curve: Curve, x_coordinate: String, y_coordinate: String) -> Self {
        Self {
            key_type: "EC",
            curve,
            x_coordinate,
            y_coordinate,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JsonWebKeyRsa {
    #[serde(rename = "kty")]
    key_type: &'static str,
    #[serde(rename = "n")]
    modulus: String,
    #[serde(rename = "e")]
    exponent: String,
}

impl JsonWebKeyRsa {
    pub fn new(modulus: String, exponent: String) -> Self {
        Self {
            key_type: "RSA",
            modulus,
            exponent,
        }
    }
}

pub const EMPTY_PAYLOAD: Option<&()> = None;

/// The signer: an account key pair together with the JWS envelope parameters
/// derived from it. Owned by the account manager; everything else signs through
/// a shared reference.
#[derive(Debug)]
pub struct JsonWebKey {
    keypair: KeyPair,
    parameters: KeyParameters,
    thumbprint: String,
}

impl JsonWebKey {
    fn compute_account_thumbprint(parameters: &JsonWebKeyParameters) -> String {
        // RFC 7638 thumbprints are computed over a JSON object with its members
        // in lexicographic order. serde_json does not guarantee member order, so
        // serialize by hand.
        let fixed_serialization = match parameters {
            JsonWebKeyParameters::Ecdsa(ecdsa) => {
                let crv = ecdsa.curve.as_str();
                let kty = ecdsa.key_type;
                let x = &ecdsa.x_coordinate;
                let y = &ecdsa.y_coordinate;
                format!(r#"{{"crv":"{crv}","kty":"{kty}","x":"{x}","y":"{y}"}}"#)
            }
            JsonWebKeyParameters::Rsa(rsa) => {
                let e = &rsa.exponent;
                let kty = rsa.key_type;
                let n = &rsa.modulus;
                format!(r#"{{"e":"{e}","kty":"{kty}","n":"{n}"}}"#)
            }
        };
        let hash = sha256(fixed_serialization.as_bytes());
        BASE64_URL_SAFE_NO_PAD.encode(hash.as_ref())
    }

    /// A signer for a key that has no account yet (uses `jwk` headers).
    pub fn new(keypair: KeyPair) -> Self {
        let parameters = keypair.to_jwk_parameters();
        let thumbprint = JsonWebKey::compute_account_thumbprint(&parameters);
        Self {
            keypair,
            parameters: KeyParameters::FullKey(parameters),
            thumbprint,
        }
    }

    /// A signer bound to an existing account (uses `kid` headers).
    pub fn new_existing(keypair: KeyPair, account_url: Url) -> Self {
        let parameters = keypair.to_jwk_parameters();
        let thumbprint = JsonWebKey::compute_account_thumbprint(&parameters);
        Self {
            keypair,
            parameters: KeyParameters::AccountUrl(account_url),
            thumbprint,
        }
    }

    #[must_use]
    pub fn into_existing(self, account_url: Url) -> Self {
        Self::new_existing(self.keypair, account_url)
    }

    pub fn into_keypair(self) -> KeyPair {
        self.keypair
    }

    /// The wrapped private key, PEM-serialized for persistence.
    pub fn keypair_pem(&self) -> Result<String, SignatureError> {
        Ok(self.keypair.to_pem()?.to_string())
    }

    pub fn algorithm(&self) -> Algorithm {
        self.keypair.jws_algorithm()
    }

    pub fn parameters(&self) -> &KeyParameters {
        &self.parameters
    }

    /// The public key parameters, independent of whether this signer is
    /// account-bound.
    pub fn public_parameters(&self) -> JsonWebKeyParameters {
        self.keypair.to_jwk_parameters()
    }

    pub fn sign<T: Serialize>(
        &self,
        header: &ProtectedHeader,
        payload: Option<&T>,
    ) -> Result<FlatJsonWebSignature, SignatureError> {
        let header = serde_json::to_string(header)?;
        let header = BASE64_URL_SAFE_NO_PAD.encode(header);
        let payload = match payload {
            None => String::new(),
            Some(payload) => {
                let payload = serde_json::to_string(payload)?;
                BASE64_URL_SAFE_NO_PAD.encode(payload)
            }
        };
        let to_sign = format!("{header}.{payload}");
        let signature = self.keypair.sign(to_sign.as_bytes())?;
        let signature = BASE64_URL_SAFE_NO_PAD.encode(signature);
        Ok(FlatJsonWebSignature {
            header,
            payload,
            signature,
        })
    }

    /// The RFC 7638 thumbprint, base64url-encoded, as used in key authorizations.
    pub fn acme_thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// Key authorization for a challenge token: `token "." thumbprint`.
    pub fn key_authorization(&self, token: &Token) -> String {
        let thumbprint = self.acme_thumbprint();
        format!("{token}.{thumbprint}")
    }

    /// The DNS-01 TXT record value for a challenge token:
    /// `base64url(SHA-256(key authorization))`.
    pub fn dns_txt_value(&self, token: &Token) -> String {
        let key_authorization = self.key_authorization(token);
        BASE64_URL_SAFE_NO_PAD.encode(sha256(key_authorization.as_bytes()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlatJsonWebSignature {
    #[serde(rename = "protected")]
    header: String,
    payload: String,
    signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::asymmetric::test_keys::{TEST_EC_256, TEST_RSA_PEM};
    use rstest::rstest;
    use std::str::FromStr;

    fn test_signer() -> JsonWebKey {
        JsonWebKey::new(KeyPair::from_pem(TEST_EC_256).unwrap())
    }

    #[test]
    fn test_serialize_protected_header_with_ecdsa() {
        let header = ProtectedHeader {
            algorithm: Algorithm::EcdsaP256Sha256,
            nonce: Nonce::try_from("QWERTZ".to_string()).unwrap(),
            target_url: Url::parse("https://example.com/protected-header-test").unwrap(),
            key: KeyParameters::FullKey(JsonWebKeyParameters::Ecdsa(JsonWebKeyEcdsa::new(
                Curve::P256,
                "MKBCTNIcKUSDii11ySs3526iDZ8AiTo7Tu6KPAqv7D4".to_string(),
                "4Etl6SRW2YiLUrN5vfvVHuhp7x8PxltmWWlbbM4IFyM".to_string(),
            ))),
        };
        let expected_header = r#"{
  "alg": "ES256",
  "nonce": "QWERTZ",
  "url": "https://example.com/protected-header-test",
  "jwk": {
    "kty": "EC",
    "crv": "P-256",
    "x": "MKBCTNIcKUSDii11ySs3526iDZ8AiTo7Tu6KPAqv7D4",
    "y": "4Etl6SRW2YiLUrN5vfvVHuhp7x8PxltmWWlbbM4IFyM"
  }
}"#;
        let actual_header = serde_json::to_string_pretty(&header).unwrap();
        assert_eq!(expected_header, actual_header);
    }

    #[test]
    fn test_serialize_protected_header_with_kid() {
        let header = ProtectedHeader {
            algorithm: Algorithm::RsaPkcs1Sha256,
            nonce: Nonce::try_from("QWERTZ".to_string()).unwrap(),
            target_url: Url::parse("https://example.com/protected-header-test").unwrap(),
            key: KeyParameters::AccountUrl(
                Url::parse("https://example.com/acct/42").unwrap(),
            ),
        };
        let expected_header = r#"{"alg":"RS256","nonce":"QWERTZ","url":"https://example.com/protected-header-test","kid":"https://example.com/acct/42"}"#;
        let actual_header = serde_json::to_string(&header).unwrap();
        assert_eq!(expected_header, actual_header);
    }

    #[rstest]
    #[case::rsa(JsonWebKeyParameters::Rsa(JsonWebKeyRsa::new("0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw".to_string(), "AQAB".to_string())), "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs")]
    #[case::ecdsa(
        JsonWebKeyParameters::Ecdsa(JsonWebKeyEcdsa::new(
            Curve::P256,
            "MKBCTNIcKUSDii11ySs3526iDZ8AiTo7Tu6KPAqv7D4".to_string(),
            "4Etl6SRW2YiLUrN5vfvVHuhp7x8PxltmWWlbbM4IFyM".to_string()
        )),
        "cn-I_WNMClehiVp51i_0VpOENW1upEerA8sEam5hn-s"
    )]
    fn test_compute_account_thumbprint(
        #[case] parameters: JsonWebKeyParameters,
        #[case] expected_thumbprint: &str,
    ) {
        let actual_thumbprint = JsonWebKey::compute_account_thumbprint(&parameters);
        assert_eq!(&actual_thumbprint, expected_thumbprint);
    }

    #[test]
    fn test_key_authorization_format() {
        let signer = test_signer();
        let token = Token::from_str("someToken").unwrap();
        let key_auth = signer.key_authorization(&token);
        let (token_part, thumbprint_part) = key_auth.split_once('.').unwrap();
        assert_eq!(token_part, "someToken");
        assert_eq!(thumbprint_part, signer.acme_thumbprint());
    }

    #[test]
    fn test_dns_txt_value_is_digest_of_key_authorization() {
        let signer = test_signer();
        let token = Token::from_str("evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA").unwrap();
        let expected =
            BASE64_URL_SAFE_NO_PAD.encode(sha256(signer.key_authorization(&token).as_bytes()));
        assert_eq!(signer.dns_txt_value(&token), expected);
        // base64url without padding over a 32-byte digest is always 43 chars
        assert_eq!(signer.dns_txt_value(&token).len(), 43);
    }

    #[test]
    fn test_signatures_are_deterministic_for_rsa() {
        let first = JsonWebKey::new(KeyPair::from_pem(TEST_RSA_PEM).unwrap());
        let second = JsonWebKey::new(KeyPair::from_pem(TEST_RSA_PEM).unwrap());
        let header = |signer: &JsonWebKey| {
            ProtectedHeader::new(
                signer.algorithm(),
                Nonce::try_from("fixedNonce".to_string()).unwrap(),
                Url::parse("https://example.com/sign-test").unwrap(),
                signer.parameters().clone(),
            )
        };
        let payload = serde_json::json!({"hello": "world"});
        let sig_one = first.sign(&header(&first), Some(&payload)).unwrap();
        let sig_two = second.sign(&header(&second), Some(&payload)).unwrap();
        // PKCS#1 v1.5 is deterministic, so reloading the same key must produce
        // byte-identical signatures
        assert_eq!(sig_one, sig_two);
    }
}
