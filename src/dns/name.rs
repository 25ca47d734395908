use hickory_resolver::Name;
use serde::de::{Error, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

/// A normalized DNS name: lowercased, treated as fully qualified, with both the
/// ASCII (punycode) and the UTF-8 representation precomputed. Order identifiers
/// and CSR names always use the ASCII form.
#[derive(Debug, Clone, Eq)]
pub struct DnsName {
    inner: Name,
    ascii: String,
    utf8: String,
}

impl DnsName {
    fn strip_root(name: String) -> String {
        name.strip_suffix('.').map(ToString::to_string).unwrap_or(name)
    }

    pub fn as_ascii(&self) -> &str {
        &self.ascii
    }

    pub fn as_utf8(&self) -> &str {
        &self.utf8
    }

    pub fn is_wildcard(&self) -> bool {
        self.inner.is_wildcard()
    }

    /// The name without a leading wildcard label, i.e. the name an
    /// authorization for this identifier covers.
    pub fn without_wildcard(&self) -> DnsName {
        if self.is_wildcard() {
            self.inner.base_name().into()
        } else {
            self.clone()
        }
    }

    /// The DNS-01 record name: `_acme-challenge.` prepended to the name with
    /// any wildcard label removed.
    pub fn to_acme_challenge_name(&self) -> Result<Self, ParseError> {
        let base = if self.is_wildcard() {
            &self.inner.base_name()
        } else {
            &self.inner
        };
        let acme_challenge_name = Name::from_ascii("_acme-challenge")?.append_name(base)?;
        Ok(acme_challenge_name.into())
    }
}

impl PartialEq<Self> for DnsName {
    fn eq(&self, other: &Self) -> bool {
        self.inner.eq(&other.inner)
    }
}

impl Hash for DnsName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.hash(state);
    }
}

impl Display for DnsName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_utf8())
    }
}

impl From<&Name> for DnsName {
    fn from(value: &Name) -> Self {
        // Normalization, to avoid inconsistencies as much as possible:
        // - all names are lowercased (commonly applied, if not required by RFC 5280)
        // - all names are treated as absolute (FQDN), as SANs do not distinguish
        //   between relative and absolute names
        let mut normalized = value.to_lowercase();
        normalized.set_fqdn(true);
        let ascii = Self::strip_root(normalized.to_ascii());
        let utf8 = Self::strip_root(normalized.to_utf8());
        Self {
            inner: normalized,
            ascii,
            utf8,
        }
    }
}

impl From<Name> for DnsName {
    fn from(value: Name) -> Self {
        (&value).into()
    }
}

impl TryFrom<&str> for DnsName {
    type Error = ParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(Name::from_str_relaxed(value)?.into())
    }
}

impl TryFrom<String> for DnsName {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.as_str().try_into()
    }
}

impl Serialize for DnsName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_utf8())
    }
}

struct DnsNameVisitor;

impl Visitor<'_> for DnsNameVisitor {
    type Value = DnsName;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a domain name string")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: Error,
    {
        DnsName::try_from(v).map_err(|e| E::custom(e.to_string()))
    }
}

impl<'de> Deserialize<'de> for DnsName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(DnsNameVisitor)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    ParseFailure(#[from] hickory_resolver::proto::error::ProtoError),
}

#[cfg(test)]
mod tests {
    use super::DnsName;
    use rstest::rstest;

    #[rstest]
    #[case("example.com", "example.com")]
    #[case("example.com.", "example.com")]
    #[case("UPPERCASE.COM", "uppercase.com")]
    #[case("Bücher.example", "bücher.example")]
    #[case("xn--bcher-kva.example", "bücher.example")]
    #[case("tld", "tld")]
    fn test_to_utf8(#[case] raw_name: &str, #[case] parsed_name: &str) {
        let parsed: DnsName = raw_name.try_into().unwrap();
        assert_eq!(parsed.as_utf8(), parsed_name);
    }

    #[rstest]
    #[case("example.com", "example.com")]
    #[case("example.com.", "example.com")]
    #[case("UPPERCASE.COM", "uppercase.com")]
    #[case("Bücher.example", "xn--bcher-kva.example")]
    #[case("Bücher.example.", "xn--bcher-kva.example")]
    #[case("xn--bcher-kva.example", "xn--bcher-kva.example")]
    #[case("*.bücher.example", "*.xn--bcher-kva.example")]
    #[case("tld", "tld")]
    fn test_to_ascii(#[case] raw_name: &str, #[case] ascii_name: &str) {
        let parsed: DnsName = raw_name.try_into().unwrap();
        assert_eq!(parsed.as_ascii(), ascii_name);
    }

    #[rstest]
    #[case("tld", false)]
    #[case("a.tld", false)]
    #[case("*.tld", true)]
    #[case("*.fqdn.example.com", true)]
    #[case("_weird_name.*.example.com", false)]
    fn test_is_wildcard(#[case] raw_name: &str, #[case] expected: bool) {
        let parsed: DnsName = raw_name.try_into().unwrap();
        assert_eq!(parsed.is_wildcard(), expected);
    }

    #[rstest]
    #[case("*.example.com", "example.com")]
    #[case("example.com", "example.com")]
    #[case("*.sub.example.com", "sub.example.com")]
    fn test_without_wildcard(#[case] raw_name: &str, #[case] expected: &str) {
        let parsed: DnsName = raw_name.try_into().unwrap();
        assert_eq!(parsed.without_wildcard().as_ascii(), expected);
    }

    #[rstest]
    #[case("example.com", "_acme-challenge.example.com")]
    #[case("fqdn.example.com", "_acme-challenge.fqdn.example.com")]
    #[case("*.example.com", "_acme-challenge.example.com")]
    #[case("*.sub.example.com", "_acme-challenge.sub.example.com")]
    fn test_to_acme_challenge_name(#[case] raw_name: &str, #[case] expected_name: &str) {
        let parsed: DnsName = raw_name.try_into().unwrap();
        let challenge_name = parsed.to_acme_challenge_name().unwrap();
        assert_eq!(challenge_name.as_ascii(), expected_name);
    }
}
