use crate::acme::error::{Error as AcmeError, Problem};
use std::fmt::{Debug, Display, Formatter};
use std::time::SystemTime;

pub type EngineResult<T> = Result<T, EngineError>;

/// The error taxonomy the engine exposes. Transient errors have already been
/// retried within their local budgets before surfacing; everything else
/// bubbles up unmodified for the caller to act on.
pub enum EngineError {
    /// Retry-eligible: network failures, timeouts, badNonce beyond its retry
    Transient(anyhow::Error),
    /// The CA enforced a rate limit; stop immediately
    RateLimited {
        problem: Problem,
        retry_after: Option<SystemTime>,
    },
    /// Key/URI mismatch, or the account is revoked, deactivated, or missing
    AccountInvalid(anyhow::Error),
    /// Updated terms of service or other human action needed
    UserActionRequired(anyhow::Error),
    /// An identifier could not be authorized
    AuthorizationFailed {
        identifier: String,
        problem: Problem,
    },
    /// The order never reached `ready`/`valid` within its polling allowance
    FinalizationTimeout(&'static str),
    /// CSR, key, or PKCS#12 packaging failure
    AssemblyFailure(anyhow::Error),
    RevocationFailed(anyhow::Error),
    /// The CA misbehaved in a way that is neither transient nor actionable
    CaFailure(anyhow::Error),
    /// The caller misused the engine (e.g. two runs on one order)
    ClientFailure(anyhow::Error),
}

impl EngineError {
    /// Classifies a protocol-level error into the engine taxonomy.
    pub(crate) fn from_acme(err: AcmeError) -> Self {
        match err {
            AcmeError::RateLimited(rate_limit) => EngineError::RateLimited {
                problem: rate_limit.problem,
                retry_after: rate_limit.retry_after,
            },
            AcmeError::AcmeProblem(problem) => {
                if problem.is_user_action_required() {
                    EngineError::UserActionRequired(anyhow::Error::new(AcmeError::AcmeProblem(
                        problem,
                    )))
                } else if problem.is_account_does_not_exist() || problem.is_auth_failure() {
                    EngineError::AccountInvalid(anyhow::Error::new(AcmeError::AcmeProblem(
                        problem,
                    )))
                } else if problem.is_server_failure() {
                    EngineError::Transient(anyhow::Error::new(AcmeError::AcmeProblem(problem)))
                } else {
                    EngineError::CaFailure(anyhow::Error::new(AcmeError::AcmeProblem(problem)))
                }
            }
            e @ (AcmeError::Http(_) | AcmeError::IoError(_) | AcmeError::TimedOut(_)) => {
                EngineError::Transient(anyhow::Error::new(e))
            }
            e @ (AcmeError::ProtocolViolation(_) | AcmeError::CryptoFailure(_)) => {
                EngineError::CaFailure(anyhow::Error::new(e))
            }
        }
    }
}

impl From<AcmeError> for EngineError {
    fn from(err: AcmeError) -> Self {
        EngineError::from_acme(err)
    }
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Transient(err) => write!(f, "transient failure: {err:#}"),
            EngineError::RateLimited { problem, .. } => {
                write!(f, "the CA enforced a rate limit: {problem}")
            }
            EngineError::AccountInvalid(err) => write!(f, "ACME account is unusable: {err:#}"),
            EngineError::UserActionRequired(err) => {
                write!(f, "the CA requires user action: {err:#}")
            }
            EngineError::AuthorizationFailed {
                identifier,
                problem,
            } => write!(f, "failed to authorize {identifier}: {problem}"),
            EngineError::FinalizationTimeout(msg) => {
                write!(f, "order finalization timed out: {msg}")
            }
            EngineError::AssemblyFailure(err) => {
                write!(f, "certificate assembly failed: {err:#}")
            }
            EngineError::RevocationFailed(err) => write!(f, "revocation failed: {err:#}"),
            EngineError::CaFailure(err) => write!(f, "the CA misbehaved: {err:#}"),
            EngineError::ClientFailure(err) => write!(f, "{err:#}"),
        }
    }
}

impl Debug for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl std::error::Error for EngineError {}

/// Shorthand conversions for `anyhow`-carrying operations.
pub(crate) trait EngineContext<T> {
    fn assembly_failure(self) -> EngineResult<T>;
    fn revocation_failure(self) -> EngineResult<T>;
    fn client_failure(self) -> EngineResult<T>;
}

impl<T> EngineContext<T> for Result<T, anyhow::Error> {
    fn assembly_failure(self) -> EngineResult<T> {
        self.map_err(EngineError::AssemblyFailure)
    }

    fn revocation_failure(self) -> EngineResult<T> {
        self.map_err(EngineError::RevocationFailed)
    }

    fn client_failure(self) -> EngineResult<T> {
        self.map_err(EngineError::ClientFailure)
    }
}
