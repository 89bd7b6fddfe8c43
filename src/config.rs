//! Runtime configuration for the payment adapter.
//!
//! The only tunable in this release is the signature validation mode. It is
//! resolved from environment variables the way the node's operators already
//! configure it:
//!
//! - `X402_STRICT_VERIFY=1` or `X402_STRICT_VERIFY=true` enables strict mode.
//! - `X402_SIGNATURE_VALIDATION=strict` has the same effect.
//! - Anything else leaves the permissive default in place.

use std::env;

/// How payment signatures are validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureValidation {
    /// Accept only the canonical domain-separated message with EIP-191
    /// prefixed hashing.
    Strict,
    /// Accept a finite set of legacy message variants. A migration
    /// affordance; strict is the target.
    #[default]
    Permissive,
}

impl SignatureValidation {
    /// Resolves the mode from the two environment flag values.
    pub fn from_flags(strict_verify: Option<&str>, validation: Option<&str>) -> Self {
        let strict = matches!(strict_verify, Some(v) if v == "1" || v.eq_ignore_ascii_case("true"))
            || matches!(validation, Some(v) if v.eq_ignore_ascii_case("strict"));
        if strict { Self::Strict } else { Self::Permissive }
    }

    pub fn is_strict(self) -> bool {
        self == Self::Strict
    }
}

/// Adapter configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct X402Config {
    pub signature_validation: SignatureValidation,
}

impl X402Config {
    /// Reads configuration from the process environment and logs the
    /// selected signature mode.
    pub fn from_env() -> Self {
        let signature_validation = SignatureValidation::from_flags(
            env::var("X402_STRICT_VERIFY").ok().as_deref(),
            env::var("X402_SIGNATURE_VALIDATION").ok().as_deref(),
        );
        match signature_validation {
            SignatureValidation::Strict => {
                tracing::info!("strict payment signature verification enabled");
            }
            SignatureValidation::Permissive => {
                tracing::info!("strict payment signature verification disabled");
            }
        }
        Self {
            signature_validation,
        }
    }
}
