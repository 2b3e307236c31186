//! Trigger notification types

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::domain::run::TriggerContext;

type HmacSha256 = Hmac<Sha256>;

/// Accepted prefix on hex signatures
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// External change notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerNotification {
    pub repository: String,
    pub branch: String,
    pub change_ref: String,
    /// Hex HMAC-SHA256 of [`TriggerNotification::canonical_payload`],
    /// optionally prefixed with `sha256=`
    pub signature: String,
}

impl TriggerNotification {
    /// Bytes covered by the signature
    pub fn canonical_payload(&self) -> String {
        canonical_payload(&self.repository, &self.branch, &self.change_ref)
    }

    /// Builds a notification signed with `secret`
    pub fn signed(
        repository: impl Into<String>,
        branch: impl Into<String>,
        change_ref: impl Into<String>,
        secret: &str,
    ) -> Self {
        let mut notification = Self {
            repository: repository.into(),
            branch: branch.into(),
            change_ref: change_ref.into(),
            signature: String::new(),
        };
        notification.signature = sign(secret, &notification.canonical_payload());
        notification
    }

    /// Constant-time check of the signature against `secret`
    pub fn verify(&self, secret: &str) -> bool {
        verify(secret, &self.canonical_payload(), &self.signature)
    }

    pub fn context(&self) -> TriggerContext {
        TriggerContext {
            repository: self.repository.clone(),
            branch: self.branch.clone(),
            change_ref: self.change_ref.clone(),
        }
    }
}

/// Canonical signed form of a notification
pub fn canonical_payload(repository: &str, branch: &str, change_ref: &str) -> String {
    format!("{}\n{}\n{}", repository, branch, change_ref)
}

/// Hex HMAC-SHA256 of `payload`, prefixed with [`SIGNATURE_PREFIX`]
pub fn sign(secret: &str, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(payload.as_bytes());
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a hex signature, with or without the prefix. An empty secret
/// verifies nothing.
pub fn verify(secret: &str, payload: &str, signature: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let signature = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// FIFO admission lane: runs for the same repository and branch never overlap
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaneKey {
    pub repository: String,
    pub branch: String,
}

impl From<&TriggerContext> for LaneKey {
    fn from(ctx: &TriggerContext) -> Self {
        Self {
            repository: ctx.repository.clone(),
            branch: ctx.branch.clone(),
        }
    }
}

impl std::fmt::Display for LaneKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.repository, self.branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_notification_verifies() {
        let n = TriggerNotification::signed("acme/api", "main", "abc123", "s3cret");
        assert!(n.signature.starts_with(SIGNATURE_PREFIX));
        assert!(n.verify("s3cret"));
        assert!(!n.verify("other"));
        assert!(!n.verify(""));
    }

    #[test]
    fn test_signature_without_prefix() {
        let payload = canonical_payload("acme/api", "main", "abc123");
        let signature = sign("s3cret", &payload);
        let bare = signature.trim_start_matches(SIGNATURE_PREFIX);
        assert!(verify("s3cret", &payload, bare));
        assert!(!verify("s3cret", &payload, "not-hex"));
    }

    #[test]
    fn test_tampered_payload_fails() {
        let mut n = TriggerNotification::signed("acme/api", "main", "abc123", "s3cret");
        n.branch = "release".to_string();
        assert!(!n.verify("s3cret"));
    }
}
