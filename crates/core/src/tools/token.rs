//! Bearer token issuance for path segments.
//!
//! Real deployments issue SVID-backed JWTs; that is an external collaborator.
//! The SDK only needs an opaque token plus its expiration promise, so the
//! default generator mints random tokens with a configured lifetime.

use std::time::{Duration, SystemTime};

use crate::chain::PeerIdentity;
use crate::status::Result;

pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(10 * 60);

pub trait TokenGenerator: Send + Sync {
    /// Mint a token binding the local hop, optionally audience-bound to the
    /// peer that called us.
    fn generate(&self, peer: Option<&PeerIdentity>) -> Result<(String, SystemTime)>;
}

pub struct ExpiringTokenGenerator {
    lifetime: Duration,
}

impl ExpiringTokenGenerator {
    pub fn new(lifetime: Duration) -> Self {
        Self { lifetime }
    }
}

impl Default for ExpiringTokenGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_LIFETIME)
    }
}

impl TokenGenerator for ExpiringTokenGenerator {
    fn generate(&self, _peer: Option<&PeerIdentity>) -> Result<(String, SystemTime)> {
        let token = uuid::Uuid::new_v4().to_string();
        Ok((token, SystemTime::now() + self.lifetime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_expire_after_lifetime() {
        let gen = ExpiringTokenGenerator::new(Duration::from_secs(60));
        let before = SystemTime::now();
        let (t1, e1) = gen.generate(None).unwrap();
        let (t2, _) = gen.generate(None).unwrap();
        assert_ne!(t1, t2);
        assert!(e1 >= before + Duration::from_secs(59));
    }
}
