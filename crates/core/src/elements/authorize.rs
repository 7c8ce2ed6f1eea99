//! Admission control over the current path segment's token and peer identity.
//!
//! A policy-engine DSL is out of scope; policies are plain trait objects. The
//! server element admits or denies inbound requests, the client element
//! additionally pins the responding peer's identity for the connection's
//! lifetime and rejects responses from an imposter.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::chain::{Ctx, NetworkServiceStep, Next, PeerIdentity};
use crate::model::{Connection, NetworkServiceRequest, Path};
use crate::status::{Result, Status};

pub struct AuthCtx<'a> {
    pub peer: Option<&'a PeerIdentity>,
    pub path: &'a Path,
}

impl AuthCtx<'_> {
    pub fn current_token(&self) -> Option<&str> {
        self.path.current_segment().map(|s| s.token.as_str())
    }
}

pub trait Policy: Send + Sync {
    /// `Ok(false)` denies; evaluation errors surface as internal errors.
    fn check(&self, auth: &AuthCtx<'_>) -> std::result::Result<bool, String>;

    /// Whether a missing peer identity is a hard authentication failure.
    fn requires_identity(&self) -> bool {
        true
    }
}

pub struct AllowAll;

impl Policy for AllowAll {
    fn check(&self, _auth: &AuthCtx<'_>) -> std::result::Result<bool, String> {
        Ok(true)
    }

    fn requires_identity(&self) -> bool {
        false
    }
}

/// Admits only peers whose spiffe id is in the allow list.
pub struct SpiffeIdAllowList {
    allowed: HashSet<String>,
}

impl SpiffeIdAllowList {
    pub fn new(allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl Policy for SpiffeIdAllowList {
    fn check(&self, auth: &AuthCtx<'_>) -> std::result::Result<bool, String> {
        Ok(auth
            .peer
            .map(|p| self.allowed.contains(&p.spiffe_id))
            .unwrap_or(false))
    }
}

/// Admits peers from the given SPIFFE trust domain.
pub struct SameTrustDomain {
    trust_domain: String,
}

impl SameTrustDomain {
    pub fn new(trust_domain: impl Into<String>) -> Self {
        Self {
            trust_domain: trust_domain.into(),
        }
    }
}

impl Policy for SameTrustDomain {
    fn check(&self, auth: &AuthCtx<'_>) -> std::result::Result<bool, String> {
        Ok(auth
            .peer
            .and_then(|p| p.trust_domain())
            .map(|td| td == self.trust_domain)
            .unwrap_or(false))
    }
}

fn evaluate(policy: &dyn Policy, ctx: &Ctx, path: &Path) -> Result<()> {
    let peer = ctx.peer();
    if peer.is_none() && policy.requires_identity() {
        return Err(Status::unauthenticated("no peer identity on the call"));
    }
    let auth = AuthCtx {
        peer: peer.as_ref(),
        path,
    };
    match policy.check(&auth) {
        Ok(true) => Ok(()),
        Ok(false) => Err(Status::permission_denied("policy rejected the call")),
        Err(err) => Err(Status::internal(format!("policy evaluation failed: {err}"))),
    }
}

/// Server-side admission element.
pub struct AuthorizeStep {
    policy: Arc<dyn Policy>,
}

impl AuthorizeStep {
    pub fn new(policy: Arc<dyn Policy>) -> Arc<Self> {
        Arc::new(Self { policy })
    }
}

#[async_trait]
impl NetworkServiceStep for AuthorizeStep {
    async fn request(
        &self,
        ctx: &Ctx,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        evaluate(self.policy.as_ref(), ctx, &request.connection.path)?;
        next.request(ctx, request).await
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        evaluate(self.policy.as_ref(), ctx, &conn.path)?;
        next.close(ctx, conn).await
    }
}

/// Client-side element: admits the outgoing call, then verifies the
/// responding peer against the identity pinned on first success.
pub struct AuthorizeClientStep {
    policy: Arc<dyn Policy>,
    pinned: DashMap<String, PeerIdentity>,
}

impl AuthorizeClientStep {
    pub fn new(policy: Arc<dyn Policy>) -> Arc<Self> {
        Arc::new(Self {
            policy,
            pinned: DashMap::new(),
        })
    }
}

#[async_trait]
impl NetworkServiceStep for AuthorizeClientStep {
    async fn request(
        &self,
        ctx: &Ctx,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let id = request.connection.id.clone();
        let conn = next.request(ctx, request).await?;

        if let Some(observed) = ctx.peer() {
            match self.pinned.get(&id) {
                Some(expected) if *expected != observed => {
                    tracing::warn!(%id, expected = %expected.spiffe_id, observed = %observed.spiffe_id,
                        "responding peer does not match pinned identity");
                    return Err(Status::permission_denied(
                        "responding peer does not match the connection's server identity",
                    ));
                }
                Some(_) => {}
                None => {
                    self.pinned.insert(id, observed);
                }
            }
        }
        Ok(conn)
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        self.pinned.remove(&conn.id);
        next.close(ctx, conn).await
    }
}
