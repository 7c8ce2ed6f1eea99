//! Mechanism negotiation helpers.
//!
//! Mechanism drivers themselves are external collaborators; these elements
//! only move preference lists around. [`SelectMechanismStep`] sits at an
//! endpoint and commits to the first preference it supports.
//! [`MechanismTranslationStep`] sits in a forwarder and isolates the inbound
//! half's mechanism from whatever the outbound half negotiates.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::chain::{Ctx, NetworkServiceStep, Next};
use crate::model::{Connection, Mechanism, NetworkServiceRequest};
use crate::status::{Result, Status};

pub struct SelectMechanismStep {
    supported: Vec<String>,
}

impl SelectMechanismStep {
    /// `supported` lists mechanism kinds in preference order; empty accepts
    /// anything.
    pub fn new(supported: Vec<String>) -> Arc<Self> {
        Arc::new(Self { supported })
    }
}

#[async_trait]
impl NetworkServiceStep for SelectMechanismStep {
    async fn request(
        &self,
        ctx: &Ctx,
        mut request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        if request.connection.mechanism.is_none() {
            let picked = request
                .mechanism_preferences
                .iter()
                .find(|m| self.supported.is_empty() || self.supported.contains(&m.kind))
                .cloned();
            match picked {
                Some(mechanism) => request.connection.mechanism = Some(mechanism),
                None if request.mechanism_preferences.is_empty() => {
                    request.connection.mechanism = Some(Mechanism::default());
                }
                None => {
                    return Err(Status::invalid_argument(
                        "no supported mechanism among the preferences",
                    ));
                }
            }
        }
        next.request(ctx, request).await
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        next.close(ctx, conn).await
    }
}

/// Remembers the inbound mechanism per connection and restores it on the
/// response, letting the outbound half negotiate independently.
pub struct MechanismTranslationStep {
    inbound: DashMap<String, (Option<Mechanism>, Vec<Mechanism>)>,
}

impl MechanismTranslationStep {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inbound: DashMap::new(),
        })
    }
}

#[async_trait]
impl NetworkServiceStep for MechanismTranslationStep {
    async fn request(
        &self,
        ctx: &Ctx,
        mut request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let id = request.connection.id.clone();
        let saved = (
            request.connection.mechanism.take(),
            std::mem::take(&mut request.mechanism_preferences),
        );
        self.inbound.insert(id.clone(), saved.clone());

        let mut conn = next.request(ctx, request).await?;
        // The upstream keeps its own mechanism view, whatever the outbound
        // half agreed on.
        conn.mechanism = saved.0.or_else(|| saved.1.first().cloned());
        Ok(conn)
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        self.inbound.remove(&conn.id);
        next.close(ctx, conn).await
    }
}
