//! Client chain builder: what a workload runs to reach its manager.

use std::sync::Arc;

use async_trait::async_trait;

use crate::chain::metadata::MetadataStep;
use crate::chain::{ChainSlot, Ctx, NetworkServiceStep, Next, ServiceChain};
use crate::elements::authorize::{AllowAll, AuthorizeClientStep, Policy};
use crate::elements::begin::BeginStep;
use crate::elements::clientinfo::ClientInfoStep;
use crate::elements::connect::ConnectStep;
use crate::elements::excludedprefixes::ExcludedPrefixesStep;
use crate::elements::heal::{HealOptions, HealStep};
use crate::elements::refresh::RefreshStep;
use crate::elements::updatepath::UpdatePathStep;
use crate::model::{Connection, NetworkServiceRequest};
use crate::status::Result;
use crate::tools::token::TokenGenerator;
use crate::transport::Dialer;

/// Installs the fixed next-hop URL (the local manager) on every call.
struct ClientUrlStep {
    url: String,
}

#[async_trait]
impl NetworkServiceStep for ClientUrlStep {
    async fn request(
        &self,
        ctx: &Ctx,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        ctx.set_client_url(&self.url);
        next.request(ctx, request).await
    }

    async fn close(&self, ctx: &Ctx, conn: Connection, next: Next<'_>) -> Result<()> {
        ctx.set_client_url(&self.url);
        next.close(ctx, conn).await
    }
}

pub struct ClientBuilder {
    name: String,
    manager_url: String,
    tokens: Arc<dyn TokenGenerator>,
    dialer: Arc<dyn Dialer>,
    policy: Arc<dyn Policy>,
    heal_options: HealOptions,
    excluded_prefixes: Option<Arc<ExcludedPrefixesStep>>,
    with_client_info: bool,
}

impl ClientBuilder {
    pub fn new(
        name: impl Into<String>,
        manager_url: impl Into<String>,
        tokens: Arc<dyn TokenGenerator>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            name: name.into(),
            manager_url: manager_url.into(),
            tokens,
            dialer,
            policy: Arc::new(AllowAll),
            heal_options: HealOptions::default(),
            excluded_prefixes: None,
            with_client_info: false,
        }
    }

    pub fn policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn heal_options(mut self, options: HealOptions) -> Self {
        self.heal_options = options;
        self
    }

    pub fn excluded_prefixes(mut self, step: Arc<ExcludedPrefixesStep>) -> Self {
        self.excluded_prefixes = Some(step);
        self
    }

    /// Inject NODE_NAME/POD_NAME/CLUSTER_NAME labels from the environment.
    pub fn client_info(mut self) -> Self {
        self.with_client_info = true;
        self
    }

    pub fn build(self) -> Arc<ServiceChain> {
        let slot = ChainSlot::new();
        let mut steps: Vec<Arc<dyn NetworkServiceStep>> = vec![
            BeginStep::new(slot.clone()),
            MetadataStep::client(),
            UpdatePathStep::new(self.name, self.tokens),
            RefreshStep::new(),
        ];
        if self.with_client_info {
            steps.push(ClientInfoStep::new());
        }
        if let Some(excluded) = self.excluded_prefixes {
            steps.push(excluded);
        }
        steps.push(HealStep::with_options(self.heal_options));
        steps.push(AuthorizeClientStep::new(self.policy));
        steps.push(Arc::new(ClientUrlStep {
            url: self.manager_url,
        }));
        steps.push(ConnectStep::new(self.dialer));

        let chain = ServiceChain::new(steps);
        slot.bind(Arc::clone(&chain));
        chain
    }
}
