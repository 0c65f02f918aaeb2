//! Process-wide runtime context.
//!
//! Built once at startup and injected into every dispatch and invocation.
//! All shared state lives behind the collaborator handles held here.

use std::sync::Arc;

use anyhow::Context as _;

use super::config::RuntimeConfig;
use super::matcher::Matcher;
use super::patterns::PatternRegistry;
use crate::collab::audit::NoopAuditLog;
use crate::collab::cache::MemoryResponseCache;
use crate::collab::rate_limit::UnlimitedRateLimiter;
use crate::collab::routes::RouteTable;
use crate::collab::security::CredentialGate;
use crate::traits::{
    AuditLog, ChannelRegistry, IdentityLinker, RateLimiter, ResponseCache, SecurityGate,
    ServiceRegistry,
};

/// Default capacity of the built-in response cache.
const DEFAULT_CACHE_CAPACITY: usize = 10_000;

pub struct RuntimeContext {
    pub config: Arc<RuntimeConfig>,
    pub channels: Arc<dyn ChannelRegistry>,
    pub gate: Arc<dyn SecurityGate>,
    pub identity_linker: Option<Arc<dyn IdentityLinker>>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub audit: Arc<dyn AuditLog>,
    pub cache: Arc<dyn ResponseCache>,
    pub services: Arc<dyn ServiceRegistry>,
    pub patterns: Arc<PatternRegistry>,
    target_matcher: Option<Matcher>,
    invoke_matcher: Option<Matcher>,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("config", &self.config)
            .field("target_matcher", &self.target_matcher.is_some())
            .field("invoke_matcher", &self.invoke_matcher.is_some())
            .finish_non_exhaustive()
    }
}

impl RuntimeContext {
    #[must_use]
    pub fn builder(config: RuntimeConfig, services: Arc<dyn ServiceRegistry>) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            services,
            channels: None,
            gate: None,
            identity_linker: None,
            rate_limiter: None,
            audit: None,
            cache: None,
        }
    }

    /// `None` when the target matcher is disabled.
    #[must_use]
    pub fn target_matcher(&self) -> Option<&Matcher> {
        self.target_matcher.as_ref()
    }

    /// `None` when the invoke matcher is disabled.
    #[must_use]
    pub fn invoke_matcher(&self) -> Option<&Matcher> {
        self.invoke_matcher.as_ref()
    }
}

/// Assembles a [`RuntimeContext`], defaulting any collaborator not supplied.
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    services: Arc<dyn ServiceRegistry>,
    channels: Option<Arc<dyn ChannelRegistry>>,
    gate: Option<Arc<dyn SecurityGate>>,
    identity_linker: Option<Arc<dyn IdentityLinker>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    audit: Option<Arc<dyn AuditLog>>,
    cache: Option<Arc<dyn ResponseCache>>,
}

impl RuntimeBuilder {
    #[must_use]
    pub fn channels(mut self, channels: Arc<dyn ChannelRegistry>) -> Self {
        self.channels = Some(channels);
        self
    }

    #[must_use]
    pub fn gate(mut self, gate: Arc<dyn SecurityGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    #[must_use]
    pub fn identity_linker(mut self, linker: Arc<dyn IdentityLinker>) -> Self {
        self.identity_linker = Some(linker);
        self
    }

    #[must_use]
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// # Errors
    ///
    /// Returns an error if a matcher pattern fails to compile.
    pub fn build(self) -> anyhow::Result<Arc<RuntimeContext>> {
        let target_matcher = self
            .config
            .target_matcher
            .as_ref()
            .map(Matcher::new)
            .transpose()
            .context("invalid target matcher pattern")?;
        let invoke_matcher = self
            .config
            .invoke_matcher
            .as_ref()
            .map(Matcher::new)
            .transpose()
            .context("invalid invoke matcher pattern")?;

        Ok(Arc::new(RuntimeContext {
            config: Arc::new(self.config),
            channels: self.channels.unwrap_or_else(|| Arc::new(RouteTable::new())),
            gate: self.gate.unwrap_or_else(|| Arc::new(CredentialGate::new())),
            identity_linker: self.identity_linker,
            rate_limiter: self
                .rate_limiter
                .unwrap_or_else(|| Arc::new(UnlimitedRateLimiter)),
            audit: self.audit.unwrap_or_else(|| Arc::new(NoopAuditLog)),
            cache: self
                .cache
                .unwrap_or_else(|| Arc::new(MemoryResponseCache::new(DEFAULT_CACHE_CAPACITY))),
            services: self.services,
            patterns: Arc::new(PatternRegistry::new()),
            target_matcher,
            invoke_matcher,
        }))
    }
}
