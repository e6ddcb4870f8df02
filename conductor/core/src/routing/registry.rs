//! Provider Registry
//!
//! Holds the configured providers and the per-domain fallback chains.
//! Both are fixed once the registry is built; the only thing that changes at
//! runtime is provider health, which lives in the shared [`HealthMonitor`].
//!
//! # Chain Resolution
//!
//! 1. Providers named on the task, in the order given
//! 2. Otherwise the chain configured for the task's domain
//! 3. Otherwise the `general` chain
//! 4. Otherwise every provider, in registration order
//!
//! The result is then filtered by circuit state: providers whose breaker is
//! open are reported separately so that diagnostics can mention them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::domain::Domain;
use crate::provider::{ProviderClient, ProviderId};
use crate::routing::health::{HealthConfig, HealthMonitor};

/// Default maximum fallback chain length
pub const DEFAULT_MAX_CHAIN_DEPTH: usize = 8;

/// Errors building a registry
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Two providers share an identifier
    #[error("Provider registered twice: {provider}")]
    DuplicateProvider {
        /// Offending identifier
        provider: ProviderId,
    },

    /// A chain references a provider that is not configured
    #[error("Chain for {domain} references unknown provider: {provider}")]
    UnknownProvider {
        /// Domain of the chain
        domain: Domain,
        /// Missing identifier
        provider: ProviderId,
    },

    /// A provider appears twice in one chain
    #[error("Cycle detected in {domain} fallback chain at provider: {provider}")]
    CycleDetected {
        /// Domain of the chain
        domain: Domain,
        /// Repeated identifier
        provider: ProviderId,
    },

    /// A chain is longer than allowed
    #[error("Chain for {domain} has depth {depth}, exceeding maximum {max}")]
    ChainTooDeep {
        /// Domain of the chain
        domain: Domain,
        /// Actual length
        depth: usize,
        /// Allowed length
        max: usize,
    },

    /// A chain is configured but lists no providers
    #[error("Chain for {domain} is empty")]
    EmptyChain {
        /// Domain of the chain
        domain: Domain,
    },
}

/// Chain filtered by health
#[derive(Clone)]
pub struct Resolution {
    /// Candidates whose circuit admits traffic, in chain order
    pub eligible: Vec<Arc<dyn ProviderClient>>,
    /// Candidates skipped because their circuit is open, in chain order
    pub excluded: Vec<ProviderId>,
    /// Every resolved candidate, eligible or not, in chain order
    pub chain: Vec<ProviderId>,
}

impl Resolution {
    /// Identifiers of the eligible providers
    #[must_use]
    pub fn eligible_ids(&self) -> Vec<ProviderId> {
        self.eligible.iter().map(|p| p.id().clone()).collect()
    }

    /// Position of a provider in the resolved chain
    #[must_use]
    pub fn position(&self, id: &ProviderId) -> Option<usize> {
        self.chain.iter().position(|candidate| candidate == id)
    }

    /// Whether no candidate can be called
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.eligible.is_empty()
    }
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolution")
            .field("eligible", &self.eligible_ids())
            .field("excluded", &self.excluded)
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Configured providers and their per-domain fallback chains
pub struct ProviderRegistry {
    providers: HashMap<ProviderId, Arc<dyn ProviderClient>>,
    /// Registration order
    order: Vec<ProviderId>,
    chains: BTreeMap<Domain, Vec<ProviderId>>,
    health: Arc<HealthMonitor>,
}

impl ProviderRegistry {
    /// Start building a registry
    #[must_use]
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    /// Shared health monitor
    #[must_use]
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Look up a provider
    #[must_use]
    pub fn provider(&self, id: &ProviderId) -> Option<Arc<dyn ProviderClient>> {
        self.providers.get(id).cloned()
    }

    /// Whether a provider is configured
    #[must_use]
    pub fn contains(&self, id: &ProviderId) -> bool {
        self.providers.contains_key(id)
    }

    /// All providers, in registration order
    pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn ProviderClient>> {
        self.order.iter().filter_map(|id| self.providers.get(id))
    }

    /// Configured chains
    #[must_use]
    pub fn chains(&self) -> &BTreeMap<Domain, Vec<ProviderId>> {
        &self.chains
    }

    /// Number of providers
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no provider is configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Unfiltered fallback chain for a domain
    #[must_use]
    pub fn chain(&self, domain: Domain) -> &[ProviderId] {
        self.chains
            .get(&domain)
            .or_else(|| self.chains.get(&Domain::General))
            .map_or(self.order.as_slice(), Vec::as_slice)
    }

    /// Fallback chain for a domain, filtered by health
    #[must_use]
    pub fn resolve(&self, domain: Domain) -> Resolution {
        self.resolve_for(domain, &[])
    }

    /// Candidates for a task, filtered by health
    ///
    /// `requested` overrides the domain chain when non-empty. Unknown and
    /// repeated identifiers are dropped.
    #[must_use]
    pub fn resolve_for(&self, domain: Domain, requested: &[ProviderId]) -> Resolution {
        let candidates = if requested.is_empty() {
            self.chain(domain)
        } else {
            requested
        };

        let mut seen = HashSet::new();
        let mut resolution = Resolution {
            eligible: Vec::with_capacity(candidates.len()),
            excluded: Vec::new(),
            chain: Vec::with_capacity(candidates.len()),
        };

        for id in candidates {
            if !seen.insert(id) {
                continue;
            }
            let Some(provider) = self.providers.get(id) else {
                tracing::warn!(provider = %id, domain = %domain, "Skipping unknown provider");
                continue;
            };
            resolution.chain.push(id.clone());
            if self.health.admits_traffic(id) {
                resolution.eligible.push(provider.clone());
            } else {
                resolution.excluded.push(id.clone());
            }
        }

        resolution
    }

    /// First identifier in `ids` that is not configured
    #[must_use]
    pub fn find_unknown<'a>(&self, ids: &'a [ProviderId]) -> Option<&'a ProviderId> {
        ids.iter().find(|id| !self.providers.contains_key(*id))
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.order)
            .field("chains", &self.chains)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`ProviderRegistry`]
pub struct ProviderRegistryBuilder {
    providers: Vec<Arc<dyn ProviderClient>>,
    chains: BTreeMap<Domain, Vec<ProviderId>>,
    health_config: HealthConfig,
    max_chain_depth: usize,
}

impl Default for ProviderRegistryBuilder {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            chains: BTreeMap::new(),
            health_config: HealthConfig::default(),
            max_chain_depth: DEFAULT_MAX_CHAIN_DEPTH,
        }
    }
}

impl ProviderRegistryBuilder {
    /// Register a provider
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn ProviderClient>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Set the fallback chain for a domain
    #[must_use]
    pub fn chain<I, P>(mut self, domain: Domain, chain: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ProviderId>,
    {
        self.chains
            .insert(domain, chain.into_iter().map(Into::into).collect());
        self
    }

    /// Set the health configuration
    #[must_use]
    pub fn health_config(mut self, config: HealthConfig) -> Self {
        self.health_config = config;
        self
    }

    /// Set the maximum chain length
    #[must_use]
    pub fn max_chain_depth(mut self, depth: usize) -> Self {
        self.max_chain_depth = depth;
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<ProviderRegistry, RegistryError> {
        let health = Arc::new(HealthMonitor::with_config(self.health_config));
        let mut providers = HashMap::with_capacity(self.providers.len());
        let mut order = Vec::with_capacity(self.providers.len());

        for provider in self.providers {
            let id = provider.id().clone();
            if providers.contains_key(&id) {
                return Err(RegistryError::DuplicateProvider { provider: id });
            }
            health.register(&id);
            order.push(id.clone());
            providers.insert(id, provider);
        }

        for (&domain, chain) in &self.chains {
            validate_chain(domain, chain, &providers, self.max_chain_depth)?;
        }

        Ok(ProviderRegistry {
            providers,
            order,
            chains: self.chains,
            health,
        })
    }
}

fn validate_chain(
    domain: Domain,
    chain: &[ProviderId],
    providers: &HashMap<ProviderId, Arc<dyn ProviderClient>>,
    max_depth: usize,
) -> Result<(), RegistryError> {
    if chain.is_empty() {
        return Err(RegistryError::EmptyChain { domain });
    }
    if chain.len() > max_depth {
        return Err(RegistryError::ChainTooDeep {
            domain,
            depth: chain.len(),
            max: max_depth,
        });
    }

    let mut seen = HashSet::new();
    for id in chain {
        if !providers.contains_key(id) {
            return Err(RegistryError::UnknownProvider {
                domain,
                provider: id.clone(),
            });
        }
        if !seen.insert(id) {
            return Err(RegistryError::CycleDetected {
                domain,
                provider: id.clone(),
            });
        }
    }
    Ok(())
}
