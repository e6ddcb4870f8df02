//! Provider Clients
//!
//! Everything the orchestrator knows about external model endpoints.
//!
//! # Variants
//!
//! - [`HttpProvider`]: remote endpoints ([`ProviderEndpoint::Anthropic`],
//!   [`ProviderEndpoint::OpenAiCompatible`])
//! - [`ScriptedProvider`]: offline echo provider and test double
//!
//! Adding a provider means registering another `Arc<dyn ProviderClient>` in
//! the [`crate::routing::ProviderRegistry`]; dispatch code never matches on
//! concrete types.

pub mod http;
pub mod scripted;
pub mod traits;

pub use http::{HttpProvider, ProviderEndpoint};
pub use scripted::{ScriptStep, ScriptedProvider};
pub use traits::{
    ErrorClass, FailureReason, ProviderClient, ProviderError, ProviderId, ProviderResponse,
    Usage,
};
