//! Aether marketplace SDK.
//!
//! Providers list services on an in-process hub; consumers discover them
//! and open signed, ordered conversations to negotiate a quote and receive
//! a result.
//!
//! The crate root re-exports the data model ([`types`]), the provider
//! facade and the consumer facade with its conversation wrapper. The
//! remaining modules are public for embedders that need the hub, config
//! or identity plumbing directly.

pub mod config;
pub mod consumer;
pub mod error;
pub mod hub;
pub mod identity;
pub mod logger;
pub mod provider;
pub mod services;
pub mod transcript;
pub mod types;

pub use consumer::{ConversationWrapper, MarketplaceConsumer};
pub use provider::MarketplaceProvider;
pub use types::*;
