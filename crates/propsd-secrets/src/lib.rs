//! Secret resolution for Propsd.
//!
//! Property trees may carry sentinel nodes (mappings whose sole key is
//! `$tokend`) that reference secrets held by an external broker. This
//! crate collects those sentinels, resolves them with TTL caching, and
//! produces an overlay tree of substitutions. Resolution never fails a
//! build: every error degrades the affected path to `null` with a warning.

pub mod broker;
pub mod cache;
pub mod transformer;

pub use broker::{BrokerError, SecretBroker, TokendClient};
pub use cache::SecretCache;
pub use transformer::SecretTransformer;
