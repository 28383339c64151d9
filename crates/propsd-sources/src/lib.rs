//! Remote property sources for Propsd.
//!
//! This crate provides:
//! - The [`Source`] trait: lifecycle, status, events, and a parsed
//!   property tree
//! - A generic polling runner with etag/signature change detection
//! - `ObjectStoreSource` (S3 conditional GET)
//! - `MetadataSource` (EC2 instance metadata under the `instance` key)
//! - `CatalogSource` (Consul service catalog under the `consul` key)

pub mod consul;
pub mod metadata;
pub mod poller;
pub mod s3;
pub mod source;

pub use consul::{CatalogParameters, CatalogSource};
pub use metadata::{metadata_source, MetadataFetcher, MetadataParameters, MetadataSource};
pub use poller::{Fetch, FetchOutcome, PollingSource};
pub use s3::{object_store_source, DocumentFormat, ObjectStoreSource, S3Fetcher, S3Parameters};
pub use source::{Source, SourceError, SourceEvent, SourceState, SourceStatus};
