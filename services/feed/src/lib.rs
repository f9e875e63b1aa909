//! # Package Feed
//!
//! A package feed server speaking the NuGet v3 protocol.
//!
//! ## Features
//!
//! - Push, unlist, relist and delete packages
//! - Content-addressed package storage via the `storage` crate
//! - Registration metadata and an append-only catalog, both paged
//! - Search, autocomplete and reverse dependency lookup
//! - Optional mirroring of an upstream feed, with concurrent misses
//!   for the same package sharing one fetch
//! - Builder pattern for configuration, or a TOML file
//!
//! ## Example
//!
//! ```no_run
//! use feed::FeedBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["packages"]);
//! let app = FeedBuilder::new()
//!     .storage(storage.into())
//!     .bucket("packages")
//!     .base_url("http://localhost:5000")
//!     .router();
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

mod api;
pub mod catalog;
pub mod catalog_pages;
pub mod config;
pub mod content;
mod error;
mod feed;
pub mod id;
pub mod ingest;
pub mod manifest;
pub mod mirror;
pub mod protocol;
pub mod registration;
pub mod search;
pub mod version;

#[cfg(test)]
mod testing;

pub use api::FeedBuilder;
pub use config::{ConfigError, DeletionBehavior, FeedConfig};
pub use error::{FeedError, FeedResult};
pub use feed::{Feed, parse_key};
pub use id::{PackageId, PackageKey};
pub use version::PackageVersion;
