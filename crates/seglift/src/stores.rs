//! 🔌 Stores: where the remote objects live.
//!
//! 🪣 The pipeline needs exactly two things from an object store: a prefix
//! listing, one page at a time, and the body of an object by key. Retries,
//! credentials and regions are the store's problem. We just ask nicely.
//!
//! 🧠 Knowledge graph:
//! - Pattern: trait → concrete impls (`S3ObjectStore`, `InMemoryStore`) → `StoreBackend` enum
//! - `StoreBackend::from_config()` resolves the enum from `StoreConfig`
//! - The selector pages through `list_page`; fetch workers call `fetch`
//!
//! 🦆 The duck has read-only access. It has never once complained about it.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

pub mod in_mem;
pub mod s3;

pub use in_mem::{InMemoryObject, InMemoryStore, InMemoryStoreConfig};
pub use s3::{S3ObjectStore, S3StoreConfig};

/// 📄 One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// 🗝️ Keys in listing order
    pub keys: Vec<String>,
    /// 🔄 `Some(token)` when there is another page to fetch
    pub continuation: Option<String>,
}

/// 🪣 The remote object store, as far as seglift cares.
///
/// # Contract 📜
/// - `list_page(prefix, None)` returns the first page; pass the returned
///   continuation back in until it comes back `None`.
/// - `fetch(key)` returns the entire body. Errors are per-object and the
///   pipeline treats them as such.
#[async_trait]
pub trait ObjectStore: std::fmt::Debug + Send + Sync {
    /// 📄 List one page of keys under `prefix`.
    async fn list_page(&self, prefix: &str, continuation: Option<String>) -> Result<ListPage>;

    /// 📥 Download the body of `key`.
    async fn fetch(&self, key: &str) -> Result<Vec<u8>>;
}

/// 🔧 Which store to talk to. Externally tagged, so TOML reads `[store.S3]`.
#[derive(Debug, Deserialize, Clone)]
pub enum StoreConfig {
    S3(S3StoreConfig),
    InMemory(InMemoryStoreConfig),
}

/// 🎭 The many faces of a store. Callers never need to know whether the bytes
/// came from sa-east-1 or from a `BTreeMap` in a unit test.
#[derive(Debug)]
pub enum StoreBackend {
    S3(S3ObjectStore),
    InMemory(InMemoryStore),
}

impl StoreBackend {
    /// 🔧 Build the backend described by the config.
    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        match config {
            StoreConfig::S3(s3_config) => {
                Ok(Self::S3(S3ObjectStore::new(s3_config.clone()).await?))
            }
            StoreConfig::InMemory(mem_config) => Ok(Self::InMemory(InMemoryStore::from_config(
                mem_config,
            ))),
        }
    }
}

#[async_trait]
impl ObjectStore for StoreBackend {
    async fn list_page(&self, prefix: &str, continuation: Option<String>) -> Result<ListPage> {
        match self {
            StoreBackend::S3(s3) => s3.list_page(prefix, continuation).await,
            StoreBackend::InMemory(mem) => mem.list_page(prefix, continuation).await,
        }
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        match self {
            StoreBackend::S3(s3) => s3.fetch(key).await,
            StoreBackend::InMemory(mem) => mem.fetch(key).await,
        }
    }
}
