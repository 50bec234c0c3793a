//! # Previously, on seglift...
//!
//! 🎬 The bucket was far away. The network was flaky. The tests wanted to run
//! in under a second. Someone had to build a store so simple it lives entirely
//! in RAM, gone the moment you blink.
//!
//! `InMemoryStore` lists keys in byte order (like S3 does), pages them, and
//! serves bodies from a `BTreeMap`. It can also misbehave on purpose: per-key
//! delays to shuffle completion order, per-key failures to punch holes in the
//! sequence, and a listing failure for the "S3 is down" scene. It keeps count
//! of how many fetches ran at once, so tests can hold the pool to its promise.
//!
//! ⚠️ This is for tests and demos. If you're deploying this to prod, please
//! also deploy a therapist.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;

use super::{ListPage, ObjectStore};

/// 🔧 Objects to preload, straight from TOML.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct InMemoryStoreConfig {
    #[serde(default)]
    pub objects: Vec<InMemoryObject>,
    /// 📄 Keys per listing page
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

/// 📦 One preloaded object.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct InMemoryObject {
    pub key: String,
    pub body: String,
}

fn default_page_size() -> usize {
    1000
}

/// 🧠 The world's most cooperative object store. Unless told otherwise.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    objects: BTreeMap<String, Vec<u8>>,
    page_size: usize,
    delays: HashMap<String, Duration>,
    failing_keys: HashSet<String>,
    listing_fails: bool,
    // 📊 shared so clones handed to the pipeline still report back to the test
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    fetch_calls: Arc<AtomicUsize>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            page_size: default_page_size(),
            delays: HashMap::new(),
            failing_keys: HashSet::new(),
            listing_fails: false,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            fetch_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_config(config: &InMemoryStoreConfig) -> Self {
        config
            .objects
            .iter()
            .fold(Self::new().with_page_size(config.page_size), |store, object| {
                store.with_object(object.key.clone(), object.body.clone().into_bytes())
            })
    }

    pub fn with_object(mut self, key: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.objects.insert(key.into(), body.into());
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// ⏳ Make `fetch(key)` take `delay` before answering.
    pub fn with_delay(mut self, key: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(key.into(), delay);
        self
    }

    /// 💀 Make `fetch(key)` fail.
    pub fn with_failure(mut self, key: impl Into<String>) -> Self {
        self.failing_keys.insert(key.into());
        self
    }

    /// 💀 Make every listing call fail.
    pub fn with_listing_failure(mut self) -> Self {
        self.listing_fails = true;
        self
    }

    /// 📊 Highest number of fetches observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// 📊 Total fetch calls, failed ones included.
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

/// 🔒 Decrements the in-flight gauge even if the fetch future is dropped mid-sleep.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn list_page(&self, prefix: &str, continuation: Option<String>) -> Result<ListPage> {
        if self.listing_fails {
            bail!("💀 in-memory listing failure for prefix '{}', as requested", prefix);
        }

        // 🔄 the continuation token is just the offset into the filtered key list
        let offset = match continuation {
            Some(token) => token
                .parse::<usize>()
                .with_context(|| format!("💀 '{}' is not a continuation token we issued", token))?,
            None => 0,
        };

        let matching: Vec<&String> = self
            .objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .collect();
        let end = (offset + self.page_size).min(matching.len());
        let keys = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|key| (*key).clone())
            .collect();
        let continuation = (end < matching.len()).then(|| end.to_string());

        Ok(ListPage { keys, continuation })
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(Arc::clone(&self.in_flight));
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        if let Some(delay) = self.delays.get(key) {
            tokio::time::sleep(*delay).await;
        }

        if self.failing_keys.contains(key) {
            bail!("💀 in-memory fetch failure for '{}', as requested", key);
        }

        self.objects
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("💀 no such in-memory object: '{}'", key))
    }
}
