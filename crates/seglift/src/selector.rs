//! 🔎 Object Selector: list a prefix, keep what falls inside the time window.
//!
//! RDS log segment names carry their own birth certificate:
//!
//! ```text
//! pid/rds_log_391c219c198f5a5ccc5f37a1_1698228000
//!     ^^^ ^^^ ^^^^^^^^^^^^^^^^^^^^^^^^ ^^^^^^^^^^
//!      0   1             2                 3  ← Unix epoch seconds
//! ```
//!
//! The name (last path segment) must split on `_` into exactly four fields,
//! and field 3 must be a base-10 integer. Anything else is not a segment we
//! understand, and it is skipped without fuss. A listing failure, on the other
//! hand, is fatal: better to fail before a single byte is downloaded than to
//! replay half a window.
//!
//! 🧠 Knowledge graph:
//! - Output order is listing order (S3 lists keys in byte order, which for these
//!   names is chronological). Indices are handed out once, here, and never again.

use anyhow::{Context, Result};
use tracing::{info, trace};

use crate::common::ObjectDescriptor;
use crate::stores::ObjectStore;

/// ✂️ Field delimiter inside a segment name.
pub const NAME_DELIMITER: char = '_';
/// 🔢 A well-formed name has exactly this many fields.
pub const NAME_FIELD_COUNT: usize = 4;
/// ⏱️ The field holding the epoch timestamp (0-indexed).
pub const TIMESTAMP_FIELD: usize = 3;

/// ⏱️ Parse the embedded epoch timestamp out of a key, if it has one.
///
/// Only the last `/` segment of the key is split, so underscores in the
/// directory part never change the field count.
///
/// ```
/// use seglift::selector::parse_timestamp;
/// assert_eq!(parse_timestamp("pid/rds_log_abc_1698228000"), Some(1698228000));
/// assert_eq!(parse_timestamp("random_string"), None);
/// ```
pub fn parse_timestamp(key: &str) -> Option<i64> {
    let name = key.rsplit('/').next().unwrap_or(key);
    let fields: Vec<&str> = name.split(NAME_DELIMITER).collect();
    if fields.len() != NAME_FIELD_COUNT {
        return None;
    }
    fields[TIMESTAMP_FIELD].parse::<i64>().ok()
}

/// 🪟 An inclusive `[start, finish]` window in epoch seconds.
///
/// Order-independent on construction: `new(10, 1)` is the same window as `new(1, 10)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start: i64,
    finish: i64,
}

impl TimeWindow {
    pub fn new(a: i64, b: i64) -> Self {
        Self {
            start: a.min(b),
            finish: a.max(b),
        }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn finish(&self) -> i64 {
        self.finish
    }

    /// ✅ Inclusive on both ends.
    pub fn contains(&self, timestamp: i64) -> bool {
        (self.start..=self.finish).contains(&timestamp)
    }
}

/// 🔎 List every key under `prefix` (all pages) and keep the ones inside `window`.
///
/// Unparseable names are dropped at trace level. Listing errors bubble up.
pub async fn select_segments<S>(
    store: &S,
    prefix: &str,
    window: TimeWindow,
) -> Result<Vec<ObjectDescriptor>>
where
    S: ObjectStore + ?Sized,
{
    let mut selected = Vec::new();
    let mut continuation = None;
    let mut listed = 0usize;
    let mut pages = 0usize;

    loop {
        let page = store
            .list_page(prefix, continuation.take())
            .await
            .with_context(|| {
                format!(
                    "💀 Listing '{}' failed on page {}. No segments were fetched.",
                    prefix,
                    pages + 1
                )
            })?;
        pages += 1;
        listed += page.keys.len();

        for key in page.keys {
            match parse_timestamp(&key) {
                Some(timestamp) if window.contains(timestamp) => {
                    let index = selected.len();
                    selected.push(ObjectDescriptor::new(key, timestamp, index));
                }
                Some(_) => {}
                None => trace!("🤷 '{}' does not look like a log segment name, skipping", key),
            }
        }

        match page.continuation {
            Some(token) => continuation = Some(token),
            None => break,
        }
    }

    info!(
        "🔎 selected {} of {} objects under '{}' across {} page(s) for window [{}, {}]",
        selected.len(),
        listed,
        prefix,
        pages,
        window.start(),
        window.finish()
    );
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::InMemoryStore;

    // 🗓️ 2023-10-25 10:00:00 UTC and 13:00:00 UTC
    const START: i64 = 1698228000;
    const FINISH: i64 = 1698238800;

    fn name_at(ts: i64) -> String {
        format!("pid/rds_log_391c219c198f5a5ccc5f37a1_{}", ts)
    }

    #[test]
    fn the_one_where_the_date_comes_out_of_the_name() {
        assert_eq!(parse_timestamp("rds_log_391c219c198f5a5ccc5f37a1_1698228000"), Some(START));
        assert_eq!(parse_timestamp(&name_at(START)), Some(START));
    }

    #[test]
    fn the_one_where_malformed_names_are_not_segments() {
        assert_eq!(parse_timestamp("random_string"), None);
        assert_eq!(parse_timestamp("rds_log_1698228000"), None);
        assert_eq!(parse_timestamp("rds_log_abc_1698228000_extra"), None);
        assert_eq!(parse_timestamp("rds_log_abc_yesterday"), None);
        assert_eq!(parse_timestamp("rds_log_abc_"), None);
    }

    #[test]
    fn the_one_where_underscores_in_the_directory_do_not_count() {
        assert_eq!(parse_timestamp("db_prod/rds_log_x_1698228000"), Some(START));
        assert_eq!(parse_timestamp("a_b/c_d/rds_log_x_1698228000"), Some(START));
        assert_eq!(parse_timestamp("db_prod/rds_log_1698228000"), None);
    }

    #[test]
    fn the_one_where_the_window_is_inclusive_and_order_blind() {
        let window = TimeWindow::new(FINISH, START);
        assert_eq!(window.start(), START);
        assert_eq!(window.finish(), FINISH);
        assert!(window.contains(START));
        assert!(window.contains(FINISH));
        assert!(window.contains(START + 1));
        assert!(!window.contains(START - 1));
        assert!(!window.contains(FINISH + 1));
        assert!(!window.contains(START - 180));
    }

    #[tokio::test]
    async fn the_one_where_selection_spans_pages_and_keeps_listing_order() -> Result<()> {
        let store = InMemoryStore::new()
            .with_object(name_at(START - 60), "too early")
            .with_object(name_at(START), "first")
            .with_object(name_at(START + 3600), "second")
            .with_object("pid/rds_log_391c219c198f5a5ccc5f37a1_notanumber", "junk")
            .with_object("pid/rds_log_only_three", "junk")
            .with_object("pid/rds_log_1698228000", "junk")
            .with_object(name_at(FINISH), "third")
            .with_object(name_at(FINISH + 1), "too late")
            .with_object(format!("other/rds_log_x_{}", START), "wrong prefix")
            .with_page_size(2);

        let selected = select_segments(&store, "pid/", TimeWindow::new(START, FINISH)).await?;

        let keys: Vec<&str> = selected.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                name_at(START).as_str(),
                name_at(START + 3600).as_str(),
                name_at(FINISH).as_str()
            ]
        );
        let indices: Vec<usize> = selected.iter().map(|d| d.sequence_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(selected[1].timestamp, START + 3600);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_listing_failure_is_fatal() {
        let store = InMemoryStore::new()
            .with_object(name_at(START), "x")
            .with_listing_failure();
        let result = select_segments(&store, "pid/", TimeWindow::new(START, FINISH)).await;
        assert!(result.is_err());
    }
}
