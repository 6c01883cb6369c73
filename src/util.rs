use std::collections::BTreeMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use tokio::time::Instant;

/// Merge settings maps from left to right; later maps win on key conflict.
/// Inputs are never mutated.
pub fn merge_settings(maps: &[&BTreeMap<String, String>]) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for map in maps {
        for (k, v) in map.iter() {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// A settings map usable as a cache key.
///
/// Equality and hash cover the key set only: two maps with the same keys but
/// different values compare equal and collide in a cache. Cached entries must
/// therefore be value-identical in practice for any given key set, which
/// holds for cluster HTTP settings. Never mutated after first hash.
#[derive(Debug, Clone)]
pub struct SettingsKey(BTreeMap<String, String>);

impl SettingsKey {
    pub fn new(settings: BTreeMap<String, String>) -> Self {
        Self(settings)
    }
}

impl PartialEq for SettingsKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.keys().eq(other.0.keys())
    }
}

impl Eq for SettingsKey {}

impl Hash for SettingsKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // BTreeMap keys iterate sorted, so insertion order cannot leak in.
        for key in self.0.keys() {
            key.hash(state);
        }
    }
}

/// Re-evaluate `pred` until it yields a value or `timeout` has elapsed,
/// sleeping `interval` between attempts.
///
/// The predicate always runs at least once, even with a zero timeout, and is
/// never run again once the deadline has passed. The last predicate result is
/// returned as-is so callers can use the resolved value. A predicate error
/// aborts the wait immediately.
pub async fn await_until<P, Fut, T>(
    mut pred: P,
    timeout: Duration,
    interval: Duration,
) -> anyhow::Result<Option<T>>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut result = pred().await?;
    loop {
        if result.is_some() {
            return Ok(result);
        }
        if Instant::now() >= deadline {
            return Ok(result);
        }
        tokio::time::sleep(interval).await;
        if Instant::now() >= deadline {
            return Ok(result);
        }
        result = pred().await?;
    }
}
