//! Run-scoped shared memory.

use std::collections::BTreeMap;

use tokio::sync::RwLock;

/// Key/value memory shared by every task of one run.
///
/// Writes only add or overwrite; there is no removal. Batches passed to
/// [`ContextStore::commit`] become visible all at once.
#[derive(Debug, Default)]
pub struct ContextStore {
    entries: RwLock<BTreeMap<String, serde_json::Value>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh store seeded with the user's query.
    pub fn for_query(query: &str) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            "user_input".to_string(),
            serde_json::Value::String(query.to_string()),
        );
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Insert or overwrite a single key.
    pub async fn put(&self, key: impl Into<String>, value: serde_json::Value) {
        self.entries.write().await.insert(key.into(), value);
    }

    /// Push `value` onto the array under `key`, creating it if needed.
    /// A non-array value already there becomes the first element.
    pub async fn append(&self, key: impl Into<String>, value: serde_json::Value) {
        let mut entries = self.entries.write().await;
        let slot = entries
            .entry(key.into())
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        match slot {
            serde_json::Value::Array(items) => items.push(value),
            other => {
                let previous = other.take();
                *other = serde_json::Value::Array(vec![previous, value]);
            }
        }
    }

    /// Apply a batch of writes under one lock acquisition.
    pub async fn commit<I>(&self, batch: I)
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        let mut entries = self.entries.write().await;
        for (key, value) in batch {
            entries.insert(key, value);
        }
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.read().await.get(key).cloned()
    }

    /// Everything committed so far, as a JSON object.
    pub async fn snapshot(&self) -> serde_json::Value {
        let entries = self.entries.read().await;
        serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
