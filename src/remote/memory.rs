use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

use super::DocumentClient;

/// In-process document store. Handy for offline runs and tests; can be told
/// to fail every call to simulate a dropped connection.
#[derive(Default)]
pub struct MemoryDocumentClient {
    docs: Mutex<HashMap<(String, String), Map<String, Value>>>,
    unreachable: AtomicBool,
}

impl MemoryDocumentClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn raw_document(&self, collection: &str, key: &str) -> Option<Map<String, Value>> {
        let docs = self.docs.lock().ok()?;
        docs.get(&(collection.to_string(), key.to_string())).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.lock().map(|d| d.is_empty()).unwrap_or(true)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(anyhow!("Remote store unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentClient for MemoryDocumentClient {
    async fn get_document(&self, collection: &str, key: &str) -> Result<Option<Map<String, Value>>> {
        self.check_reachable()?;
        Ok(self.raw_document(collection, key))
    }

    async fn merge_document(&self, collection: &str, key: &str, fields: Map<String, Value>) -> Result<()> {
        self.check_reachable()?;
        let mut docs = self.docs.lock().map_err(|_| anyhow!("Document map poisoned"))?;
        let doc = docs
            .entry((collection.to_string(), key.to_string()))
            .or_default();
        doc.extend(fields);
        Ok(())
    }
}
