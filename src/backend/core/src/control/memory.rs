//! In-process control store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use super::ControlStore;
use crate::error::Result;

/// Control store backed by a concurrent map. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryControlStore {
    entries: Arc<DashMap<String, String>>,
}

impl InMemoryControlStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ControlStore for InMemoryControlStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|value| value.clone()))
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn replace(&self, key: &str, expected: &str, value: &str) -> Result<bool> {
        match self.entries.get_mut(key) {
            Some(mut current) if current.as_str() == expected => {
                *current = value.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
