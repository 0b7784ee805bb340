//! In-memory session repository

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::SessionRepository;
use crate::error::{Result, SessionError};
use crate::session::SessionRecord;

#[derive(Default)]
pub struct MemoryRepository {
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for MemoryRepository {
    async fn create(&self, record: &SessionRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(SessionError::AlreadyExists(record.id.clone()));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &SessionRecord) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(SessionError::NotFound(record.id.clone())),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<SessionRecord>> {
        let mut all: Vec<SessionRecord> = self.records.read().await.values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }

    async fn find_by_script_hash(&self, hash: &str) -> Result<Vec<SessionRecord>> {
        if hash.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut hits: Vec<SessionRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| {
                r.script
                    .as_ref()
                    .is_some_and(|s| s.content_hash == hash)
            })
            .cloned()
            .collect();
        hits.sort_by_key(|r| r.created_at);
        Ok(hits)
    }

    async fn find_by_script_path(&self, path: &str) -> Result<Option<SessionRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.path == path)
            .cloned())
    }
}
