//! In-memory storage port

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{GuardStore, StoreError};
use crate::types::{CacheEntry, CallRecord, CorrectionRecord, ReflectionMemory};

/// Hash-map backed store
///
/// Each collection sits behind its own lock, so every trait method is a
/// single atomic step and nothing more.
#[derive(Default)]
pub struct MemoryStore {
    /// Record plus insertion sequence; upserts keep the original sequence
    records: RwLock<HashMap<String, (u64, CallRecord)>>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    corrections: RwLock<Vec<CorrectionRecord>>,
    reflections: RwLock<Vec<ReflectionMemory>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cache rows, expired ones included
    pub async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[async_trait]
impl GuardStore for MemoryStore {
    async fn lookup_valid_cache(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let cache = self.cache.read().await;
        Ok(cache.get(key).filter(|e| e.is_valid_at(now)).cloned())
    }

    async fn find_recent_call(
        &self,
        session_id: &str,
        tool_name: &str,
        fingerprint: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<CallRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|(_, r)| {
                r.session_id == session_id
                    && r.tool_name == tool_name
                    && r.parameters_fingerprint == fingerprint
                    && r.created_at >= since
            })
            .max_by_key(|(seq, r)| (r.created_at, *seq))
            .map(|(_, r)| r.clone()))
    }

    async fn save_cache(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        self.cache
            .write()
            .await
            .insert(entry.cache_key.clone(), entry.clone());
        Ok(())
    }

    async fn find_cache_by_key(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.cache.read().await.get(key).cloned())
    }

    async fn delete_cache_for_session(&self, session_id: &str) -> Result<u64, StoreError> {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, e| e.session_id != session_id);
        Ok((before - cache.len()) as u64)
    }

    async fn delete_expired_cache(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, e| e.is_valid_at(now));
        Ok((before - cache.len()) as u64)
    }

    async fn save_record(&self, record: &CallRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        // Records are never deleted, so the map size is a fresh sequence
        let next_seq = records.len() as u64;
        let seq = records.get(&record.id).map_or(next_seq, |(seq, _)| *seq);
        records.insert(record.id.clone(), (seq, record.clone()));
        Ok(())
    }

    async fn find_record_by_id(&self, id: &str) -> Result<Option<CallRecord>, StoreError> {
        Ok(self.records.read().await.get(id).map(|(_, r)| r.clone()))
    }

    async fn find_corrections_by_tool_call(
        &self,
        tool_call_id: &str,
    ) -> Result<Vec<CorrectionRecord>, StoreError> {
        let corrections = self.corrections.read().await;
        let mut rows: Vec<CorrectionRecord> = corrections
            .iter()
            .filter(|c| c.tool_call_id == tool_call_id)
            .cloned()
            .collect();
        rows.sort_by_key(|c| (c.created_at, c.correction_rounds));
        Ok(rows)
    }

    async fn find_correction_by_id(&self, id: &str) -> Result<Option<CorrectionRecord>, StoreError> {
        let corrections = self.corrections.read().await;
        Ok(corrections.iter().find(|c| c.id == id).cloned())
    }

    async fn save_correction(&self, record: &CorrectionRecord) -> Result<(), StoreError> {
        let mut corrections = self.corrections.write().await;
        match corrections.iter_mut().find(|c| c.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => corrections.push(record.clone()),
        }
        Ok(())
    }

    async fn find_reflections(
        &self,
        tool_name: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<ReflectionMemory>, StoreError> {
        let reflections = self.reflections.read().await;
        // Reverse insertion order first so equal timestamps stay newest-first
        let mut rows: Vec<ReflectionMemory> = reflections
            .iter()
            .rev()
            .filter(|r| r.tool_name == tool_name)
            .filter(|r| tenant_id.map_or(true, |t| r.tenant_id.as_deref() == Some(t)))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn save_reflection(&self, entry: &ReflectionMemory) -> Result<(), StoreError> {
        self.reflections.write().await.push(entry.clone());
        Ok(())
    }
}
