//! Stream record store.
//!
//! Records describe what to relay (source and settings) and carry the last
//! reported session outcome. The relay only reads sources from the store
//! and writes status back; it never creates or deletes records itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::domain::{SessionState, StreamSettings, StreamSource};
use crate::session::SessionStatus;
use crate::{Error, Result};

/// Persisted description of one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: String,
    pub name: String,
    pub source_url: String,
    #[serde(default)]
    pub settings: StreamSettings,
    /// Last reported session state.
    pub status: Option<SessionState>,
    pub last_started: Option<DateTime<Utc>>,
    pub last_stopped: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl StreamRecord {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source_url: source_url.into(),
            settings: StreamSettings::default(),
            status: None,
            last_started: None,
            last_stopped: None,
            last_error: None,
        }
    }

    pub fn with_settings(mut self, settings: StreamSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn to_source(&self) -> StreamSource {
        StreamSource::new(&self.id, &self.source_url).with_settings(self.settings.clone())
    }

    /// Fold a session snapshot into the record.
    pub fn apply_status(&mut self, status: &SessionStatus) {
        self.status = Some(status.state);
        match status.state {
            SessionState::Running => {
                self.last_started = status.started_at;
                self.last_error = None;
            }
            SessionState::Stopped => {
                self.last_stopped = status.stopped_at;
            }
            SessionState::Error => {
                self.last_stopped = status.stopped_at;
                self.last_error = status.last_error.as_ref().map(ToString::to_string);
            }
            _ => {}
        }
    }
}

/// Source of stream records.
#[async_trait]
pub trait StreamRecordStore: Send + Sync + 'static {
    async fn get(&self, stream_id: &str) -> Result<Option<StreamRecord>>;

    /// Persist the outcome of a session transition.
    async fn report_status(&self, stream_id: &str, status: &SessionStatus) -> Result<()>;
}

/// Record store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: DashMap<String, StreamRecord>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub fn upsert(&self, record: StreamRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn remove(&self, stream_id: &str) -> Option<StreamRecord> {
        self.records.remove(stream_id).map(|(_, record)| record)
    }

    pub fn list(&self) -> Vec<StreamRecord> {
        self.records.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[async_trait]
impl StreamRecordStore for InMemoryRecordStore {
    async fn get(&self, stream_id: &str) -> Result<Option<StreamRecord>> {
        Ok(self.records.get(stream_id).map(|entry| entry.value().clone()))
    }

    async fn report_status(&self, stream_id: &str, status: &SessionStatus) -> Result<()> {
        let mut record = self
            .records
            .get_mut(stream_id)
            .ok_or_else(|| Error::not_found("stream", stream_id))?;
        record.apply_status(status);
        Ok(())
    }
}
