//! Stream service.
//!
//! Ties the session registry to the record store: starts read the source
//! from a record, and every session outcome is written back to it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{SessionFailure, SessionState};
use crate::session::{SessionEvent, SessionRegistry, SessionStatus};
use crate::store::{StreamRecord, StreamRecordStore};
use crate::{Error, Result};

/// Record metadata merged with live session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSnapshot {
    pub stream_id: String,
    /// Whether a session exists for this stream.
    pub exists: bool,
    pub name: Option<String>,
    pub source_url: Option<String>,
    pub state: Option<SessionState>,
    pub output_locator: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub process_alive: bool,
    pub pid: Option<u32>,
    pub last_error: Option<SessionFailure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stderr_tail: Vec<String>,
}

impl StreamSnapshot {
    fn merge(stream_id: &str, record: Option<StreamRecord>, session: Option<SessionStatus>) -> Self {
        let (name, record_source) = match record {
            Some(record) => (Some(record.name), Some(record.source_url)),
            None => (None, None),
        };

        match session {
            Some(status) => Self {
                stream_id: stream_id.to_string(),
                exists: true,
                name,
                source_url: Some(status.source_url),
                state: Some(status.state),
                output_locator: Some(status.output_locator),
                started_at: status.started_at,
                stopped_at: status.stopped_at,
                process_alive: status.process_alive,
                pid: status.pid,
                last_error: status.last_error,
                stderr_tail: status.stderr_tail,
            },
            None => Self {
                stream_id: stream_id.to_string(),
                exists: false,
                name,
                source_url: record_source,
                state: None,
                output_locator: None,
                started_at: None,
                stopped_at: None,
                process_alive: false,
                pid: None,
                last_error: None,
                stderr_tail: Vec::new(),
            },
        }
    }
}

/// Facade over a [`SessionRegistry`] and a [`StreamRecordStore`].
pub struct StreamService<S: StreamRecordStore> {
    registry: Arc<SessionRegistry>,
    store: Arc<S>,
}

impl<S: StreamRecordStore> StreamService<S> {
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<S>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start relaying the stream described by record `stream_id`.
    pub async fn start_stream(&self, stream_id: &str) -> Result<SessionStatus> {
        let record = self
            .store
            .get(stream_id)
            .await?
            .ok_or_else(|| Error::not_found("stream", stream_id))?;

        let status = self.registry.start_session(record.to_source()).await?;
        self.write_back(&status).await;
        Ok(status)
    }

    pub async fn stop_stream(&self, stream_id: &str) -> Result<SessionStatus> {
        let status = self.registry.stop_session(stream_id).await?;
        self.write_back(&status).await;
        Ok(status)
    }

    /// Always succeeds; unknown ids yield a snapshot with `exists == false`.
    pub async fn snapshot(&self, stream_id: &str) -> StreamSnapshot {
        let record = self.load_record(stream_id).await;
        StreamSnapshot::merge(stream_id, record, self.registry.get_status(stream_id))
    }

    pub async fn list_all_active(&self) -> Vec<StreamSnapshot> {
        let mut snapshots = Vec::new();
        for status in self.registry.list_active() {
            let stream_id = status.stream_id.clone();
            let record = self.load_record(&stream_id).await;
            snapshots.push(StreamSnapshot::merge(&stream_id, record, Some(status)));
        }
        snapshots
    }

    /// Write every session transition back to the store until `cancel`
    /// fires. Catches outcomes no caller is waiting on, such as failures
    /// found by the sweep.
    pub fn start_status_sync(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut events = self.registry.subscribe();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Ok(SessionEvent::StateChanged { stream_id, .. }) => {
                        if let Some(status) = service.registry.get_status(&stream_id) {
                            service.write_back(&status).await;
                        }
                    }
                    Ok(SessionEvent::Rejected { .. }) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Status sync lagged, skipped {} event(s)", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Status sync stopped");
        })
    }

    async fn load_record(&self, stream_id: &str) -> Option<StreamRecord> {
        match self.store.get(stream_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(stream_id, "Failed to load stream record: {}", e);
                None
            }
        }
    }

    /// Best effort; the session outcome stands regardless.
    async fn write_back(&self, status: &SessionStatus) {
        if let Err(e) = self.store.report_status(&status.stream_id, status).await {
            warn!(
                stream_id = %status.stream_id,
                "Failed to record session status: {}", e
            );
        }
    }
}
