//! Bounded capture of encoder stderr.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Ring buffer holding the last `capacity` stderr lines of an encoder.
#[derive(Debug, Clone)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn last(&self) -> Option<String> {
        self.lines.lock().back().cloned()
    }

    /// Drain `reader` line by line into the tail until EOF.
    pub fn spawn_reader<R>(&self, reader: R, label: String) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tail = self.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => {
                        debug!(stream_id = %label, "encoder stderr closed");
                        break;
                    }
                    Ok(_) => {
                        // Source metadata echoed by the encoder is not always UTF-8.
                        let line = String::from_utf8_lossy(&buf);
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        if trimmed.contains("Error") || trimmed.contains("error") {
                            warn!(stream_id = %label, "encoder: {}", trimmed);
                        } else {
                            debug!(stream_id = %label, "encoder: {}", trimmed);
                        }
                        tail.push(trimmed);
                    }
                    Err(e) => {
                        warn!(stream_id = %label, "Error reading encoder stderr: {}", e);
                        break;
                    }
                }
            }
        })
    }
}
