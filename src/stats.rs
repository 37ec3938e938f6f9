//! Optional CSV export of admission events (`csv-export` feature).
//!
//! Mirrors the teacher's `StatParameter`/channel-writer architecture
//! (`domain::vrm_system_model::utils::statistics`) — a background thread
//! owns the `csv::Writer`, producers hand it rows over an `mpsc::Sender`
//! and never block on I/O — but scopes the writer to one `RateLimiter`
//! instance instead of a process-wide `OnceLock` singleton, since an
//! embedding application may run more than one limiter in a process.

use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use serde::Serialize;

/// Kinds of admission events recorded to the CSV (column `event`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StatEvent {
    Resolved,
    Delegated,
    RejectedWithoutDelegation,
    AllModelsExhausted,
    RejectedByBackend,
    AvailabilityChanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatRecord {
    pub time_ms: u64,
    pub instance_id: String,
    pub model_id: Option<String>,
    pub job_type: Option<String>,
    pub job_id: Option<String>,
    pub event: StatEvent,
    pub slots: Option<u64>,
    pub reason: Option<String>,
    pub cost: Option<f64>,
}

impl StatRecord {
    pub fn new(instance_id: impl Into<String>, event: StatEvent) -> Self {
        StatRecord {
            time_ms: 0,
            instance_id: instance_id.into(),
            model_id: None,
            job_type: None,
            job_id: None,
            event,
            slots: None,
            reason: None,
            cost: None,
        }
    }

    pub fn model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn job(mut self, job_type: impl Into<String>, job_id: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self.job_id = Some(job_id.into());
        self
    }

    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

enum WriterMessage {
    Record(StatRecord),
    Flush,
}

/// Handle producers hold; the actual `File`/`csv::Writer` lives on the
/// background thread spawned by `spawn`.
pub struct StatsRecorder {
    sender: mpsc::Sender<WriterMessage>,
    start: Instant,
}

impl StatsRecorder {
    pub fn spawn(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = std::fs::File::create(&path)?;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || Self::writer_loop(rx, file));
        Ok(StatsRecorder { sender: tx, start: Instant::now() })
    }

    fn writer_loop(rx: mpsc::Receiver<WriterMessage>, file: std::fs::File) {
        let mut writer = csv::Writer::from_writer(file);
        for msg in rx {
            match msg {
                WriterMessage::Record(record) => {
                    if let Err(err) = writer.serialize(&record) {
                        tracing::warn!(error = %err, "failed to write stats record");
                    }
                }
                WriterMessage::Flush => {
                    let _ = writer.flush();
                }
            }
        }
        let _ = writer.flush();
    }

    /// Non-blocking; stamps `time_ms` relative to this recorder's creation
    /// and hands the row to the writer thread. Dropped silently if the
    /// writer thread has already shut down.
    pub fn record(&self, mut record: StatRecord) {
        record.time_ms = self.start.elapsed().as_millis() as u64;
        let _ = self.sender.send(WriterMessage::Record(record));
    }

    pub fn flush(&self) {
        let _ = self.sender.send(WriterMessage::Flush);
    }
}
