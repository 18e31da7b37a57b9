//! Ingestion progress reporting.
//!
//! The pipeline emits one event per worker state change so callers can see
//! which document each worker holds and how far along it is. Events are
//! emitted on **stderr** so stdout remains parseable for scripts. No
//! user-visible formatting lives in the pipeline itself; it only talks to
//! a [`ProgressSink`].

use std::io::Write;

/// Pipeline stage a worker can be in for its current document.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipelineStage {
    Load,
    Chunk,
    Extract,
    Summarize,
    Checkpoint,
    IndexBuild,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Load => "load",
            PipelineStage::Chunk => "chunk",
            PipelineStage::Extract => "extract",
            PipelineStage::Summarize => "summarize",
            PipelineStage::Checkpoint => "checkpoint",
            PipelineStage::IndexBuild => "index_build",
        }
    }
}

/// Worker status carried by every event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerStatus {
    Idle,
    Processing,
    Waiting,
    Done,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Processing => "processing",
            WorkerStatus::Waiting => "waiting",
            WorkerStatus::Done => "done",
        }
    }
}

/// A single progress event from the ingestion pipeline.
#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub worker_index: usize,
    pub stage: PipelineStage,
    pub document_name: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub status: WorkerStatus,
}

/// Receives pipeline progress. Implementations write to stderr (human or
/// JSON) or discard events entirely.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr:
/// `[w2] extract  designing-data-intensive.pdf  14/96  processing`.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn on_progress(&self, event: ProgressEvent) {
        let line = format!(
            "[w{}] {}  {}  {}/{}  {}\n",
            event.worker_index,
            event.stage.as_str(),
            event.document_name,
            event.chunk_index,
            event.total_chunks,
            event.status.as_str()
        );
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressSink for JsonProgress {
    fn on_progress(&self, event: ProgressEvent) {
        let obj = serde_json::json!({
            "event": "progress",
            "worker": event.worker_index,
            "stage": event.stage.as_str(),
            "document": event.document_name,
            "chunk": event.chunk_index,
            "total_chunks": event.total_chunks,
            "status": event.status.as_str(),
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
        }
    }
}

/// No-op sink when progress is disabled.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _event: ProgressEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn sink(&self) -> Box<dyn ProgressSink> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
