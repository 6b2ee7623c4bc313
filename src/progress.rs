//! Ingestion progress reporting.
//!
//! Reports observable progress during `quarry crawl` and `quarry upload`
//! so users see which phase is running and how far along it is. Progress
//! is emitted on **stderr** so stdout remains parseable for scripts.
//!
//! Reporters must be safe to call from concurrent fetch workers; the
//! channel-backed reporter additionally guarantees it never blocks a
//! worker (a full channel drops the event).

use std::io::Write;

/// Percentage ceiling for the crawl phase. Fetching stops reporting at
/// this mark so chunking and indexing have room in a composed pipeline.
pub const CRAWL_CEILING: u8 = 60;

/// Percentage ceiling for the chunking phase.
pub const CHUNK_CEILING: u8 = 80;

/// Phase of the ingestion pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IngestPhase {
    Crawling,
    Extracting,
    Chunking,
    Indexing,
}

impl IngestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestPhase::Crawling => "crawling",
            IngestPhase::Extracting => "extracting",
            IngestPhase::Chunking => "chunking",
            IngestPhase::Indexing => "indexing",
        }
    }
}

/// A single progress event for an ingestion run.
#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub phase: IngestPhase,
    /// Overall pipeline completion, 0..=100.
    pub percentage: u8,
    pub message: String,
    /// Optional detail line (per-URL failure, skip reason).
    pub log: Option<String>,
}

impl ProgressEvent {
    pub fn new(phase: IngestPhase, percentage: u8, message: impl Into<String>) -> Self {
        Self {
            phase,
            percentage: percentage.min(100),
            message: message.into(),
            log: None,
        }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }
}

/// Reports ingestion progress. Implementations write to stderr (human or
/// JSON) or hand events to a channel.
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the pipeline and from crawl
    /// workers.
    fn report(&self, event: ProgressEvent);
}

///// Human-friendly progress on stderr: "crawling  40%  12 / 30 pages".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let mut line = format!(
            "{:<10} {:>3}%  {}\n",
            event.phase.as_str(),
            event.percentage,
            event.message
        );
        if let Some(log) = &event.log {
            line.push_str(&format!("           {}\n", log));
        }
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = serde_json::json!({
            "event": "progress",
            "phase": event.phase.as_str(),
            "percentage": event.percentage,
            "message": event.message,
            "log": event.log,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Forwards events into a bounded channel. A slow consumer never stalls
/// ingestion: when the channel is full the event is dropped.
pub struct ChannelProgress {
    tx: tokio::sync::mpsc::Sender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl ProgressReporter for ChannelProgress {
    fn report(&self, event: ProgressEvent) {
        use tokio::sync::mpsc::error::TrySendError;
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                tracing::debug!(phase = dropped.phase.as_str(), "progress channel full, event dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
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

    /// Build a reporter for this mode. Caller passes it to the pipeline.
    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_clamped() {
        let event = ProgressEvent::new(IngestPhase::Indexing, 250, "done");
        assert_eq!(event.percentage, 100);
    }

    #[tokio::test]
    async fn test_channel_delivers_events() {
        let (reporter, mut rx) = ChannelProgress::new(8);
        reporter.report(ProgressEvent::new(IngestPhase::Crawling, 0, "start"));
        reporter.report(ProgressEvent::new(IngestPhase::Crawling, 30, "halfway"));
        let first = rx.recv().await.unwrap();
        assert_eq!(first.phase, IngestPhase::Crawling);
        assert_eq!(first.percentage, 0);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.percentage, 30);
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let (reporter, mut rx) = ChannelProgress::new(1);
        reporter.report(ProgressEvent::new(IngestPhase::Crawling, 0, "kept"));
        // Channel is full now; this one must be dropped without blocking.
        reporter.report(ProgressEvent::new(IngestPhase::Crawling, 10, "dropped"));
        let only = rx.recv().await.unwrap();
        assert_eq!(only.message, "kept");
        assert!(rx.try_recv().is_err());
    }
}
