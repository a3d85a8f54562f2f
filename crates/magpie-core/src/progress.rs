//! Progress event reporting
//!
//! Progress is purely informational: events flow outward to whatever
//! transport the collaborator chose (socket, log, callback) and are
//! never consumed internally for control flow.

use serde::Serialize;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;

/// Severity of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// One timestamped progress update. Serializable so channel consumers
/// can relay events over a socket verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub message: String,
    pub severity: Severity,
    /// Percentage 0-100, when the current strategy can compute one.
    pub percent: Option<u8>,
    pub timestamp: SystemTime,
}

impl ProgressEvent {
    pub fn new(message: impl Into<String>, severity: Severity) -> Self {
        Self {
            message: message.into(),
            severity,
            percent: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_percent(mut self, percent: u8) -> Self {
        self.percent = Some(percent.min(100));
        self
    }
}

/// Transport-agnostic observer for progress events.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Sink that drops every event.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Sink backed by a plain callback.
pub struct CallbackSink<F>(pub F);

impl<F> ProgressSink for CallbackSink<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        (self.0)(event)
    }
}

/// Sink that forwards events over an unbounded channel, for callers
/// that relay progress to a socket or UI task.
pub struct ChannelSink(pub mpsc::UnboundedSender<ProgressEvent>);

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.0.send(event);
    }
}

/// Shared handle used throughout the pipeline.
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn ProgressSink>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self { sink }
    }

    pub fn discard() -> Self {
        Self::new(Arc::new(NullSink))
    }

    pub fn emit(&self, event: ProgressEvent) {
        self.sink.emit(event);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(ProgressEvent::new(message, Severity::Info));
    }

    pub fn success(&self, message: impl Into<String>) {
        self.emit(ProgressEvent::new(message, Severity::Success));
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(ProgressEvent::new(message, Severity::Warning));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(ProgressEvent::new(message, Severity::Error));
    }

    pub fn percent(&self, message: impl Into<String>, percent: u8) {
        self.emit(ProgressEvent::new(message, Severity::Info).with_percent(percent));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn callback_sink_receives_events() {
        let seen: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let reporter = Reporter::new(Arc::new(CallbackSink(move |ev| {
            seen_clone.lock().unwrap().push(ev);
        })));

        reporter.info("starting");
        reporter.percent("halfway", 50);
        reporter.error("boom");

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].severity, Severity::Info);
        assert_eq!(events[1].percent, Some(50));
        assert_eq!(events[2].severity, Severity::Error);
    }

    #[test]
    fn percent_is_clamped() {
        let ev = ProgressEvent::new("x", Severity::Info).with_percent(250);
        assert_eq!(ev.percent, Some(100));
    }

    #[test]
    fn events_serialize_for_socket_relay() {
        let ev = ProgressEvent::new("Downloading (40%)", Severity::Info).with_percent(40);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["message"], "Downloading (40%)");
        assert_eq!(json["severity"], "info");
        assert_eq!(json["percent"], 40);
    }

    #[tokio::test]
    async fn channel_sink_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = Reporter::new(Arc::new(ChannelSink(tx)));
        reporter.success("done");
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.severity, Severity::Success);
        assert_eq!(ev.message, "done");
    }
}
