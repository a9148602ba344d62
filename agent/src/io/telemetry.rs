//! Append-only run telemetry.
//!
//! Telemetry is product output: one JSON object per line in
//! `<log_dir>/run-<timestamp>.jsonl`, independent of `RUST_LOG`. Recording
//! never blocks the control loop; lines are handed to a writer thread.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::io::oracle::Usage;

pub const RUN_STARTED: &str = "run_started";
pub const STRATEGY_UPDATE: &str = "strategy_update";
pub const STRATEGY_NEXT_TASK: &str = "strategy_next_task";
pub const EXECUTOR_NEXT_CMDS: &str = "executor_next_cmds";
pub const EXECUTOR_CMD: &str = "executor_cmd";
pub const EXECUTOR_SUMMARY_MISSING: &str = "executor_summary_missing";
pub const EXECUTOR_FORCED_SUMMARY: &str = "executor_forced_summary";
pub const ANALYZER: &str = "analyzer";
pub const UPDATE_KNOWLEDGE: &str = "update_knowledge";
pub const UPDATE_KNOWLEDGE_FAILED: &str = "update_knowledge_failed";
/// An oracle reply that was received but failed decoding or validation.
pub const ORACLE_REPLY_REJECTED: &str = "oracle_reply_rejected";
pub const RUN_FINISHED: &str = "run_finished";
pub const RUN_FAILED: &str = "run_failed";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub event: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

impl TelemetryEvent {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            model: None,
            cost: None,
            duration_secs: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_cost(mut self, cost: Option<Usage>) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = Some(secs);
        self
    }
}

/// Fire-and-forget event sink.
pub trait Telemetry: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

#[derive(Serialize)]
struct Line<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a TelemetryEvent,
}

/// JSON-lines file sink backed by a writer thread.
///
/// Dropping the sink closes the queue and waits for pending lines to be
/// written.
pub struct JsonlTelemetry {
    path: PathBuf,
    sender: Mutex<Option<Sender<TelemetryEvent>>>,
    writer: Option<JoinHandle<()>>,
}

impl JsonlTelemetry {
    /// Create `<dir>/run-<timestamp>.jsonl` and start the writer.
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create telemetry dir {}", dir.display()))?;
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let path = dir.join(format!("run-{stamp}.jsonl"));
        Self::open(path)
    }

    pub fn open(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)
            .with_context(|| format!("create telemetry file {}", path.display()))?;
        let (sender, receiver) = mpsc::channel::<TelemetryEvent>();
        let writer = std::thread::Builder::new()
            .name("telemetry".to_string())
            .spawn(move || {
                let mut out = BufWriter::new(file);
                for event in receiver {
                    if let Err(err) = write_line(&mut out, &event) {
                        warn!(err = %err, event = %event.event, "failed to write telemetry");
                    }
                }
            })
            .context("spawn telemetry writer")?;
        Ok(Self {
            path,
            sender: Mutex::new(Some(sender)),
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_line(out: &mut impl Write, event: &TelemetryEvent) -> Result<()> {
    let line = Line {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        event,
    };
    serde_json::to_writer(&mut *out, &line).context("serialize telemetry")?;
    out.write_all(b"\n").context("write telemetry")?;
    out.flush().context("flush telemetry")?;
    Ok(())
}

impl Telemetry for JsonlTelemetry {
    fn record(&self, event: TelemetryEvent) {
        let Ok(guard) = self.sender.lock() else {
            return;
        };
        if let Some(sender) = guard.as_ref()
            && sender.send(event).is_err()
        {
            warn!("telemetry writer stopped, dropping event");
        }
    }
}

impl Drop for JsonlTelemetry {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
        if let Some(writer) = self.writer.take()
            && writer.join().is_err()
        {
            warn!(path = %self.path.display(), "telemetry writer panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_one_json_object_per_event() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sink = JsonlTelemetry::create(temp.path()).expect("create");
        let path = sink.path().to_path_buf();
        sink.record(TelemetryEvent::new(RUN_STARTED, json!({"scenario": "lab"})));
        sink.record(
            TelemetryEvent::new(STRATEGY_UPDATE, json!({"plan": "1. Recon"}))
                .with_model("o1")
                .with_cost(Some(Usage {
                    prompt_tokens: 10,
                    completion_tokens: 2,
                }))
                .with_duration(0.5),
        );
        drop(sink);

        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "run_started");
        assert_eq!(lines[0]["payload"]["scenario"], "lab");
        assert!(lines[0].get("cost").is_none());
        assert_eq!(lines[1]["model"], "o1");
        assert_eq!(lines[1]["cost"]["prompt_tokens"], 10);
        assert_eq!(lines[1]["duration_secs"], 0.5);
        assert!(lines[1]["timestamp"].as_str().expect("ts").ends_with('Z'));
    }
}
