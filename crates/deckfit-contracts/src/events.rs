use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for the `events.jsonl` run log.
///
/// Every line carries `type`, `run_id` and a per-run `seq`; `ts` is added only when the writer
/// stamps wall-clock time. The caller payload is merged last. A writer without a path records
/// nothing but still returns the event it would have written.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: Option<PathBuf>,
    run_id: String,
    stamp_time: bool,
    seq: Mutex<u64>,
}

impl EventWriter {
    pub fn new(path: Option<PathBuf>, run_id: impl Into<String>, stamp_time: bool) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path,
                run_id: run_id.into(),
                stamp_time,
                seq: Mutex::new(0),
            }),
        }
    }

    /// Writer that only numbers events; used by tests and `deckfit check`.
    pub fn disabled(run_id: impl Into<String>) -> Self {
        Self::new(None, run_id, false)
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut seq = self
            .inner
            .seq
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        *seq += 1;

        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        event.insert("seq".to_string(), Value::Number((*seq).into()));
        if self.inner.stamp_time {
            event.insert("ts".to_string(), Value::String(now_utc_iso()));
        }
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(path) = &self.inner.path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let line = serde_json::to_string(&event)?;
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }

        Ok(Value::Object(event))
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn emit_appends_numbered_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("out").join("events.jsonl");
        let writer = EventWriter::new(Some(path.clone()), "run-123", true);

        let mut payload = EventPayload::new();
        payload.insert("slides".to_string(), json!(3));
        let emitted = writer.emit("run_started", payload)?;
        writer.emit("run_finished", EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0])?;
        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(first, emitted);
        assert_eq!(first["slides"], json!(3));
        assert_eq!(first["seq"], json!(1));
        assert_eq!(second["seq"], json!(2));
        assert_eq!(second["type"], json!("run_finished"));
        DateTime::parse_from_rfc3339(first["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn unstamped_writer_omits_ts() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(Some(path), "run-det", false);
        let emitted = writer.emit("review_round", EventPayload::new())?;
        assert!(emitted.get("ts").is_none());
        assert_eq!(emitted["run_id"], json!("run-det"));
        Ok(())
    }

    #[test]
    fn disabled_writer_returns_event_without_file() -> anyhow::Result<()> {
        let writer = EventWriter::disabled("run-x");
        let emitted = writer.emit("slide_planned", EventPayload::new())?;
        assert_eq!(emitted["type"], json!("slide_planned"));
        assert!(writer.path().is_none());
        Ok(())
    }
}
