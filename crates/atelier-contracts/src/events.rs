use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Keys carrying raw image payloads; never written to the log.
const REDACTED_KEYS: &[&str] = &["b64_json", "image", "image_bytes", "data", "mask_b64"];

/// Append-only writer for `events.jsonl`, shared by clones.
///
/// Every line carries `type`, `scope`, `seq` and `ts`; the caller payload is
/// merged last and may override them. `seq` is assigned under the append
/// lock, so it increases in file order.
#[derive(Debug, Clone)]
pub struct EventWriter {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    scope: String,
    log: Mutex<LogState>,
}

#[derive(Debug, Default)]
struct LogState {
    file: Option<File>,
    last_seq: u64,
}

impl LogState {
    fn file(&mut self, path: &Path) -> anyhow::Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            self.file = Some(OpenOptions::new().create(true).append(true).open(path)?);
        }
        self.file
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("event log {} not open", path.display()))
    }
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, scope: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                path: path.into(),
                scope: scope.into(),
                log: Mutex::new(LogState::default()),
            }),
        }
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut state = self
            .shared
            .log
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let seq = state.last_seq + 1;

        let mut event = EventPayload::new();
        event.insert("type".into(), event_type.into());
        event.insert("scope".into(), self.shared.scope.as_str().into());
        event.insert("seq".into(), seq.into());
        event.insert(
            "ts".into(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false).into(),
        );
        event.extend(sanitize_payload(payload));

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        state.file(&self.shared.path)?.write_all(&line)?;
        state.last_seq = seq;
        Ok(Value::Object(event))
    }
}

pub fn sanitize_payload(payload: EventPayload) -> EventPayload {
    payload
        .into_iter()
        .filter(|(key, _)| !REDACTED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key, sanitize_value(value)))
        .collect()
}

fn sanitize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize_payload(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        other => other,
    }
}
