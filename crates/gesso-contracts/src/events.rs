use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Something the parameter core did that operators want in a
/// request's log, tagged by `event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RequestEvent {
    ParserWarning {
        param: String,
        message: String,
    },
    PromptExpanded {
        param: String,
        chars_in: usize,
        chars_out: usize,
    },
    SeedMaterialized {
        seed: i64,
    },
}

/// Append-only JSONL log for one request.
///
/// Each line is the tagged event plus a fixed envelope: `request_id`,
/// a monotonic `seq`, and a `ts` stamp. Event fields cannot collide
/// with the envelope. The sink opens on first write and stays open
/// for the life of the log; clones share the handle and the
/// sequence.
#[derive(Debug, Clone)]
pub struct EventLog {
    shared: Arc<LogShared>,
}

#[derive(Debug)]
struct LogShared {
    path: PathBuf,
    request_id: String,
    state: Mutex<LogState>,
}

#[derive(Debug, Default)]
struct LogState {
    seq: u64,
    sink: Option<File>,
}

#[derive(Serialize)]
struct EventLine<'a> {
    request_id: &'a str,
    seq: u64,
    ts: String,
    #[serde(flatten)]
    event: &'a RequestEvent,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, request_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(LogShared {
                path: path.into(),
                request_id: request_id.into(),
                state: Mutex::new(LogState::default()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn request_id(&self) -> &str {
        &self.shared.request_id
    }

    pub fn record(&self, event: RequestEvent) -> anyhow::Result<()> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        if state.sink.is_none() {
            if let Some(parent) = self.shared.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            state.sink = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.shared.path)?,
            );
        }

        let line = EventLine {
            request_id: &self.shared.request_id,
            seq: state.seq,
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event: &event,
        };
        let sink = state.sink.as_mut().expect("event sink opened");
        serde_json::to_writer(&mut *sink, &line)?;
        sink.write_all(b"\n")?;
        state.seq += 1;
        Ok(())
    }
}
