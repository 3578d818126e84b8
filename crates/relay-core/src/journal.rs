//! Append-only delivery journal.
//!
//! One line per pipeline decision (delivered, abandoned, deferred, duplicate,
//! stale, filtered). Best-effort: journal write failures never affect delivery.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::Serialize;

use crate::{
    domain::{EventId, InboundEvent, ReleasedUnit},
    errors::Error,
    Result,
};

const JOURNAL_MAX_ERROR: usize = 300;

#[derive(Clone, Debug, Serialize)]
pub struct JournalEntry {
    pub timestamp: String,
    pub decision: String,

    pub source_id: i64,
    pub event_id: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarded_event_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JournalEntry {
    fn base(decision: &str, event: &InboundEvent) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            decision: decision.to_string(),
            source_id: event.source_id.0,
            event_id: event.event_id.0,
            kind: Some(event.kind.as_str().to_string()),
            group_size: None,
            forwarded_event_id: None,
            retry_count: None,
            error: None,
        }
    }

    fn for_unit(decision: &str, unit: &ReleasedUnit) -> Option<Self> {
        let first = unit.first()?;
        let mut entry = Self::base(decision, first);
        entry.event_id = unit.max_event_id().unwrap_or(first.event_id).0;
        if unit.is_group() {
            entry.group_size = Some(unit.len());
        }
        Some(entry)
    }

    pub fn delivered(unit: &ReleasedUnit, forwarded: EventId) -> Option<Self> {
        let mut e = Self::for_unit("delivered", unit)?;
        e.forwarded_event_id = Some(forwarded.0);
        Some(e)
    }

    pub fn abandoned(unit: &ReleasedUnit, retry_count: u32, error: &str) -> Option<Self> {
        let mut e = Self::for_unit("abandoned", unit)?;
        e.retry_count = Some(retry_count);
        e.error = Some(error.to_string());
        Some(e)
    }

    pub fn deferred(unit: &ReleasedUnit, error: &str) -> Option<Self> {
        let mut e = Self::for_unit("deferred", unit)?;
        e.error = Some(error.to_string());
        Some(e)
    }

    pub fn duplicate(unit: &ReleasedUnit) -> Option<Self> {
        Self::for_unit("duplicate", unit)
    }

    pub fn stale(event: &InboundEvent) -> Self {
        Self::base("stale", event)
    }

    pub fn filtered(event: &InboundEvent) -> Self {
        Self::base("filtered", event)
    }
}

#[derive(Clone, Debug)]
pub struct DeliveryJournal {
    path: PathBuf,
    json: bool,
}

impl DeliveryJournal {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: path.into(),
            json,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, mut entry: JournalEntry) -> Result<()> {
        if let Some(err) = &entry.error {
            entry.error = Some(truncate_text(err, JOURNAL_MAX_ERROR));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if self.json {
            let line = serde_json::to_string(&entry)?;
            writeln!(file, "{line}")?;
            return Ok(());
        }

        // Plain text format for readability.
        let value = serde_json::to_value(&entry)?;
        let Some(obj) = value.as_object() else {
            return Err(Error::External(
                "journal entry is not a JSON object".to_string(),
            ));
        };

        let mut out = String::new();
        for (k, v) in obj {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(k);
            out.push('=');
            match v {
                serde_json::Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
        }
        out.push('\n');

        file.write_all(out.as_bytes())?;
        Ok(())
    }
}

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}
