use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::ensure_parent;
use crate::error::DeskError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct LifecycleRecord {
    pub(crate) id: u64,
    pub(crate) ts: String,
    pub(crate) event_type: String,
    pub(crate) severity: String,
    pub(crate) payload: serde_json::Value,
}

/// Append-only JSON-lines record of lifecycle events.
pub(crate) struct EventJournal {
    path: Option<PathBuf>,
    next_id: u64,
}

impl EventJournal {
    pub(crate) fn open(path: PathBuf) -> Self {
        let next_id = read_records(&path)
            .ok()
            .and_then(|records| records.last().map(|record| record.id))
            .unwrap_or(0);
        Self {
            path: Some(path),
            next_id,
        }
    }

    /// A journal that records nothing.
    #[cfg(test)]
    pub(crate) fn disabled() -> Self {
        Self {
            path: None,
            next_id: 0,
        }
    }

    pub(crate) fn record(
        &mut self,
        event_type: &str,
        severity: &str,
        payload: serde_json::Value,
    ) -> Result<Option<LifecycleRecord>, DeskError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        self.next_id = self.next_id.saturating_add(1);
        let record = LifecycleRecord {
            id: self.next_id,
            ts: Utc::now().to_rfc3339(),
            event_type: event_type.to_string(),
            severity: severity.to_string(),
            payload,
        };
        ensure_parent(path)?;
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(line.as_bytes())?;
        Ok(Some(record))
    }

    /// Journal failures never interrupt the lifecycle.
    pub(crate) fn emit(&mut self, event_type: &str, severity: &str, payload: serde_json::Value) {
        if let Err(err) = self.record(event_type, severity, payload) {
            log::warn!("failed to write lifecycle journal: {err}");
        }
    }
}

pub(crate) fn read_records(path: &Path) -> Result<Vec<LifecycleRecord>, DeskError> {
    let content = fs::read_to_string(path)?;
    let mut records = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<LifecycleRecord>(trimmed) {
            Ok(record) => records.push(record),
            Err(err) => log::debug!("skipping malformed journal line: {err}"),
        }
    }
    Ok(records)
}

/// The last `lines` records; an absent journal is empty.
pub(crate) fn tail(path: &Path, lines: usize) -> Result<Vec<LifecycleRecord>, DeskError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut records = read_records(path)?;
    let skip = records.len().saturating_sub(lines);
    Ok(records.split_off(skip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn records_append_with_increasing_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("lifecycle.jsonl");
        let mut journal = EventJournal::open(path.clone());
        journal.emit("phase", "info", json!({"to": "installing"}));
        journal.emit("phase", "info", json!({"to": "spawning"}));

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 1);
        assert_eq!(records[1].id, 2);
        assert_eq!(records[1].payload["to"], "spawning");
        assert!(chrono::DateTime::parse_from_rfc3339(&records[0].ts).is_ok());
    }

    #[test]
    fn reopened_journal_continues_numbering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lifecycle.jsonl");
        EventJournal::open(path.clone()).emit("a", "info", json!({}));
        let record = EventJournal::open(path.clone())
            .record("b", "warn", json!({}))
            .unwrap()
            .unwrap();
        assert_eq!(record.id, 2);
    }

    #[test]
    fn tail_returns_last_records_and_skips_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lifecycle.jsonl");
        let mut journal = EventJournal::open(path.clone());
        for n in 0..5 {
            journal.emit("tick", "info", json!({"n": n}));
        }
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"not json\n")
            .unwrap();

        let last = tail(&path, 2).unwrap();
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].payload["n"], 3);
        assert_eq!(last[1].payload["n"], 4);
        assert!(tail(&dir.path().join("missing.jsonl"), 10).unwrap().is_empty());
    }

    #[test]
    fn disabled_journal_writes_nothing() {
        let mut journal = EventJournal::disabled();
        assert!(journal.record("phase", "info", json!({})).unwrap().is_none());
    }
}
