//! Day-file CSV attendance ledger.
//!
//! One file per calendar day, `attendance_YYYY-MM-DD.csv`, with a
//! `Name,Date,Time` header written when the file is created.

use chrono::{NaiveDate, NaiveDateTime};
use rollcall_core::{AttendanceLedger, LedgerError, MarkOutcome};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

const HEADER: [&str; 3] = ["Name", "Date", "Time"];

pub struct CsvLedger {
    dir: PathBuf,
}

impl CsvLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn day_file(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("attendance_{}.csv", day.format("%Y-%m-%d")))
    }

    /// Names already recorded for `day`.
    pub fn marked(&self, day: NaiveDate) -> Result<HashSet<String>, LedgerError> {
        let path = self.day_file(day);
        if !path.exists() {
            return Ok(HashSet::new());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&path)
            .map_err(|e| csv_error(&path, e))?;

        let mut names = HashSet::new();
        for record in reader.records() {
            let record = record.map_err(|e| csv_error(&path, e))?;
            if let Some(name) = record.get(0) {
                names.insert(name.to_string());
            }
        }
        Ok(names)
    }

    /// Record `identity` at `at` unless it is already in that day's file.
    pub fn mark_at(&mut self, identity: &str, at: NaiveDateTime) -> Result<MarkOutcome, LedgerError> {
        let day = at.date();
        if self.marked(day)?.contains(identity) {
            tracing::debug!(identity, %day, "already marked");
            return Ok(MarkOutcome::AlreadyMarked);
        }

        let path = self.day_file(day);
        std::fs::create_dir_all(&self.dir).map_err(|source| LedgerError::Io {
            path: self.dir.clone(),
            source,
        })?;

        // A zero-length file is left behind when a previous write failed.
        let is_new = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LedgerError::Io {
                path: path.clone(),
                source,
            })?;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if is_new {
            writer.write_record(HEADER).map_err(|e| csv_error(&path, e))?;
        }
        let date = day.format("%Y-%m-%d").to_string();
        let time = at.format("%H:%M:%S").to_string();
        writer
            .write_record([identity, date.as_str(), time.as_str()])
            .map_err(|e| csv_error(&path, e))?;
        writer.flush().map_err(|source| LedgerError::Io {
            path: path.clone(),
            source,
        })?;

        tracing::info!(identity, path = %path.display(), "attendance marked");
        Ok(MarkOutcome::Marked)
    }
}

impl AttendanceLedger for CsvLedger {
    fn mark_if_absent(&mut self, identity: &str, day: NaiveDate) -> Result<MarkOutcome, LedgerError> {
        let now = chrono::Local::now().time();
        self.mark_at(identity, day.and_time(now))
    }
}

fn csv_error(path: &Path, err: csv::Error) -> LedgerError {
    LedgerError::Malformed {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(d: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, d)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_first_mark_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = CsvLedger::new(dir.path().join("attendance"));

        assert_eq!(ledger.mark_at("alice", at(18, 9, 5, 7)).unwrap(), MarkOutcome::Marked);

        let text = std::fs::read_to_string(dir.path().join("attendance/attendance_2024-03-18.csv")).unwrap();
        assert_eq!(text, "Name,Date,Time\nalice,2024-03-18,09:05:07\n");
    }

    #[test]
    fn test_mark_is_idempotent_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = CsvLedger::new(dir.path());

        assert_eq!(ledger.mark_at("alice", at(18, 9, 0, 0)).unwrap(), MarkOutcome::Marked);
        assert_eq!(ledger.mark_at("bob", at(18, 9, 1, 0)).unwrap(), MarkOutcome::Marked);
        assert_eq!(ledger.mark_at("alice", at(18, 14, 0, 0)).unwrap(), MarkOutcome::AlreadyMarked);
        // A new day starts a new file.
        assert_eq!(ledger.mark_at("alice", at(19, 9, 0, 0)).unwrap(), MarkOutcome::Marked);

        let day = NaiveDate::from_ymd_opt(2024, 3, 18).unwrap();
        let marked = ledger.marked(day).unwrap();
        assert_eq!(marked.len(), 2);
        assert!(marked.contains("alice") && marked.contains("bob"));

        let text = std::fs::read_to_string(ledger.day_file(day)).unwrap();
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_empty_day_file_gets_header() {
        let dir = tempfile::tempdir().unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 18).unwrap();
        let mut ledger = CsvLedger::new(dir.path());
        std::fs::write(ledger.day_file(day), "").unwrap();

        assert_eq!(ledger.mark_if_absent("alice", day).unwrap(), MarkOutcome::Marked);
        assert_eq!(ledger.mark_if_absent("alice", day).unwrap(), MarkOutcome::AlreadyMarked);

        let text = std::fs::read_to_string(ledger.day_file(day)).unwrap();
        assert!(text.starts_with("Name,Date,Time\nalice,2024-03-18,"));
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_existing_file_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 18).unwrap();
        let ledger_path = dir.path().join("attendance_2024-03-18.csv");
        std::fs::write(&ledger_path, "Name,Date,Time\ncarol,2024-03-18,08:00:00\n").unwrap();

        let mut ledger = CsvLedger::new(dir.path());
        assert_eq!(ledger.mark_if_absent("carol", day).unwrap(), MarkOutcome::AlreadyMarked);
        assert_eq!(ledger.mark_if_absent("dave", day).unwrap(), MarkOutcome::Marked);
        let text = std::fs::read_to_string(&ledger_path).unwrap();
        assert!(text.starts_with("Name,Date,Time\ncarol,"));
        assert!(text.contains("\ndave,2024-03-18,"));
    }
}
