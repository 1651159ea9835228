//! Per-day traffic log files.
//!
//! Each calendar day (local time of the entry timestamp) gets one
//! `YYYY-MM-DD.ndjson` file holding one JSON-encoded [`ApiLogEntry`] per line.
//! Files are only ever appended to or deleted whole.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{Local, NaiveDate, TimeZone};
use tracing::{debug, warn};

use watchtower_core::{ApiLogEntry, LogFilter};

use crate::error::{Result, StorageError};

const EXTENSION: &str = "ndjson";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Directory of daily NDJSON traffic logs.
#[derive(Debug, Clone)]
pub struct TrafficLogStore {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl TrafficLogStore {
    /// Opens (creating if needed) a log directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// The directory holding the log files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Local calendar date for a unix-millisecond timestamp.
    pub fn date_for(timestamp_ms: i64) -> String {
        Local
            .timestamp_millis_opt(timestamp_ms)
            .earliest()
            .unwrap_or_else(Local::now)
            .format(DATE_FORMAT)
            .to_string()
    }

    /// Appends one entry.
    pub fn append(&self, entry: &ApiLogEntry) -> Result<()> {
        self.append_all(std::slice::from_ref(entry))
    }

    /// Appends a batch, keeping arrival order within each day's file.
    pub fn append_all(&self, entries: &[ApiLogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut by_date: BTreeMap<String, Vec<&ApiLogEntry>> = BTreeMap::new();
        for entry in entries {
            by_date
                .entry(Self::date_for(entry.timestamp))
                .or_default()
                .push(entry);
        }

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StorageError::Config("Traffic log lock poisoned".to_string()))?;

        for (date, batch) in by_date {
            let path = self.path_for(&date);
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let mut writer = BufWriter::new(file);
            for entry in &batch {
                serde_json::to_writer(&mut writer, entry)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
            debug!(date = %date, count = batch.len(), "Appended traffic log entries");
        }

        Ok(())
    }

    /// Dates that have a log file, newest first.
    pub fn list_dates(&self) -> Result<Vec<String>> {
        let mut dates = Vec::new();
        for item in fs::read_dir(&self.dir)? {
            let path = item?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if NaiveDate::parse_from_str(stem, DATE_FORMAT).is_ok() {
                    dates.push(stem.to_string());
                }
            }
        }
        dates.sort_unstable_by(|a, b| b.cmp(a));
        Ok(dates)
    }

    /// Entries for one date that pass `filter`, in arrival order.
    ///
    /// A date with no file yields an empty list. Lines that no longer parse
    /// are skipped.
    pub fn entries(&self, date: &str, filter: &LogFilter) -> Result<Vec<ApiLogEntry>> {
        let path = self.checked_path(date)?;
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ApiLogEntry>(&line) {
                Ok(entry) if filter.matches(&entry) => out.push(entry),
                Ok(_) => {}
                Err(e) => warn!(date = %date, line = index + 1, "Skipping unreadable log line: {}", e),
            }
        }
        Ok(out)
    }

    /// Looks up one entry by id.
    pub fn find(&self, date: &str, id: &str) -> Result<Option<ApiLogEntry>> {
        Ok(self
            .entries(date, &LogFilter::default())?
            .into_iter()
            .find(|e| e.id == id))
    }

    /// Deletes one date's file. Returns false when there was none.
    pub fn clear(&self, date: &str) -> Result<bool> {
        let path = self.checked_path(date)?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StorageError::Config("Traffic log lock poisoned".to_string()))?;

        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes every date's file, returning how many were removed.
    pub fn clear_all(&self) -> Result<usize> {
        let dates = self.list_dates()?;
        let mut removed = 0;
        for date in dates {
            if self.clear(&date)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn path_for(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", date, EXTENSION))
    }

    /// Only well-formed dates map to a path, so callers cannot escape the directory.
    fn checked_path(&self, date: &str) -> Result<PathBuf> {
        let date = date.trim();
        NaiveDate::parse_from_str(date, DATE_FORMAT)
            .map_err(|_| StorageError::Config(format!("Invalid log date: {}", date)))?;
        Ok(self.path_for(date))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use watchtower_core::LogSource;

    fn entry(id: &str, timestamp: i64, host: &str, path: &str) -> ApiLogEntry {
        ApiLogEntry {
            id: id.to_string(),
            timestamp,
            method: "GET".to_string(),
            url: format!("https://{}{}", host, path),
            host: host.to_string(),
            path: path.to_string(),
            status_code: 200,
            request_headers: HashMap::new(),
            request_body: None,
            response_headers: HashMap::new(),
            response_body: Some("{}".to_string()),
            source: LogSource::Proxy,
            elapsed_ms: 3,
        }
    }

    /// Noon local time on the given day, as unix millis.
    fn noon(year: i32, month: u32, day: u32) -> i64 {
        Local
            .with_ymd_and_hms(year, month, day, 12, 0, 0)
            .unwrap()
            .timestamp_millis()
    }

    fn store() -> (TempDir, TrafficLogStore) {
        let dir = TempDir::new().unwrap();
        let store = TrafficLogStore::new(dir.path().join("api_logs")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_entries_grouped_by_day_in_order() {
        let (_dir, store) = store();
        let d1 = noon(2025, 3, 1);
        let d2 = noon(2025, 3, 2);

        store
            .append_all(&[
                entry("a", d1, "api.test", "/a"),
                entry("b", d2, "api.test", "/b"),
                entry("c", d1 + 1, "api.test", "/c"),
            ])
            .unwrap();
        store.append(&entry("d", d1 + 2, "api.test", "/d")).unwrap();

        assert_eq!(store.list_dates().unwrap(), vec!["2025-03-02", "2025-03-01"]);

        let ids: Vec<String> = store
            .entries("2025-03-01", &LogFilter::default())
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["a", "c", "d"]);
    }

    #[test]
    fn test_clear_one_date_keeps_others() {
        let (_dir, store) = store();
        store
            .append_all(&[
                entry("a", noon(2025, 3, 1), "api.test", "/a"),
                entry("b", noon(2025, 3, 2), "api.test", "/b"),
            ])
            .unwrap();

        assert!(store.clear("2025-03-01").unwrap());
        assert!(!store.clear("2025-03-01").unwrap());
        assert_eq!(store.list_dates().unwrap(), vec!["2025-03-02"]);
        assert_eq!(
            store.entries("2025-03-02", &LogFilter::default()).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_clear_all() {
        let (_dir, store) = store();
        store
            .append_all(&[
                entry("a", noon(2025, 3, 1), "api.test", "/a"),
                entry("b", noon(2025, 3, 2), "api.test", "/b"),
            ])
            .unwrap();

        assert_eq!(store.clear_all().unwrap(), 2);
        assert!(store.list_dates().unwrap().is_empty());
    }

    #[test]
    fn test_filter_and_find() {
        let (_dir, store) = store();
        let ts = noon(2025, 4, 10);
        let mut post = entry("p", ts, "api.test", "/users");
        post.method = "POST".to_string();
        store
            .append_all(&[
                entry("a", ts, "api.test", "/users"),
                entry("b", ts, "cdn.test", "/logo.png"),
                post,
            ])
            .unwrap();

        let filter = LogFilter {
            method: Some("post".to_string()),
            ..Default::default()
        };
        let hits = store.entries("2025-04-10", &filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "p");

        let filter = LogFilter {
            host: Some("cdn".to_string()),
            ..Default::default()
        };
        assert_eq!(store.entries("2025-04-10", &filter).unwrap()[0].id, "b");

        assert_eq!(store.find("2025-04-10", "b").unwrap().unwrap().host, "cdn.test");
        assert!(store.find("2025-04-10", "zzz").unwrap().is_none());
    }

    #[test]
    fn test_missing_date_and_bad_input() {
        let (_dir, store) = store();

        assert!(store
            .entries("2024-01-01", &LogFilter::default())
            .unwrap()
            .is_empty());
        assert!(store.entries("../etc/passwd", &LogFilter::default()).is_err());
        assert!(store.clear("not-a-date").is_err());
    }

    #[test]
    fn test_skips_corrupt_lines_and_foreign_files() {
        let (_dir, store) = store();
        let ts = noon(2025, 5, 5);
        store.append(&entry("a", ts, "api.test", "/a")).unwrap();

        let path = store.dir().join("2025-05-05.ndjson");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{not json\n\n").unwrap();
        drop(file);
        store.append(&entry("b", ts, "api.test", "/b")).unwrap();
        fs::write(store.dir().join("notes.txt"), "x").unwrap();

        let ids: Vec<String> = store
            .entries("2025-05-05", &LogFilter::default())
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.list_dates().unwrap(), vec!["2025-05-05"]);
    }
}
