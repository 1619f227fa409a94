use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sidechannel_protocol::{AuditRecord, AuditSink, TracingAudit};
use tracing::error;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Operator-facing audit trail: one plain text file per UTC day under `dir`,
/// e.g. `2026-10-19.log`, with lines like
/// `[WARN] [2026-10-19 08:15:02] denied `draw_text` from Plugin A (pluginA) [draw]`.
///
/// Records are also forwarded to `tracing`, so they show up in the regular
/// log and the json audit stream.
#[derive(Debug)]
pub struct FileAuditLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileAuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.log", date.format(DATE_FORMAT)))
    }

    pub fn format_line(record: &AuditRecord) -> String {
        format!(
            "[{}] [{}] {}",
            record.outcome.level(),
            record.timestamp.format(TIME_FORMAT),
            record
        )
    }

    fn append(&self, record: &AuditRecord) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(record.timestamp.date_naive()))?;
        writeln!(file, "{}", Self::format_line(record))
    }

    /// Days that have a log file, oldest first.
    pub fn days(&self) -> Result<Vec<NaiveDate>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut days = Vec::new();
        for entry in fs::read_dir(&self.dir).with_context(|| format!("could not list {}", self.dir.display()))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            if let Some(day) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| NaiveDate::parse_from_str(s, DATE_FORMAT).ok())
            {
                days.push(day);
            }
        }
        days.sort();
        Ok(days)
    }

    /// Every line logged on `date`. A day without a file has no lines.
    pub fn read_log(&self, date: NaiveDate) -> Result<Vec<String>> {
        let path = self.file_for(date);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&path).with_context(|| format!("could not read {}", path.display()))?;
        Ok(text.lines().map(str::to_string).collect())
    }

    /// Lines from `from` to `to`, both inclusive.
    pub fn range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for day in self.days()?.into_iter().filter(|d| *d >= from && *d <= to) {
            lines.extend(self.read_log(day)?);
        }
        Ok(lines)
    }

    /// The most recent `n` lines across all days.
    pub fn tail(&self, n: usize) -> Result<Vec<String>> {
        let mut out: Vec<String> = Vec::new();
        for day in self.days()?.into_iter().rev() {
            let mut lines = self.read_log(day)?;
            let need = n - out.len();
            if lines.len() > need {
                lines.drain(..lines.len() - need);
            }
            lines.extend(out);
            out = lines;
            if out.len() >= n {
                break;
            }
        }
        Ok(out)
    }

    /// Delete every log file, returning how many went.
    pub fn clean(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut removed = 0;
        for day in self.days()? {
            let path = self.file_for(day);
            fs::remove_file(&path).with_context(|| format!("could not delete {}", path.display()))?;
            removed += 1;
        }
        Ok(removed)
    }
}

impl AuditSink for FileAuditLog {
    fn record(&self, record: AuditRecord) {
        if let Err(err) = self.append(&record) {
            error!(dir = %self.dir.display(), "could not write audit record: {err}");
        }
        TracingAudit.record(record);
    }
}
