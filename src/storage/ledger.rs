use crate::common::{Result, config::RecognitionConfig};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// One identity seen today. `first_seen` never changes once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub name: String,
    pub first_seen: NaiveTime,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Below the display threshold.
    Ignored,
    /// Shown on screen but not confident enough to insert.
    Tentative,
    Inserted,
    AlreadyPresent { updated: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub display: f32,
    pub confirm: f32,
}

impl Thresholds {
    pub fn from_config(config: &RecognitionConfig) -> Self {
        Self { display: config.display_threshold, confirm: config.confirm_threshold }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from_config(&RecognitionConfig::default())
    }
}

/// Durable backing for per-day ledgers.
pub trait LedgerStore: Send {
    /// Writes the full table for `date`, replacing any previous save.
    fn save(&self, date: NaiveDate, records: &[IdentityRecord]) -> Result<()>;
    /// The saved table for `date`, or `None` when nothing was saved that day.
    fn load(&self, date: NaiveDate) -> Result<Option<Vec<IdentityRecord>>>;
    /// Names of every saved table, sorted.
    fn list(&self) -> Result<Vec<String>>;
    /// Reads a saved table by file name; `FileNotFound` when absent.
    fn read_file(&self, file_name: &str) -> Result<Vec<IdentityRecord>>;
}

/// Today's first-seen table. Mutated by the recognition cycle only; readers take
/// a [`snapshot`](Self::snapshot).
pub struct AttendanceLedger {
    date: NaiveDate,
    records: Vec<IdentityRecord>,
    thresholds: Thresholds,
    store: Box<dyn LedgerStore>,
    flush_interval: Duration,
    last_flush: Instant,
    dirty: bool,
}

impl AttendanceLedger {
    /// Opens the ledger for `date`, resuming from a same-day save if present.
    pub fn open(
        store: Box<dyn LedgerStore>,
        date: NaiveDate,
        thresholds: Thresholds,
        flush_interval: Duration,
    ) -> Result<Self> {
        let records = store.load(date)?.unwrap_or_default();
        if !records.is_empty() {
            tracing::info!("Resumed attendance for {} with {} records", date, records.len());
        }

        Ok(Self {
            date,
            records,
            thresholds,
            store,
            flush_interval,
            last_flush: Instant::now(),
            dirty: false,
        })
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn record(&mut self, name: &str, confidence: f32, at: NaiveDateTime) -> Result<RecordOutcome> {
        self.advance_to(at.date())?;

        if confidence < self.thresholds.display {
            return Ok(RecordOutcome::Ignored);
        }

        if let Some(existing) = self.records.iter_mut().find(|r| r.name == name) {
            let updated = confidence >= self.thresholds.confirm && confidence > existing.confidence;
            if updated {
                existing.confidence = confidence;
                self.dirty = true;
            }
            return Ok(RecordOutcome::AlreadyPresent { updated });
        }

        if confidence < self.thresholds.confirm {
            return Ok(RecordOutcome::Tentative);
        }

        let time = at.time();
        let first_seen = time.with_nanosecond(0).unwrap_or(time);
        self.records.push(IdentityRecord {
            name: name.to_string(),
            first_seen,
            confidence,
        });
        self.dirty = true;
        tracing::info!("Attendance: {} at {} ({:.2})", name, first_seen, confidence);
        Ok(RecordOutcome::Inserted)
    }

    /// Sorts by name and writes the whole table, replacing the day's file.
    pub fn flush(&mut self) -> Result<()> {
        self.records.sort_by(|a, b| a.name.cmp(&b.name));
        self.store.save(self.date, &self.records)?;
        self.dirty = false;
        self.last_flush = Instant::now();
        tracing::debug!("Flushed {} attendance records for {}", self.records.len(), self.date);
        Ok(())
    }

    /// Flushes when there are unsaved changes and the interval has elapsed.
    pub fn flush_if_due(&mut self, now: Instant) -> Result<bool> {
        if !self.dirty || now.saturating_duration_since(self.last_flush) < self.flush_interval {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    /// Rolls over to `today` when it is later than the ledger's date. Returns
    /// whether a rollover happened.
    pub fn advance_to(&mut self, today: NaiveDate) -> Result<bool> {
        if today <= self.date {
            return Ok(false);
        }
        self.roll_over(today)?;
        Ok(true)
    }

    pub fn snapshot(&self) -> Vec<IdentityRecord> {
        self.records.clone()
    }

    pub fn list_files(&self) -> Result<Vec<String>> {
        self.store.list()
    }

    pub fn read_file(&self, file_name: &str) -> Result<Vec<IdentityRecord>> {
        self.store.read_file(file_name)
    }

    fn roll_over(&mut self, date: NaiveDate) -> Result<()> {
        tracing::info!("Attendance day rollover {} -> {}", self.date, date);
        self.flush()?;
        self.records = self.store.load(date)?.unwrap_or_default();
        self.date = date;
        self.dirty = false;
        Ok(())
    }
}
