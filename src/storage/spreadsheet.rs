use crate::common::{AttendanceError, Result, paths::attendance_file_name};
use crate::storage::ledger::{IdentityRecord, LedgerStore};
use calamine::{open_workbook, Data, Reader, Xlsx};
use chrono::{NaiveDate, NaiveTime};
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use std::fs;
use std::path::{Path, PathBuf};

const TIME_FORMAT: &str = "%H:%M:%S";

/// Stores one `<MMDDYYYY>.xlsx` workbook per day with columns Name, Time, Confidence.
pub struct XlsxLedgerStore {
    dir: PathBuf,
}

impl XlsxLedgerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn resolve(&self, file_name: &str) -> Result<PathBuf> {
        let valid = !file_name.is_empty()
            && !file_name.starts_with('.')
            && !file_name.contains(['/', '\\'])
            && file_name.ends_with(".xlsx");
        if !valid {
            return Err(AttendanceError::FileNotFound(file_name.to_string()));
        }

        let path = self.dir.join(file_name);
        if !path.is_file() {
            return Err(AttendanceError::FileNotFound(file_name.to_string()));
        }
        Ok(path)
    }
}

impl LedgerStore for XlsxLedgerStore {
    fn save(&self, date: NaiveDate, records: &[IdentityRecord]) -> Result<()> {
        let file_name = attendance_file_name(date);
        let target = self.dir.join(&file_name);
        let partial = self.dir.join(format!(".{}.partial", file_name));

        write_workbook(&partial, records).map_err(|e| {
            AttendanceError::Storage(format!("Failed to write {}: {}", file_name, e))
        })?;
        fs::rename(&partial, &target)?;
        Ok(())
    }

    fn load(&self, date: NaiveDate) -> Result<Option<Vec<IdentityRecord>>> {
        let path = self.dir.join(attendance_file_name(date));
        if !path.is_file() {
            return Ok(None);
        }
        read_workbook(&path).map(Some)
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".xlsx") && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_file(&self, file_name: &str) -> Result<Vec<IdentityRecord>> {
        let path = self.resolve(file_name)?;
        read_workbook(&path)
    }
}

fn write_workbook(path: &Path, records: &[IdentityRecord]) -> std::result::Result<(), XlsxError> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let worksheet = workbook.add_worksheet();

    worksheet.write_string_with_format(0, 0, "Name", &bold)?;
    worksheet.write_string_with_format(0, 1, "Time", &bold)?;
    worksheet.write_string_with_format(0, 2, "Confidence", &bold)?;
    worksheet.set_column_width(0, 24)?;
    worksheet.set_column_width(1, 12)?;

    for (i, record) in records.iter().enumerate() {
        let row = i as u32 + 1;
        worksheet.write_string(row, 0, record.name.as_str())?;
        worksheet.write_string(row, 1, record.first_seen.format(TIME_FORMAT).to_string())?;
        worksheet.write_number(row, 2, f64::from(record.confidence))?;
    }

    workbook.save(path)
}

fn read_workbook(path: &Path) -> Result<Vec<IdentityRecord>> {
    let mut workbook: Xlsx<_> = open_workbook(path)
        .map_err(|e| AttendanceError::Storage(format!("Failed to open {}: {}", path.display(), e)))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| AttendanceError::Storage(format!("{} has no worksheet", path.display())))?
        .map_err(|e| AttendanceError::Storage(format!("Failed to read {}: {}", path.display(), e)))?;

    let mut records = Vec::new();
    for (index, row) in range.rows().enumerate().skip(1) {
        match parse_row(row) {
            Some(record) => records.push(record),
            None => tracing::warn!("Skipping malformed row {} in {}", index + 1, path.display()),
        }
    }
    Ok(records)
}

fn parse_row(row: &[Data]) -> Option<IdentityRecord> {
    let name = match row.first()? {
        Data::String(s) if !s.is_empty() => s.clone(),
        _ => return None,
    };
    let first_seen = match row.get(1)? {
        Data::String(s) => NaiveTime::parse_from_str(s, TIME_FORMAT).ok()?,
        _ => return None,
    };
    let confidence = match row.get(2)? {
        Data::Float(f) => *f as f32,
        Data::Int(i) => *i as f32,
        Data::String(s) => s.parse().ok()?,
        _ => return None,
    };
    Some(IdentityRecord { name, first_seen, confidence })
}
