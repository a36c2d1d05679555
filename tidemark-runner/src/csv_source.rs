//! CSV replay source.
//!
//! Serves vendor exports from a directory through the `SourceAdapter`
//! contract:
//! - `{dir}/{code}.csv`: daily bars
//! - `{dir}/{code}.minute.csv`: minute bars
//! - `{dir}/{code}.fundamentals.csv`: quarterly fundamentals
//!
//! Rows are filtered by date range (or fiscal quarter) before they are
//! returned. A missing file means the vendor has nothing for that code.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use std::path::{Path, PathBuf};
use tidemark_core::data::{parse_timestamp, RawRow, SourceAdapter, SourceError};
use tracing::debug;

const DAILY_DATE_COLUMNS: &[&str] = &["date", "trade_date"];
const MINUTE_DATE_COLUMNS: &[&str] = &["time", "timestamp", "date"];
const REPORT_DATE_COLUMNS: &[&str] = &["statDate", "report_date"];

pub struct CsvSource {
    name: String,
    dir: PathBuf,
}

impl CsvSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            name: "csv".to_string(),
            dir: dir.into(),
        }
    }

    /// Report rows under a different provider name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, code: &str, suffix: &str) -> PathBuf {
        self.dir.join(format!("{code}{suffix}"))
    }

    async fn load(&self, path: PathBuf) -> Result<Vec<RawRow>, SourceError> {
        tokio::task::spawn_blocking(move || read_rows(&path))
            .await
            .map_err(|e| SourceError::Other(format!("csv reader task failed: {e}")))?
    }
}

/// Read every row of a headed CSV file as text columns.
fn read_rows(path: &Path) -> Result<Vec<RawRow>, SourceError> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no csv export");
            return Ok(Vec::new());
        }
        Err(e) => return Err(SourceError::Other(format!("open {}: {e}", path.display()))),
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);
    let headers = reader
        .headers()
        .map_err(|e| SourceError::ResponseFormatChanged(format!("{}: {e}", path.display())))?
        .clone();

    let mut rows: Vec<RawRow> = Vec::new();
    for record in reader.records() {
        let record = record
            .map_err(|e| SourceError::ResponseFormatChanged(format!("{}: {e}", path.display())))?;
        rows.push(
            headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.to_string(), v.to_string()))
                .collect(),
        );
    }
    Ok(rows)
}

fn row_date(row: &RawRow, columns: &[&str]) -> Option<NaiveDate> {
    columns
        .iter()
        .find_map(|c| row.get(c).and_then(parse_timestamp))
        .map(|ts| ts.date())
}

fn within(rows: Vec<RawRow>, columns: &[&str], start: NaiveDate, end: NaiveDate) -> Vec<RawRow> {
    rows.into_iter()
        .filter(|row| row_date(row, columns).is_some_and(|d| d >= start && d <= end))
        .collect()
}

fn quarter_of(date: NaiveDate) -> u32 {
    (date.month() - 1) / 3 + 1
}

/// Rows tagged with `year`/`quarter`, else rows whose report date falls in the quarter.
fn in_quarter(row: &RawRow, year: i32, quarter: u32) -> bool {
    let tagged = row
        .get("year")
        .and_then(|y| y.parse::<i32>().ok())
        .zip(row.get("quarter").and_then(|q| q.parse::<u32>().ok()));
    match tagged {
        Some((y, q)) => y == year && q == quarter,
        None => row_date(row, REPORT_DATE_COLUMNS)
            .is_some_and(|d| d.year() == year && quarter_of(d) == quarter),
    }
}

#[async_trait]
impl SourceAdapter for CsvSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawRow>, SourceError> {
        let rows = self.load(self.path(code, ".csv")).await?;
        Ok(within(rows, DAILY_DATE_COLUMNS, start, end))
    }

    async fn fetch_intraday(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawRow>, SourceError> {
        let rows = self.load(self.path(code, ".minute.csv")).await?;
        Ok(within(rows, MINUTE_DATE_COLUMNS, start, end))
    }

    async fn fetch_fundamentals(
        &self,
        code: &str,
        year: i32,
        quarter: u32,
    ) -> Result<Vec<RawRow>, SourceError> {
        let rows = self.load(self.path(code, ".fundamentals.csv")).await?;
        Ok(rows
            .into_iter()
            .filter(|row| in_quarter(row, year, quarter))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn write(dir: &TempDir, name: &str, body: &str) {
        std::fs::write(dir.path().join(name), body).unwrap();
    }

    #[tokio::test]
    async fn daily_rows_filtered_by_range() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "600519.csv",
            "date,code,open,high,low,close,volume\n\
             2024-01-02,600519,10,11,9,10.5,100\n\
             2024-01-03,600519,10.5,12,10,11.5,120\n\
             2024-01-04,600519,11.5,12,11,11.8,90\n",
        );
        let source = CsvSource::new(dir.path());
        let rows = source
            .fetch("600519", d(2024, 1, 3), d(2024, 1, 31))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("close"), Some("11.5"));
        assert_eq!(source.name(), "csv");
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let source = CsvSource::new(dir.path());
        let rows = source.fetch("NOPE", d(2024, 1, 1), d(2024, 2, 1)).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn minute_rows_use_compact_time() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "X.minute.csv",
            "date,time,code,open,high,low,close\n\
             2024-01-02,20240102093500000,X,1,1,1,1\n\
             2024-01-05,20240105093500000,X,2,2,2,2\n",
        );
        let rows = CsvSource::new(dir.path())
            .fetch_intraday("X", d(2024, 1, 1), d(2024, 1, 3))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn fundamentals_select_quarter() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "X.fundamentals.csv",
            "code,statDate,roeAvg\n\
             X,2023-12-31,0.12\n\
             X,2024-03-31,0.03\n",
        );
        let source = CsvSource::new(dir.path());
        let q1 = source.fetch_fundamentals("X", 2024, 1).await.unwrap();
        assert_eq!(q1.len(), 1);
        assert_eq!(q1[0].get("roeAvg"), Some("0.03"));
        assert!(source.fetch_fundamentals("X", 2024, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_format_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("BAD.csv"), [0xff, 0xfe, b'\n', 0xff]).unwrap();
        let err = CsvSource::new(dir.path())
            .fetch("BAD", d(2024, 1, 1), d(2024, 2, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::ResponseFormatChanged(_)));
    }
}
