//! Date-indexed input tables, loading and series helpers.
//!
//! The core expects a dense calendar: every instrument in a table shares the
//! same strictly increasing date index. Gaps are filled by the caller (or by
//! [`fill_missing`] when loading from CSV) before the tables reach the
//! signal engine or the simulator.

use crate::error::{BubbleError, Result};
use chrono::NaiveDate;
use csv::ReaderBuilder;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Loader configuration for wide CSV tables.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Date format of the first column.
    pub date_format: String,
    /// CSV delimiter.
    pub delimiter: u8,
    /// Fill empty or unparsable cells forward, then backward.
    pub fill_gaps: bool,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            date_format: "%Y-%m-%d".to_string(),
            delimiter: b',',
            fill_gaps: true,
        }
    }
}

/// A dense, date-aligned table of numeric series keyed by instrument.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesTable {
    dates: Vec<NaiveDate>,
    columns: BTreeMap<String, Vec<f64>>,
}

impl SeriesTable {
    /// Create an empty table over a date index.
    ///
    /// Dates must be unique and strictly increasing.
    pub fn new(dates: Vec<NaiveDate>) -> Result<Self> {
        if let Some(pair) = dates.windows(2).find(|w| w[1] <= w[0]) {
            return Err(BubbleError::DataError(format!(
                "dates must be strictly increasing: {} followed by {}",
                pair[0], pair[1]
            )));
        }
        Ok(Self {
            dates,
            columns: BTreeMap::new(),
        })
    }

    /// Build a table from a date index and a set of columns.
    pub fn from_columns<S: Into<String>>(
        dates: Vec<NaiveDate>,
        columns: impl IntoIterator<Item = (S, Vec<f64>)>,
    ) -> Result<Self> {
        let mut table = Self::new(dates)?;
        for (name, values) in columns {
            table.insert(name, values)?;
        }
        Ok(table)
    }

    /// Add or replace a column.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        if values.len() != self.dates.len() {
            return Err(BubbleError::DataError(format!(
                "column '{}' has {} values but the index has {} dates",
                name,
                values.len(),
                self.dates.len()
            )));
        }
        self.columns.insert(name, values);
        Ok(())
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    /// Instrument names in sorted order.
    pub fn instruments(&self) -> Vec<&str> {
        self.columns.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Position of a date in the index.
    pub fn index_of(&self, date: NaiveDate) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    /// Value of a column on a date.
    pub fn value(&self, name: &str, date: NaiveDate) -> Option<f64> {
        let idx = self.index_of(date)?;
        self.columns.get(name).map(|col| col[idx])
    }

    /// Number of dates.
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn num_instruments(&self) -> usize {
        self.columns.len()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.dates.first().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    /// Restrict the table to the named instruments.
    ///
    /// Unknown names are reported as a data error.
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let mut columns = BTreeMap::new();
        for name in names {
            let name = name.as_ref();
            let values = self.columns.get(name).ok_or_else(|| {
                BubbleError::DataError(format!("unknown instrument: {}", name))
            })?;
            columns.insert(name.to_string(), values.clone());
        }
        Ok(Self {
            dates: self.dates.clone(),
            columns,
        })
    }

    /// Check that every column holds finite, strictly positive prices.
    pub fn validate_prices(&self) -> Result<()> {
        if self.dates.is_empty() || self.columns.is_empty() {
            return Err(BubbleError::NoData);
        }
        for (name, values) in &self.columns {
            if let Some((idx, v)) = values
                .iter()
                .enumerate()
                .find(|(_, v)| !v.is_finite() || **v <= 0.0)
            {
                return Err(BubbleError::DataError(format!(
                    "instrument '{}' has invalid price {} on {}",
                    name, v, self.dates[idx]
                )));
            }
        }
        Ok(())
    }
}

/// Load a wide CSV table: first column dates, one column per instrument.
pub fn load_table_csv(path: impl AsRef<Path>, config: &TableConfig) -> Result<SeriesTable> {
    let path = path.as_ref();
    info!("Loading table from: {}", path.display());

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(config.delimiter)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    if headers.len() < 2 {
        return Err(BubbleError::DataError(
            "table needs a date column and at least one series".to_string(),
        ));
    }
    let names: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_string()).collect();

    let mut rows: Vec<(NaiveDate, Vec<f64>)> = Vec::new();
    let mut missing_cells = 0usize;

    for (row_num, record) in reader.records().enumerate() {
        let record = record?;
        let raw_date = record.get(0).unwrap_or_default().trim();
        let date = NaiveDate::parse_from_str(raw_date, &config.date_format)?;

        let values: Vec<f64> = (0..names.len())
            .map(|col| {
                record
                    .get(col + 1)
                    .map(str::trim)
                    .filter(|cell| !cell.is_empty())
                    .and_then(|cell| cell.parse::<f64>().ok())
                    .unwrap_or_else(|| {
                        debug!("Missing cell at row {} column {}", row_num + 1, col + 1);
                        missing_cells += 1;
                        f64::NAN
                    })
            })
            .collect();
        rows.push((date, values));
    }

    rows.sort_by_key(|(date, _)| *date);
    let original_len = rows.len();
    rows.dedup_by_key(|(date, _)| *date);
    if rows.len() < original_len {
        warn!("Removed {} duplicate dates", original_len - rows.len());
    }

    if rows.is_empty() {
        return Err(BubbleError::NoData);
    }

    if missing_cells > 0 {
        if config.fill_gaps {
            warn!("Filling {} missing cells", missing_cells);
        } else {
            warn!("{} missing cells left as NaN", missing_cells);
        }
    }

    let dates: Vec<NaiveDate> = rows.iter().map(|(date, _)| *date).collect();
    let mut table = SeriesTable::new(dates)?;
    for (col, name) in names.iter().enumerate() {
        let mut values: Vec<f64> = rows.iter().map(|(_, v)| v[col]).collect();
        if config.fill_gaps {
            fill_missing(&mut values);
        }
        table.insert(name.clone(), values)?;
    }

    info!(
        "Loaded {} series over {} dates ({} to {})",
        table.num_instruments(),
        table.len(),
        table.first_date().map(|d| d.to_string()).unwrap_or_default(),
        table.last_date().map(|d| d.to_string()).unwrap_or_default()
    );

    Ok(table)
}

/// Replace non-finite values by the previous finite value, then fill any
/// leading gap with the first finite value.
pub fn fill_missing(values: &mut [f64]) {
    let mut last: Option<f64> = None;
    for v in values.iter_mut() {
        if v.is_finite() {
            last = Some(*v);
        } else if let Some(prev) = last {
            *v = prev;
        }
    }

    if let Some(first) = values.iter().copied().find(|v| v.is_finite()) {
        for v in values.iter_mut() {
            if v.is_finite() {
                break;
            }
            *v = first;
        }
    }
}

/// Trailing moving average keeping only complete windows.
///
/// Returns `values.len() - width + 1` samples, or an empty vector when the
/// input is shorter than `width`.
pub fn rolling_mean(values: &[f64], width: usize) -> Vec<f64> {
    if width == 0 || values.len() < width {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(values.len() - width + 1);
    let mut sum: f64 = values[..width].iter().sum();
    out.push(sum / width as f64);
    for i in width..values.len() {
        sum += values[i] - values[i - width];
        out.push(sum / width as f64);
    }
    out
}

/// Mean of the `lookback` values ending at `index` (inclusive).
///
/// Returns `None` while the history is shorter than `lookback` or when it
/// contains a non-finite value.
pub fn trailing_mean(values: &[f64], index: usize, lookback: usize) -> Option<f64> {
    if lookback == 0 || index >= values.len() || index + 1 < lookback {
        return None;
    }
    let window = &values[index + 1 - lookback..=index];
    if window.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(window.iter().sum::<f64>() / lookback as f64)
}

/// End indices of the analysis windows for a series of `len` samples.
///
/// The first window ends at `window - 1`; later windows are `stride` samples
/// apart.
pub fn analysis_indices(len: usize, window: usize, stride: usize) -> Vec<usize> {
    if window == 0 || stride == 0 || len < window {
        return Vec::new();
    }
    (window - 1..len).step_by(stride).collect()
}

/// The `window` samples ending at `end` (inclusive).
pub fn window_ending_at(values: &[f64], end: usize, window: usize) -> Option<&[f64]> {
    if window == 0 || end >= values.len() || end + 1 < window {
        return None;
    }
    Some(&values[end + 1 - window..=end])
}

/// Ordinal day number used as the time axis of curve fits.
pub fn ordinal(date: NaiveDate) -> i64 {
    use chrono::Datelike;
    date.num_days_from_ce() as i64
}

/// Consecutive calendar days starting at `start`.
pub fn daily_dates(start: NaiveDate, count: usize) -> Vec<NaiveDate> {
    start.iter_days().take(count).collect()
}
