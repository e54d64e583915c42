//! CSV loading for weights, prices, benchmark, trading days, and rankings.

use crate::error::{BacktestError, Result};
use crate::selection::{RankMatrix, TradabilityMask};
use crate::types::{BenchmarkSeries, ExecutionPrice, PriceTable, TradingCalendar, WeightMatrix};
use chrono::{NaiveDate, NaiveDateTime};
use csv::{Reader, ReaderBuilder, StringRecord};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info, warn};

/// Long-format VWAP row.
#[derive(Debug, Deserialize)]
struct PriceRow {
    #[serde(
        alias = "instrument",
        alias = "symbol",
        alias = "code",
        alias = "stock"
    )]
    order_book_id: String,
    #[serde(alias = "date", alias = "Date", alias = "trade_date", alias = "Datetime")]
    datetime: String,
    #[serde(
        alias = "unadjusted",
        alias = "vwap",
        default,
        deserialize_with = "csv::invalid_option"
    )]
    unadjusted_vwap: Option<f64>,
    #[serde(
        alias = "adjusted",
        alias = "adj_vwap",
        alias = "post_adjusted_vwap",
        default,
        deserialize_with = "csv::invalid_option"
    )]
    post_vwap: Option<f64>,
}

/// Long-format ranking row.
#[derive(Debug, Deserialize)]
struct RankRow {
    #[serde(alias = "date", alias = "Date", alias = "trade_date")]
    datetime: String,
    #[serde(alias = "instrument", alias = "symbol", alias = "code", alias = "stock")]
    order_book_id: String,
    #[serde(alias = "Rank", alias = "score_rank", deserialize_with = "csv::invalid_option")]
    rank: Option<f64>,
}

/// Data source configuration.
#[derive(Debug, Clone)]
pub struct DataConfig {
    /// Date format string tried before the built-in formats (e.g., "%Y%m%d").
    pub date_format: Option<String>,
    /// CSV delimiter character. If None, delimiter is auto-detected.
    pub delimiter: Option<u8>,
    /// Skip invalid rows instead of failing.
    pub skip_invalid: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            date_format: None,
            delimiter: None,
            skip_invalid: true,
        }
    }
}

/// Detect the CSV delimiter from the first few lines of the file.
///
/// Picks the candidate that splits every sampled line into the same number
/// of fields, preferring the one that yields the most fields.
fn detect_delimiter(path: &Path) -> Result<u8> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let lines: Vec<String> = reader.lines().take(5).filter_map(|l| l.ok()).collect();

    if lines.is_empty() {
        return Ok(b',');
    }

    let mut best_delimiter = b',';
    let mut best_score = 1;

    for &delim in &[b',', b'\t', b';', b'|'] {
        let counts: Vec<usize> = lines
            .iter()
            .map(|line| line.as_bytes().iter().filter(|&&b| b == delim).count() + 1)
            .collect();
        let first_count = counts[0];
        if counts.iter().all(|&c| c == first_count) && first_count > best_score {
            best_score = first_count;
            best_delimiter = delim;
        }
    }

    Ok(best_delimiter)
}

/// Parse a date, accepting a trailing time component.
pub fn parse_date(s: &str, format: Option<&str>) -> Result<NaiveDate> {
    let s = s.trim();

    if let Some(fmt) = format {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d);
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.date());
        }
    }

    let date_formats = ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d", "%d/%m/%Y", "%d-%b-%Y"];
    for fmt in &date_formats {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d);
        }
    }

    let datetime_formats = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y/%m/%d %H:%M:%S",
    ];
    for fmt in &datetime_formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.date());
        }
    }

    Err(BacktestError::DataError(format!(
        "Could not parse date: '{}'",
        s
    )))
}

/// Parse a numeric cell. Empty and NaN cells are absent values.
fn parse_cell(s: &str) -> std::result::Result<Option<f64>, std::num::ParseFloatError> {
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("nan") || s.eq_ignore_ascii_case("null") {
        return Ok(None);
    }
    let v: f64 = s.parse()?;
    Ok(v.is_finite().then_some(v))
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "1.0" | "t" | "yes" => Some(true),
        "false" | "0" | "0.0" | "f" | "no" => Some(false),
        _ => None,
    }
}

fn open_reader(path: &Path, config: &DataConfig, has_headers: bool) -> Result<Reader<File>> {
    let delimiter = match config.delimiter {
        Some(d) => d,
        None => {
            let detected = detect_delimiter(path)?;
            debug!("Auto-detected delimiter: {:?}", char::from(detected));
            detected
        }
    };

    Ok(ReaderBuilder::new()
        .has_headers(has_headers)
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)?)
}

/// Either skip a bad row or surface the error, per `skip_invalid`.
fn reject(config: &DataConfig, skipped: &mut usize, row_num: usize, err: BacktestError) -> Result<()> {
    if config.skip_invalid {
        debug!("Skipping row {}: {}", row_num, err);
        *skipped += 1;
        Ok(())
    } else {
        Err(err)
    }
}

/// Wide table read: header row, first column dates, remaining columns one
/// per instrument. Each parsed row is handed to `on_row`.
fn read_wide<T>(
    path: &Path,
    config: &DataConfig,
    mut parse: impl FnMut(&str) -> Option<T>,
    mut on_row: impl FnMut(NaiveDate, Vec<(String, T)>),
) -> Result<usize> {
    let mut reader = open_reader(path, config, true)?;
    let headers: StringRecord = reader.headers()?.clone();
    if headers.len() < 2 {
        return Err(BacktestError::DataError(format!(
            "{}: expected a date column followed by instrument columns",
            path.display()
        )));
    }
    let instruments: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_string()).collect();

    let mut seen = std::collections::BTreeSet::new();
    let mut skipped = 0;
    for (i, record) in reader.records().enumerate() {
        let row_num = i + 1;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                reject(config, &mut skipped, row_num, e.into())?;
                continue;
            }
        };
        let date = match parse_date(record.get(0).unwrap_or(""), config.date_format.as_deref()) {
            Ok(d) => d,
            Err(e) => {
                reject(config, &mut skipped, row_num, e)?;
                continue;
            }
        };
        if !seen.insert(date) {
            return Err(BacktestError::DataError(format!(
                "{}: duplicate date {}",
                path.display(),
                date
            )));
        }

        let mut cells = Vec::new();
        for (col, instrument) in instruments.iter().enumerate() {
            let raw = record.get(col + 1).unwrap_or("");
            if let Some(v) = parse(raw) {
                cells.push((instrument.clone(), v));
            }
        }
        on_row(date, cells);
    }

    if skipped > 0 {
        warn!("Skipped {} invalid rows in {}", skipped, path.display());
    }
    Ok(instruments.len())
}

/// Load a wide weight matrix. Empty cells are absent instruments; a row with
/// no values is kept as an empty (hold) row.
pub fn load_weight_matrix(path: impl AsRef<Path>, config: &DataConfig) -> Result<WeightMatrix> {
    let path = path.as_ref();
    info!("Loading weights from: {}", path.display());

    let mut weights = WeightMatrix::new();
    let mut bad_cells = 0usize;
    let columns = read_wide(
        path,
        config,
        |raw| match parse_cell(raw) {
            Ok(v) => v,
            Err(_) => {
                bad_cells += 1;
                None
            }
        },
        |date, cells| weights.set_row(date, cells.into_iter().collect()),
    )?;

    if bad_cells > 0 {
        if config.skip_invalid {
            warn!("Ignored {} unparseable weight cells", bad_cells);
        } else {
            return Err(BacktestError::DataError(format!(
                "{} unparseable weight cells in {}",
                bad_cells,
                path.display()
            )));
        }
    }
    if weights.is_empty() {
        return Err(BacktestError::NoData);
    }
    weights.validate()?;

    info!(
        "Loaded {} weight rows x {} instruments from {} to {}",
        weights.len(),
        columns,
        weights.first_date().map(|d| d.to_string()).unwrap_or_default(),
        weights.last_date().map(|d| d.to_string()).unwrap_or_default()
    );
    Ok(weights)
}

/// Load a long VWAP table (`order_book_id, datetime, unadjusted_vwap, post_vwap`).
pub fn load_price_table(path: impl AsRef<Path>, config: &DataConfig) -> Result<PriceTable> {
    let path = path.as_ref();
    info!("Loading prices from: {}", path.display());

    let mut reader = open_reader(path, config, true)?;
    let mut prices = PriceTable::new();
    let mut skipped = 0;

    for (i, result) in reader.deserialize::<PriceRow>().enumerate() {
        let row_num = i + 1;
        let row = match result {
            Ok(r) => r,
            Err(e) => {
                reject(config, &mut skipped, row_num, e.into())?;
                continue;
            }
        };
        let date = match parse_date(&row.datetime, config.date_format.as_deref()) {
            Ok(d) => d,
            Err(e) => {
                reject(config, &mut skipped, row_num, e)?;
                continue;
            }
        };
        let price = ExecutionPrice::new(row.unadjusted_vwap, row.post_vwap);
        if price.unadjusted.is_none() && price.adjusted.is_none() {
            continue;
        }
        prices.insert(row.order_book_id.trim(), date, price);
    }

    if skipped > 0 {
        warn!("Skipped {} invalid rows", skipped);
    }
    if prices.is_empty() {
        return Err(BacktestError::NoData);
    }

    info!(
        "Loaded prices for {} instruments over {} dates",
        prices.instruments().len(),
        prices.len()
    );
    Ok(prices)
}

fn find_column(headers: &StringRecord, names: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| names.iter().any(|n| h.trim().eq_ignore_ascii_case(n)))
}

/// Load a benchmark series: a date column plus one value column. The value
/// column header becomes the series name.
pub fn load_benchmark(path: impl AsRef<Path>, config: &DataConfig) -> Result<BenchmarkSeries> {
    let path = path.as_ref();
    info!("Loading benchmark from: {}", path.display());

    let mut reader = open_reader(path, config, true)?;
    let headers = reader.headers()?.clone();
    let date_col = find_column(&headers, &["datetime", "date", "trade_date"]).unwrap_or(0);
    let value_col = find_column(&headers, &["close", "open", "value", "price"])
        .or_else(|| (0..headers.len()).find(|&i| i != date_col))
        .ok_or_else(|| {
            BacktestError::DataError(format!("{}: no benchmark value column", path.display()))
        })?;
    let name = headers.get(value_col).unwrap_or("benchmark").trim().to_string();

    let mut series = BenchmarkSeries::new(name);
    let mut skipped = 0;
    for (i, record) in reader.records().enumerate() {
        let row_num = i + 1;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                reject(config, &mut skipped, row_num, e.into())?;
                continue;
            }
        };
        let date = match parse_date(record.get(date_col).unwrap_or(""), config.date_format.as_deref()) {
            Ok(d) => d,
            Err(e) => {
                reject(config, &mut skipped, row_num, e)?;
                continue;
            }
        };
        match parse_cell(record.get(value_col).unwrap_or("")) {
            Ok(Some(v)) if v > 0.0 => series.insert(date, v),
            Ok(_) => debug!("No benchmark value on {}", date),
            Err(e) => reject(
                config,
                &mut skipped,
                row_num,
                BacktestError::DataError(format!("bad benchmark value: {}", e)),
            )?,
        }
    }

    if skipped > 0 {
        warn!("Skipped {} invalid rows", skipped);
    }
    if series.is_empty() {
        return Err(BacktestError::NoData);
    }

    info!(
        "Loaded benchmark {} with {} points",
        series.name,
        series.len()
    );
    Ok(series)
}

/// Load trading days: the first date-parsable field of each row. Header and
/// index-only rows are ignored.
pub fn load_trading_days(path: impl AsRef<Path>, config: &DataConfig) -> Result<TradingCalendar> {
    let path = path.as_ref();
    info!("Loading trading days from: {}", path.display());

    let mut reader = open_reader(path, config, false)?;
    let mut dates = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(date) = record
            .iter()
            .find_map(|field| parse_date(field, config.date_format.as_deref()).ok())
        {
            dates.push(date);
        }
    }

    let calendar = TradingCalendar::new(dates);
    if calendar.is_empty() {
        return Err(BacktestError::NoData);
    }
    info!("Loaded {} trading days", calendar.len());
    Ok(calendar)
}

/// Load a long ranking table (`datetime, order_book_id, rank`).
pub fn load_rank_matrix(path: impl AsRef<Path>, config: &DataConfig) -> Result<RankMatrix> {
    let path = path.as_ref();
    info!("Loading rankings from: {}", path.display());

    let mut reader = open_reader(path, config, true)?;
    let mut ranks = RankMatrix::new();
    let mut skipped = 0;

    for (i, result) in reader.deserialize::<RankRow>().enumerate() {
        let row_num = i + 1;
        let row = match result {
            Ok(r) => r,
            Err(e) => {
                reject(config, &mut skipped, row_num, e.into())?;
                continue;
            }
        };
        let date = match parse_date(&row.datetime, config.date_format.as_deref()) {
            Ok(d) => d,
            Err(e) => {
                reject(config, &mut skipped, row_num, e)?;
                continue;
            }
        };
        if let Some(rank) = row.rank.filter(|r| r.is_finite()) {
            ranks.insert(date, row.order_book_id.trim(), rank);
        }
    }

    if skipped > 0 {
        warn!("Skipped {} invalid rows", skipped);
    }
    if ranks.is_empty() {
        return Err(BacktestError::NoData);
    }
    info!("Loaded rankings on {} dates", ranks.len());
    Ok(ranks)
}

/// Load a wide tradability mask (`true`/`false` or `1`/`0` cells).
pub fn load_tradability_mask(path: impl AsRef<Path>, config: &DataConfig) -> Result<TradabilityMask> {
    let path = path.as_ref();
    info!("Loading tradability mask from: {}", path.display());

    let mut rows: BTreeMap<NaiveDate, Vec<(String, bool)>> = BTreeMap::new();
    read_wide(path, config, parse_flag, |date, cells| {
        rows.insert(date, cells);
    })?;

    let mut mask = TradabilityMask::new();
    let mut blocked = 0usize;
    for (date, cells) in rows {
        for (instrument, tradable) in cells {
            if !tradable {
                blocked += 1;
            }
            mask.insert(date, instrument, tradable);
        }
    }
    if mask.is_empty() {
        return Err(BacktestError::NoData);
    }
    info!(
        "Loaded mask over {} dates ({} blocked cells)",
        mask.len(),
        blocked
    );
    Ok(mask)
}
