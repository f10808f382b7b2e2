use crate::error::{PipelineError, PipelineResult};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use tabled::Tabled;

/// In-memory delimited table: header names plus rows of string cells.
///
/// Every row is exactly as wide as the header. Notification records are rows
/// of this table, addressed through [`crate::config::NotificationColumns`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>) -> Self {
        Self { headers, rows: Vec::new() }
    }

    pub fn from_rows<S: AsRef<str>>(headers: &[S], rows: Vec<Vec<S>>) -> Self {
        let mut table = Table::new(headers.iter().map(|h| h.as_ref().to_string()).collect());
        for row in rows {
            table.push_row(row.iter().map(|c| c.as_ref().to_string()).collect());
        }
        table
    }

    /// Appends a row, padding missing cells with empty strings and dropping
    /// cells beyond the header width.
    pub fn push_row(&mut self, mut row: Vec<String>) {
        row.resize(self.headers.len(), String::new());
        self.rows.push(row);
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn require_column(&self, name: &str) -> PipelineResult<usize> {
        self.column(name)
            .ok_or_else(|| PipelineError::schema(name, &self.headers))
    }

    pub fn rows(&self) -> impl Iterator<Item = &[String]> {
        self.rows.iter().map(|r| r.as_slice())
    }

    pub fn value(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col).map(|s| s.as_str())
    }
}

/// Calendar month, stored as its first day. Renders as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeriodKey(NaiveDate);

impl PeriodKey {
    pub fn from_date(date: NaiveDate) -> Self {
        // Day 1 exists in every month, so `with_day(1)` cannot fail here.
        PeriodKey(date.with_day(1).unwrap_or(date))
    }

    pub fn first_day(&self) -> NaiveDate {
        self.0
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.0.year(), self.0.month())
    }
}

impl FromStr for PeriodKey {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| PipelineError::Config(format!("invalid period '{}'", s)))?;
        let year: i32 = year
            .parse()
            .map_err(|_| PipelineError::Config(format!("invalid period year in '{}'", s)))?;
        let month: u32 = month
            .parse()
            .map_err(|_| PipelineError::Config(format!("invalid period month in '{}'", s)))?;
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(PeriodKey)
            .ok_or_else(|| PipelineError::Config(format!("invalid period '{}'", s)))
    }
}

impl TryFrom<String> for PeriodKey {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeriodKey> for String {
    fn from(value: PeriodKey) -> Self {
        value.to_string()
    }
}

/// Inclusive window of valid notification dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    min: NaiveDate,
    max: NaiveDate,
}

impl DateRange {
    pub fn new(min: NaiveDate, max: NaiveDate) -> PipelineResult<Self> {
        if min > max {
            return Err(PipelineError::Config(format!(
                "date range start {} is after its end {}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> NaiveDate {
        self.min
    }

    pub fn max(&self) -> NaiveDate {
        self.max
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        (self.min..=self.max).contains(&date)
    }
}

/// Region → population lookup used for rate joins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PopulationReference {
    by_region: HashMap<String, u64>,
}

impl PopulationReference {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a region. Returns `false` and keeps the existing value when the
    /// region is already present.
    pub fn insert(&mut self, region: &str, population: u64) -> bool {
        let region = region.trim();
        if self.by_region.contains_key(region) {
            return false;
        }
        self.by_region.insert(region.to_string(), population);
        true
    }

    pub fn get(&self, region: &str) -> Option<u64> {
        self.by_region.get(region.trim()).copied()
    }

    pub fn len(&self) -> usize {
        self.by_region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_region.is_empty()
    }
}

impl<'a> FromIterator<(&'a str, u64)> for PopulationReference {
    fn from_iter<I: IntoIterator<Item = (&'a str, u64)>>(iter: I) -> Self {
        let mut reference = PopulationReference::new();
        for (region, population) in iter {
            reference.insert(region, population);
        }
        reference
    }
}

/// Values of the group fields identifying one series. Empty means all regions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(Vec<String>);

impl GroupKey {
    pub fn all() -> Self {
        GroupKey(Vec::new())
    }

    pub fn new(values: Vec<String>) -> Self {
        GroupKey(values)
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }

    pub fn is_all(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "all regions")
        } else {
            write!(f, "{}", self.0.join(" / "))
        }
    }
}

/// Multiplier applied to `count / population`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleFactor(f64);

impl ScaleFactor {
    pub fn new(value: f64) -> PipelineResult<Self> {
        if !value.is_finite() || value <= 0.0 {
            return Err(PipelineError::Config(format!(
                "scale factor must be a positive number, got {}",
                value
            )));
        }
        Ok(ScaleFactor(value))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn rate(self, count: f64, population: u64) -> f64 {
        count / population as f64 * self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Measure {
    Count,
    Rate { scale: f64 },
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Measure::Count => write!(f, "count"),
            Measure::Rate { scale } => write!(f, "rate per {}", scale),
        }
    }
}

/// Ordered `(period, value)` pairs for one group key, one value per period.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedSeries {
    pub key: GroupKey,
    pub measure: Measure,
    points: BTreeMap<PeriodKey, f64>,
}

impl AggregatedSeries {
    pub fn new(key: GroupKey, measure: Measure) -> Self {
        Self { key, measure, points: BTreeMap::new() }
    }

    /// Adds `value` to the period, creating it when absent.
    pub fn add(&mut self, period: PeriodKey, value: f64) {
        *self.points.entry(period).or_insert(0.0) += value;
    }

    pub fn set(&mut self, period: PeriodKey, value: f64) {
        self.points.insert(period, value);
    }

    pub fn get(&self, period: PeriodKey) -> Option<f64> {
        self.points.get(&period).copied()
    }

    pub fn points(&self) -> impl Iterator<Item = (PeriodKey, f64)> + '_ {
        self.points.iter().map(|(p, v)| (*p, *v))
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.points.values().sum()
    }

    pub fn first_period(&self) -> Option<PeriodKey> {
        self.points.keys().next().copied()
    }

    pub fn last_period(&self) -> Option<PeriodKey> {
        self.points.keys().next_back().copied()
    }
}

/// One row of the consolidated rate table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Tabled)]
pub struct ConsolidatedRow {
    #[tabled(rename = "Region")]
    pub region: String,
    #[tabled(rename = "Period")]
    pub period: PeriodKey,
    #[tabled(rename = "Count")]
    pub count: u64,
    #[tabled(rename = "Population")]
    pub population: u64,
    #[tabled(rename = "Rate")]
    pub rate: f64,
    /// Full group key when rates are grouped by more than the region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[tabled(skip)]
    pub group: Option<String>,
}

#[derive(Debug, Serialize, Tabled, Clone)]
pub struct FacetRow {
    #[serde(rename = "Rank")]
    #[tabled(rename = "Rank")]
    pub rank: usize,
    #[serde(rename = "Label")]
    #[tabled(rename = "Label")]
    pub label: String,
    #[serde(rename = "Count")]
    #[tabled(rename = "Count")]
    pub count: String,
}

#[derive(Debug, Serialize, Tabled, Clone)]
pub struct MonthRow {
    #[serde(rename = "Period")]
    #[tabled(rename = "Period")]
    pub period: String,
    #[serde(rename = "Count")]
    #[tabled(rename = "Count")]
    pub count: String,
}

#[derive(Debug, Serialize, Tabled, Clone)]
pub struct RateRankingRow {
    #[serde(rename = "Rank")]
    #[tabled(rename = "Rank")]
    pub rank: usize,
    #[serde(rename = "Region")]
    #[tabled(rename = "Region")]
    pub region: String,
    #[serde(rename = "Population")]
    #[tabled(rename = "Population")]
    pub population: String,
    #[serde(rename = "Months")]
    #[tabled(rename = "Months")]
    pub months: usize,
    #[serde(rename = "TotalRate")]
    #[tabled(rename = "TotalRate")]
    pub total_rate: String,
}

#[derive(Debug, Serialize, Tabled, Clone)]
pub struct ForecastRow {
    #[serde(rename = "Key")]
    #[tabled(rename = "Key")]
    pub key: String,
    #[serde(rename = "Measure")]
    #[tabled(rename = "Measure")]
    pub measure: String,
    #[serde(rename = "LastPeriod")]
    #[tabled(rename = "LastPeriod")]
    pub last_period: String,
    #[serde(rename = "Model")]
    #[tabled(rename = "Model")]
    pub model: String,
    #[serde(rename = "Forecast")]
    #[tabled(rename = "Forecast")]
    pub forecast: String,
}

#[derive(Debug, Serialize)]
pub struct SummaryStats {
    pub loaded_rows: usize,
    pub skipped_rows: usize,
    pub normalized_rows: usize,
    pub unparseable_dates: usize,
    pub out_of_range_dates: usize,
    pub total_regions: usize,
    pub total_periods: usize,
    pub first_period: Option<String>,
    pub last_period: Option<String>,
    pub avg_monthly_notifications: f64,
    /// `None` when no population rates were computed in this run.
    pub unmatched_population_rows: Option<usize>,
    pub unmatched_regions: Option<usize>,
}
