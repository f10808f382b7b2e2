// Pipeline configuration: defaults, optional JSON file, validation.
//
// Command-line flags are applied on top of the loaded value in `main.rs`.

use crate::error::{PipelineError, PipelineResult};
use crate::types::{DateRange, ScaleFactor};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Column names of the notifications file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationColumns {
    pub region: String,
    pub date: String,
    pub symptoms: String,
    pub demographic: String,
    pub vaccine_dose: String,
}

impl Default for NotificationColumns {
    fn default() -> Self {
        Self {
            region: "municipioNotificacao".to_string(),
            date: "dataNotificacao".to_string(),
            symptoms: "sintomas".to_string(),
            demographic: "racaCor".to_string(),
            vaccine_dose: "codigoDosesVacina".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub notifications_path: PathBuf,
    pub notifications_delimiter: char,
    pub population_path: PathBuf,
    pub population_delimiter: char,
    pub columns: NotificationColumns,
    pub period_field: String,
    pub valid_from: NaiveDate,
    pub valid_to: NaiveDate,
    /// No default: rates are only computed when this is set explicitly.
    pub scale_factor: Option<f64>,
    pub horizon_days: i64,
    pub top_n: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            notifications_path: PathBuf::from("dados_reduzidos_sampled.csv"),
            notifications_delimiter: ';',
            population_path: PathBuf::from("municipios_populacao.csv"),
            population_delimiter: ',',
            columns: NotificationColumns::default(),
            period_field: "ano_mes".to_string(),
            valid_from: NaiveDate::from_ymd_opt(2022, 1, 1).unwrap_or(NaiveDate::MIN),
            valid_to: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap_or(NaiveDate::MAX),
            scale_factor: None,
            horizon_days: 30,
            top_n: 10,
        }
    }
}

impl PipelineConfig {
    /// Reads a JSON config file; absent keys fall back to the defaults.
    pub fn from_file(path: &Path) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::load(path, e))?;
        let cfg: PipelineConfig = serde_json::from_str(&text)?;
        Ok(cfg)
    }

    pub fn load(path: Option<&Path>) -> PipelineResult<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        self.valid_range()?;
        self.notifications_delimiter()?;
        self.population_delimiter()?;
        if self.horizon_days <= 0 {
            return Err(PipelineError::Config(format!(
                "horizon_days must be positive, got {}",
                self.horizon_days
            )));
        }
        if self.period_field.trim().is_empty() {
            return Err(PipelineError::Config("period_field must not be empty".to_string()));
        }
        if let Some(scale) = self.scale_factor {
            ScaleFactor::new(scale)?;
        }
        Ok(())
    }

    pub fn valid_range(&self) -> PipelineResult<DateRange> {
        DateRange::new(self.valid_from, self.valid_to)
    }

    /// The configured scale factor, required by every rate computation.
    pub fn scale(&self) -> PipelineResult<ScaleFactor> {
        let value = self.scale_factor.ok_or_else(|| {
            PipelineError::Config(
                "a scale factor is required for population rates (--scale or \"scale_factor\")"
                    .to_string(),
            )
        })?;
        ScaleFactor::new(value)
    }

    pub fn notifications_delimiter(&self) -> PipelineResult<u8> {
        delimiter_byte(self.notifications_delimiter)
    }

    pub fn population_delimiter(&self) -> PipelineResult<u8> {
        delimiter_byte(self.population_delimiter)
    }
}

fn delimiter_byte(c: char) -> PipelineResult<u8> {
    if c.is_ascii() {
        Ok(c as u8)
    } else {
        Err(PipelineError::Config(format!("delimiter '{}' is not ASCII", c)))
    }
}
