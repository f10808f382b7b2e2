use crate::error::{PipelineError, PipelineResult};
use crate::types::{PopulationReference, Table};
use crate::util::{canonical_header, parse_population};
use csv::{ReaderBuilder, Trim, WriterBuilder};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

pub const POPULATION_REGION: &str = "municipio";
pub const POPULATION_COUNT: &str = "populacao";

/// `Name: 2.315.560` or `Name 90.000`.
static POPULATION_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+?):?\s([\d.,]+)").expect("valid population line pattern"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub total_rows: usize,
    pub loaded_rows: usize,
    pub skipped_rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PopulationReport {
    pub total_rows: usize,
    pub loaded: usize,
    pub invalid_population: usize,
    pub duplicate_regions: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionReport {
    pub written: usize,
    pub skipped_lines: usize,
}

/// UTF-8 when valid, ISO-8859-1 otherwise. Every byte sequence is valid
/// Latin-1, so accented names from legacy exports survive the decode.
fn decode_cell(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Picks the delimiter of the header line: `preferred` when it occurs,
/// otherwise the first of `;`, `,` or tab that does.
fn sniff_delimiter(path: &Path, preferred: u8) -> u8 {
    let Ok(bytes) = std::fs::read(path) else {
        return preferred;
    };
    let header = bytes.split(|&b| b == b'\n').next().unwrap_or_default();
    if header.contains(&preferred) {
        return preferred;
    }
    match [b';', b',', b'\t'].into_iter().find(|d| header.contains(d)) {
        Some(found) => {
            log::info!(
                "{}: header has no '{}', using '{}' as delimiter",
                path.display(),
                preferred as char,
                found as char
            );
            found
        }
        None => preferred,
    }
}

/// Reads a delimited file into a [`Table`].
///
/// Rows wider than the header are skipped; narrower rows are padded with
/// empty cells. Only a missing or unreadable file (or header) is an error.
pub fn load_table(path: &Path, delimiter: u8) -> PipelineResult<(Table, LoadReport)> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(Trim::All)
        .from_path(path)
        .map_err(|e| PipelineError::load(path, e))?;

    let headers: Vec<String> = rdr
        .byte_headers()
        .map_err(|e| PipelineError::load(path, e))?
        .iter()
        .map(|h| decode_cell(h).trim_start_matches('\u{feff}').to_string())
        .collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(PipelineError::load(path, "file has no header line"));
    }

    let width = headers.len();
    let mut table = Table::new(headers);
    let mut report = LoadReport::default();

    for result in rdr.byte_records() {
        report.total_rows += 1;
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                log::debug!("{}: skipping unreadable row {}: {}", path.display(), report.total_rows, e);
                report.skipped_rows += 1;
                continue;
            }
        };
        if record.len() > width {
            log::debug!(
                "{}: skipping row {} with {} fields (expected {})",
                path.display(),
                report.total_rows,
                record.len(),
                width
            );
            report.skipped_rows += 1;
            continue;
        }
        table.push_row(
            record
                .iter()
                .map(decode_cell)
                .collect(),
        );
        report.loaded_rows += 1;
    }

    if report.skipped_rows > 0 {
        log::warn!(
            "{}: skipped {} malformed rows out of {}",
            path.display(),
            report.skipped_rows,
            report.total_rows
        );
    }
    log::info!("{}: loaded {} rows", path.display(), report.loaded_rows);
    Ok((table, report))
}

/// Loads a table, reporting failures and falling back to an empty table so
/// later stages produce empty results instead of aborting.
pub fn load_table_or_empty(path: &Path, delimiter: u8, label: &str) -> (Table, LoadReport) {
    match load_table(path, delimiter) {
        Ok(loaded) => loaded,
        Err(e) => {
            log::error!("{} unavailable: {}", label, e);
            eprintln!("Failed to load {}: {}", label, e);
            (Table::default(), LoadReport::default())
        }
    }
}

/// Loads the region → population reference.
///
/// Headers are matched after [`canonical_header`]; a file with exactly two
/// unrecognized columns is read positionally as (region, population). The
/// delimiter falls back to whichever of `;`, `,` or tab the header uses.
pub fn load_population(
    path: &Path,
    delimiter: u8,
) -> PipelineResult<(PopulationReference, PopulationReport)> {
    let (table, load) = load_table(path, sniff_delimiter(path, delimiter))?;
    let canonical: Vec<String> = table.headers().iter().map(|h| canonical_header(h)).collect();
    let find = |name: &str| canonical.iter().position(|h| h == name);

    let (region_col, pop_col) = match (find(POPULATION_REGION), find(POPULATION_COUNT)) {
        (Some(r), Some(p)) => (r, p),
        _ if canonical.len() == 2 => {
            log::warn!(
                "{}: headers {:?} not recognized, reading columns as (region, population)",
                path.display(),
                table.headers()
            );
            (0, 1)
        }
        (None, _) => return Err(PipelineError::schema(POPULATION_REGION, &canonical)),
        (_, None) => return Err(PipelineError::schema(POPULATION_COUNT, &canonical)),
    };

    let mut reference = PopulationReference::new();
    let mut report = PopulationReport { total_rows: load.total_rows, ..Default::default() };
    for row in table.rows() {
        let region = row[region_col].trim();
        let Some(population) = parse_population(Some(row[pop_col].as_str())) else {
            report.invalid_population += 1;
            continue;
        };
        if region.is_empty() {
            report.invalid_population += 1;
            continue;
        }
        if reference.insert(region, population) {
            report.loaded += 1;
        } else {
            report.duplicate_regions += 1;
        }
    }

    if report.invalid_population > 0 {
        log::warn!(
            "{}: dropped {} rows without a valid population",
            path.display(),
            report.invalid_population
        );
    }
    if report.duplicate_regions > 0 {
        log::warn!(
            "{}: {} duplicate regions ignored (first value kept)",
            path.display(),
            report.duplicate_regions
        );
    }
    Ok((reference, report))
}

/// Converts a plain-text population listing into the CSV read by
/// [`load_population`].
pub fn convert_population_text(input: &Path, output: &Path) -> PipelineResult<ConversionReport> {
    let text = std::fs::read_to_string(input).map_err(|e| PipelineError::load(input, e))?;
    let mut wtr = WriterBuilder::new().from_path(output)?;
    wtr.write_record(["Município", "População"])?;

    let mut report = ConversionReport::default();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some(caps) = POPULATION_LINE.captures(line) else {
            report.skipped_lines += 1;
            continue;
        };
        let region = caps[1].trim();
        let population: String = caps[2].chars().filter(|c| c.is_ascii_digit()).collect();
        if region.is_empty() || population.is_empty() {
            report.skipped_lines += 1;
            continue;
        }
        wtr.write_record([region, population.as_str()])?;
        report.written += 1;
    }
    wtr.flush()?;
    log::info!(
        "{} → {}: {} regions written, {} lines skipped",
        input.display(),
        output.display(),
        report.written,
        report.skipped_lines
    );
    Ok(report)
}
