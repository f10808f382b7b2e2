use crate::error::PipelineResult;
use crate::types::{DateRange, PeriodKey, Table};
use crate::util::parse_date_safe;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub input_rows: usize,
    pub unparseable: usize,
    pub out_of_range: usize,
    pub retained: usize,
}

/// Parses `date_field`, drops rows that fail to parse or fall outside
/// `valid_range`, and writes the `YYYY-MM` period of each retained row into
/// `period_field_out` (appended, or overwritten when it already exists).
///
/// An empty table is returned unchanged without checking the schema.
pub fn normalize(
    table: &Table,
    date_field: &str,
    period_field_out: &str,
    valid_range: &DateRange,
) -> PipelineResult<(Table, NormalizeReport)> {
    if table.is_empty() {
        return Ok((table.clone(), NormalizeReport::default()));
    }
    let date_col = table.require_column(date_field)?;

    let mut headers = table.headers().to_vec();
    let period_col = match table.column(period_field_out) {
        Some(idx) => idx,
        None => {
            headers.push(period_field_out.to_string());
            headers.len() - 1
        }
    };

    let mut out = Table::new(headers);
    let mut report = NormalizeReport { input_rows: table.len(), ..Default::default() };
    for row in table.rows() {
        let Some(date) = parse_date_safe(Some(row[date_col].as_str())) else {
            report.unparseable += 1;
            continue;
        };
        if !valid_range.contains(date) {
            report.out_of_range += 1;
            continue;
        }
        let mut cells = row.to_vec();
        let period = PeriodKey::from_date(date).to_string();
        if period_col < cells.len() {
            cells[period_col] = period;
        } else {
            cells.push(period);
        }
        out.push_row(cells);
    }
    report.retained = out.len();

    log::info!(
        "normalized {} rows: {} retained, {} unparseable dates, {} outside {}..={}",
        report.input_rows,
        report.retained,
        report.unparseable,
        report.out_of_range,
        valid_range.min(),
        valid_range.max()
    );
    Ok((out, report))
}
